//! Retrieval and generation quality metrics


use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashMap;
use std::sync::LazyLock;

const BLEU_MAX_ORDER: usize = 4;

/// Tokens this short are compared unstemmed
const MIN_STEM_LEN: usize = 4;

static STEMMER: LazyLock<Stemmer> = LazyLock::new(|| Stemmer::create(Algorithm::English));

/// 1/rank of the first retrieved doc containing `gold`, or 0.0
///
/// An absent or blank gold document never matches.
#[inline]
pub fn reciprocal_rank(gold: Option<&str>, retrieved: &[String]) -> f64 {
    let Some(gold) = gold.map(str::trim).filter(|gold| !gold.is_empty()) else {
        return 0.0;
    };

    retrieved
        .iter()
        .position(|doc| doc.trim().contains(gold))
        .map_or(0.0, |index| 1.0 / (index + 1) as f64)
}

/// Sentence BLEU-4 of `candidate` against a single `reference`
///
/// Whitespace tokens, uniform weights, brevity penalty, no smoothing: any
/// n-gram order with zero matches yields 0.0.
#[inline]
pub fn bleu(reference: &str, candidate: &str) -> f64 {
    let reference: Vec<&str> = reference.split_whitespace().collect();
    let candidate: Vec<&str> = candidate.split_whitespace().collect();

    if candidate.is_empty() || reference.is_empty() {
        return 0.0;
    }

    let mut log_precision_sum = 0.0;
    for order in 1..=BLEU_MAX_ORDER {
        let candidate_counts = ngram_counts(&candidate, order);
        let total: usize = candidate_counts.values().sum();
        if total == 0 {
            return 0.0;
        }

        let reference_counts = ngram_counts(&reference, order);
        let clipped: usize = candidate_counts
            .iter()
            .map(|(gram, count)| (*count).min(reference_counts.get(gram).copied().unwrap_or(0)))
            .sum();
        if clipped == 0 {
            return 0.0;
        }

        log_precision_sum += (clipped as f64 / total as f64).ln();
    }

    let candidate_len = candidate.len() as f64;
    let reference_len = reference.len() as f64;
    let brevity_penalty = if candidate_len > reference_len {
        1.0
    } else {
        (1.0 - reference_len / candidate_len).exp()
    };

    brevity_penalty * (log_precision_sum / BLEU_MAX_ORDER as f64).exp()
}

/// ROUGE-L F-measure over lowercase alphanumeric tokens, stemmed with the
/// English Snowball stemmer
#[inline]
pub fn rouge_l_f1(reference: &str, candidate: &str) -> f64 {
    let reference = rouge_tokens(reference);
    let candidate = rouge_tokens(candidate);

    if reference.is_empty() || candidate.is_empty() {
        return 0.0;
    }

    let lcs = lcs_length(&reference, &candidate);
    if lcs == 0 {
        return 0.0;
    }

    let precision = lcs as f64 / candidate.len() as f64;
    let recall = lcs as f64 / reference.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

fn ngram_counts<'a>(tokens: &'a [&'a str], order: usize) -> HashMap<&'a [&'a str], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(order) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

fn rouge_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.len() >= MIN_STEM_LEN {
                STEMMER.stem(token).into_owned()
            } else {
                token.to_string()
            }
        })
        .collect()
}

fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut previous = vec![0; b.len() + 1];
    let mut current = vec![0; b.len() + 1];

    for x in a {
        for (j, y) in b.iter().enumerate() {
            current[j + 1] = if x == y {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
