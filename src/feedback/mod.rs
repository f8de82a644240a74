//! Feedback log and near-duplicate query evaluation
//!
//! Every submitted rating is appended to a JSON-lines log that is never
//! rewritten. When a new turn completes, its query is compared with the
//! logged queries oldest first; the first one above the similarity
//! threshold is treated as a reference answer and quality metrics are
//! computed against it.

pub mod metrics;


use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::{RagError, Result};

/// Keys every feedback submission must carry once the timestamp is filled in
pub const REQUIRED_KEYS: [&str; 5] = [
    "timestamp",
    "query",
    "retrieved_docs",
    "generated_response",
    "feedback_rating",
];

const SCAN_BATCH: usize = 32;

/// One rated turn as stored in the feedback log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub timestamp: String,
    pub query: String,
    pub retrieved_docs: Vec<String>,
    pub generated_response: String,
    pub feedback_rating: Value,
    /// Additional client-supplied fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw feedback payload awaiting validation
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSubmission(Value);

impl FeedbackSubmission {
    #[inline]
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    /// Parse a JSON payload
    #[inline]
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map(Self)
            .map_err(|e| RagError::InvalidInput(format!("feedback is not valid JSON: {}", e)))
    }

    #[inline]
    pub fn validate(self) -> Result<FeedbackRecord> {
        self.validate_at(Utc::now())
    }

    /// Fill a missing timestamp with `now` and check the required keys
    #[inline]
    pub fn validate_at(self, now: DateTime<Utc>) -> Result<FeedbackRecord> {
        let Value::Object(mut fields) = self.0 else {
            return Err(RagError::InvalidInput(
                "feedback must be a JSON object".to_string(),
            ));
        };

        fields
            .entry("timestamp")
            .or_insert_with(|| Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)));

        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !fields.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(RagError::InvalidInput(format!(
                "missing keys in feedback data: {}",
                missing.join(", ")
            )));
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| RagError::InvalidInput(format!("malformed feedback: {}", e)))
    }
}

/// Metric values computed against a similar earlier turn
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    #[serde(rename = "MRR")]
    pub mrr: f64,
    #[serde(rename = "BLEU")]
    pub bleu: f64,
    #[serde(rename = "ROUGE-L")]
    pub rouge_l: f64,
}

/// Monitoring record written for every evaluated turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub current_query: String,
    pub previous_query: String,
    pub similarity: f32,
    pub current_response: String,
    pub previous_response: String,
    pub current_retrieved_docs: Vec<String>,
    pub previous_retrieved_docs: Vec<String>,
    pub metrics: EvaluationMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines file guarded by an exclusive file lock
#[derive(Debug, Clone)]
pub struct JsonLinesLog {
    path: PathBuf,
}

impl JsonLinesLog {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line
    #[inline]
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(record).context("Failed to serialize log record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let result = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());

        if let Err(e) = FileExt::unlock(&file) {
            warn!("Failed to release lock on {}: {}", self.path.display(), e);
        }
        result?;

        debug!("Appended record to {}", self.path.display());
        Ok(())
    }

    /// Every parseable record in file order; malformed lines are skipped
    #[inline]
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;

        let mut records = Vec::new();
        let mut read_error = None;
        for (number, line) in BufReader::new(&file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping malformed line {} of {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }

        if let Err(e) = FileExt::unlock(&file) {
            warn!("Failed to release lock on {}: {}", self.path.display(), e);
        }
        match read_error {
            Some(e) => Err(e.into()),
            None => Ok(records),
        }
    }
}

/// The persisted feedback corpus
#[derive(Debug, Clone)]
pub struct FeedbackLog {
    log: JsonLinesLog,
}

impl FeedbackLog {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonLinesLog::new(path),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.log.path()
    }

    #[inline]
    pub fn append(&self, record: &FeedbackRecord) -> Result<()> {
        self.log.append(record)?;
        info!("Logged feedback for query: {}", record.query);
        Ok(())
    }

    /// Validate a submission and append it
    #[inline]
    pub fn submit(&self, submission: FeedbackSubmission) -> Result<FeedbackRecord> {
        let record = submission.validate()?;
        self.append(&record)?;
        Ok(record)
    }

    /// All records, oldest first
    #[inline]
    pub fn records(&self) -> Result<Vec<FeedbackRecord>> {
        self.log.read_all()
    }
}

/// Compares finished turns against similar logged ones
pub struct FeedbackEvaluator {
    embedder: Arc<dyn Embedder>,
    feedback: FeedbackLog,
    trace: JsonLinesLog,
    threshold: f32,
}

impl FeedbackEvaluator {
    #[inline]
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            feedback: FeedbackLog::new(config.feedback_log_path()),
            trace: JsonLinesLog::new(config.evaluation_log_path()),
            threshold: config.feedback.similarity_threshold,
        }
    }

    #[inline]
    pub fn feedback_log(&self) -> &FeedbackLog {
        &self.feedback
    }

    #[inline]
    pub fn trace_log(&self) -> &JsonLinesLog {
        &self.trace
    }

    #[inline]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Evaluate a completed turn against the first similar logged query
    ///
    /// Returns `None` when no logged query is strictly above the threshold.
    /// A produced record is also appended to the evaluation trace.
    #[inline]
    pub fn evaluate_turn(
        &self,
        query: &str,
        retrieved_docs: &[String],
        response: &str,
    ) -> Result<Option<EvaluationRecord>> {
        let query_embedding = self.embedder.embed(query)?;
        let records: Vec<FeedbackRecord> = self
            .feedback
            .records()?
            .into_iter()
            .filter(|record| !record.query.trim().is_empty())
            .collect();

        debug!("Scanning {} logged queries for a similar one", records.len());

        for batch in records.chunks(SCAN_BATCH) {
            let queries: Vec<String> = batch.iter().map(|record| record.query.clone()).collect();
            let embeddings = self.embedder.embed_batch(&queries)?;

            let matched = batch
                .iter()
                .zip(&embeddings)
                .map(|(record, embedding)| (record, query_embedding.cosine_similarity(embedding)))
                .find(|(_, similarity)| *similarity > self.threshold);

            if let Some((previous, similarity)) = matched {
                let record = build_evaluation(query, retrieved_docs, response, previous, similarity);
                info!(
                    current_query = %record.current_query,
                    previous_query = %record.previous_query,
                    similarity = record.similarity,
                    mrr = record.metrics.mrr,
                    bleu = record.metrics.bleu,
                    rouge_l = record.metrics.rouge_l,
                    "Evaluated turn against similar feedback"
                );
                self.trace.append(&record)?;
                return Ok(Some(record));
            }
        }

        debug!("No logged query above similarity {}", self.threshold);
        Ok(None)
    }
}

fn build_evaluation(
    query: &str,
    retrieved_docs: &[String],
    response: &str,
    previous: &FeedbackRecord,
    similarity: f32,
) -> EvaluationRecord {
    let gold = previous.retrieved_docs.first().map(String::as_str);
    let metrics = EvaluationMetrics {
        mrr: metrics::reciprocal_rank(gold, retrieved_docs),
        bleu: metrics::bleu(&previous.generated_response, response),
        rouge_l: metrics::rouge_l_f1(&previous.generated_response, response),
    };

    EvaluationRecord {
        current_query: query.to_string(),
        previous_query: previous.query.clone(),
        similarity,
        current_response: response.to_string(),
        previous_response: previous.generated_response.clone(),
        current_retrieved_docs: retrieved_docs.to_vec(),
        previous_retrieved_docs: previous.retrieved_docs.clone(),
        metrics,
        timestamp: Utc::now(),
    }
}
