use super::*;
use crate::embeddings::{Embedding, HashEmbedder};
use crate::index::{Chunk, DocumentMapping, IndexStore, VectorIndex};
use crate::web::{CrawlerConfig, SearchCache, SearchProvider};
use chrono::{TimeDelta, Utc};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn turn(i: usize) -> ConversationTurn {
    ConversationTurn {
        user: format!("question {i}"),
        bot: format!("answer {i}"),
    }
}

fn result(title: &str, url: &str) -> SearchResult {
    SearchResult {
        title: title.to_string(),
        url: url.to_string(),
        snippet: format!("about {title}"),
        source: "test".to_string(),
    }
}

struct FixedResults(Vec<SearchResult>);

impl SearchProvider for FixedResults {
    fn search(&self, _query: &str, num_results: usize) -> Result<Vec<SearchResult>> {
        Ok(self.0.iter().take(num_results).cloned().collect())
    }
}

struct Fixture {
    _temp_dir: TempDir,
    assembler: ContextAssembler,
}

fn fixture(corpus: &[&str], web: Vec<SearchResult>) -> Fixture {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    let embedder = Arc::new(HashEmbedder::new(128).expect("embedder"));

    let store = IndexStore::new(config.index_dir());
    if !corpus.is_empty() {
        let texts: Vec<String> = corpus.iter().map(|t| (*t).to_string()).collect();
        let vectors: Vec<Embedding> = embedder.embed_batch(&texts).expect("embed corpus");
        let index = VectorIndex::build(&vectors, 4).expect("build");
        let mapping = DocumentMapping::new(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| Chunk::new("corpus.txt", i, t.clone()))
                .collect(),
        );
        store.publish(&index, &mapping).expect("publish");
    }

    let searcher = WebSearcher::new(
        Arc::new(FixedResults(web)),
        SearchCache::new(config.web_cache_path(), TimeDelta::hours(24)),
    );
    let crawler = WebCrawler::new(CrawlerConfig {
        timeout: Duration::from_secs(5),
        ..CrawlerConfig::default()
    });

    let assembler = ContextAssembler::new(
        &config,
        embedder,
        Arc::new(IndexHandle::new(store)),
        searcher,
        crawler,
    );

    Fixture {
        _temp_dir: temp_dir,
        assembler,
    }
}

#[test]
fn recency_keywords_trigger_web_search() {
    assert!(should_use_web_search("what's the latest news today"));
    assert!(should_use_web_search("BREAKING: markets"));
    assert!(should_use_web_search("Please look up the unemployment rate"));
    assert!(!should_use_web_search("summarize chapter 3"));
    assert!(!should_use_web_search("explain the table"));
}

#[test]
fn history_keeps_most_recent_turns() {
    let mut history = ConversationHistory::new(5);
    for i in 0..6 {
        history.push(turn(i));
    }

    assert_eq!(history.len(), 5);
    let users: Vec<&str> = history.turns().map(|t| t.user.as_str()).collect();
    assert_eq!(
        users,
        vec!["question 1", "question 2", "question 3", "question 4", "question 5"]
    );
}

#[test]
fn history_from_stored_turns_is_bounded() {
    let history = ConversationHistory::from_turns((0..9).map(turn), 3);
    assert_eq!(history.len(), 3);
    assert_eq!(history.turns().next().map(|t| t.user.as_str()), Some("question 6"));
    assert_eq!(ConversationHistory::new(0).max_turns(), 1);
}

#[test]
fn history_renders_alternating_blocks() {
    let history = ConversationHistory::from_turns((0..2).map(turn), 5);
    assert_eq!(
        history.render(),
        "User: question 0\nAssistant: answer 0\n\nUser: question 1\nAssistant: answer 1"
    );
}

#[test]
fn prompt_without_local_docs_uses_placeholder() {
    let prompt = render_prompt(&ConversationHistory::new(5), &[], &[]);

    assert!(prompt.contains("[Retrieved Context from Knowledge Base]\nNo local context found."));
    assert!(!prompt.contains(WEB_CONTEXT_NOTE));
}

#[test]
fn prompt_joins_docs_and_web_results() {
    let history = ConversationHistory::from_turns([turn(7)], 5);
    let docs = vec!["doc one".to_string(), "doc two".to_string()];
    let web = vec!["Title: A".to_string()];
    let prompt = render_prompt(&history, &docs, &web);

    assert!(prompt.contains("[Conversation History]\nUser: question 7\nAssistant: answer 7"));
    assert!(prompt.contains("doc one\n---\ndoc two"));
    assert!(prompt.contains(&format!("{WEB_CONTEXT_NOTE}\nTitle: A")));

    let history_at = prompt.find("[Conversation History]").expect("history section");
    let docs_at = prompt.find("doc one").expect("docs section");
    let web_at = prompt.find("Title: A").expect("web section");
    assert!(history_at < docs_at && docs_at < web_at);
}

#[test]
fn web_result_block_previews_crawled_body() {
    let page = PageContent {
        url: "https://a.example".to_string(),
        title: "A".to_string(),
        content: "abcdefghij".to_string(),
        timestamp: Utc::now(),
        content_length: 10,
    };
    let r = result("A", "https://a.example");

    assert_eq!(
        format_web_result(&r, None, 4),
        "Title: A\nSnippet: about A\nURL: https://a.example"
    );
    assert_eq!(
        format_web_result(&r, Some(&page), 4),
        "Title: A\nSnippet: about A\nURL: https://a.example\nContent: abcd..."
    );
}

#[test]
fn model_parts_order_is_context_text_image() {
    let context = AssembledContext {
        prompt: "CONTEXT".to_string(),
        ..AssembledContext::default()
    };
    let image = Part::InlineData {
        mime_type: "image/png".to_string(),
        data: vec![0],
    };

    let parts = model_parts(&context, "user text", Some(image.clone()));
    assert_eq!(
        parts,
        vec![Part::text("CONTEXT"), Part::text("user text"), image]
    );
    assert_eq!(model_parts(&context, "only text", None).len(), 2);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let fixture = fixture(&[], Vec::new());
    let result = fixture
        .assembler
        .assemble("   ", false, &ConversationHistory::new(5), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RagError::InvalidInput(_))));
}

#[tokio::test]
async fn no_index_yields_placeholder_context() {
    let fixture = fixture(&[], vec![result("ignored", "https://x.example")]);
    let context = fixture
        .assembler
        .assemble("summarize chapter 3", false, &ConversationHistory::new(5), &CancellationToken::new())
        .await
        .expect("assemble");

    assert!(context.local_docs.is_empty());
    assert!(!context.web_search_performed());
    assert!(context.prompt.contains(NO_LOCAL_CONTEXT));
}

#[tokio::test]
async fn local_hits_are_ranked_by_similarity() {
    let fixture = fixture(
        &[
            "unemployment fell in the northern region",
            "recipe for sourdough bread with rye flour",
            "wages grew while unemployment fell nationally",
        ],
        Vec::new(),
    );
    let context = fixture
        .assembler
        .assemble("unemployment fell", false, &ConversationHistory::new(5), &CancellationToken::new())
        .await
        .expect("assemble");

    assert_eq!(context.local_docs.len(), 3);
    assert!(context.local_docs[0].contains("unemployment"));
    assert_eq!(
        context.local_docs.last().map(String::as_str),
        Some("recipe for sourdough bread with rye flour")
    );
}

#[tokio::test]
async fn web_context_crawls_only_top_results() {
    let server = MockServer::start().await;
    for (route, title) in [("/one", "One"), ("/two", "Two"), ("/three", "Three"), ("/four", "Four")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("<title>{title}</title><p>{title} body text</p>").into_bytes(),
                "text/html",
            ))
            .mount(&server)
            .await;
    }

    let results = vec![
        result("One", &format!("{}/one", server.uri())),
        result("Two", &format!("{}/two", server.uri())),
        result("Three", &format!("{}/three", server.uri())),
        result("Four", &format!("{}/four", server.uri())),
    ];
    let fixture = fixture(&["some local doc"], results);
    let assembler = fixture.assembler.without_crawl_archive();

    let context = assembler
        .assemble("explain the data", true, &ConversationHistory::new(5), &CancellationToken::new())
        .await
        .expect("assemble");

    assert!(context.web_search_performed());
    assert_eq!(context.web_results.len(), 4);
    assert_eq!(context.crawled_pages, 3);
    assert!(context.web_results[0].ends_with("Content: One body text..."));
    assert!(!context.web_results[3].contains("Content:"));
    assert_eq!(context.all_context().len(), 5);
    assert!(context.prompt.contains(WEB_CONTEXT_NOTE));
}
