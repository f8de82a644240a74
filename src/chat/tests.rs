use super::*;
use crate::embeddings::HashEmbedder;
use crate::web::SearchResult;
use serde_json::json;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Records every input sequence and answers with fixed Markdown
struct RecordingModel {
    answer: String,
    calls: Mutex<Vec<Vec<Part>>>,
}

impl RecordingModel {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Vec<Part>> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl GenerativeModel for RecordingModel {
    fn generate(&self, parts: &[Part]) -> Result<String> {
        self.calls.lock().expect("calls lock").push(parts.to_vec());
        Ok(self.answer.clone())
    }
}

struct FailingModel;

impl GenerativeModel for FailingModel {
    fn generate(&self, _parts: &[Part]) -> Result<String> {
        Err(RagError::ExternalService("generation unavailable".to_string()))
    }
}

struct NoSearch;

impl SearchProvider for NoSearch {
    fn is_available(&self) -> bool {
        false
    }

    fn search(&self, _query: &str, _num_results: usize) -> Result<Vec<SearchResult>> {
        panic!("search must not be called without credentials");
    }
}

struct FixedResults(Vec<SearchResult>);

impl SearchProvider for FixedResults {
    fn search(&self, _query: &str, num_results: usize) -> Result<Vec<SearchResult>> {
        Ok(self.0.iter().take(num_results).cloned().collect())
    }
}

struct NoPages;

impl PageRasterizer for NoPages {
    fn rasterize(&self, _document: &Path) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 200, 10]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

fn service(
    temp_dir: &TempDir,
    model: Option<Arc<dyn GenerativeModel>>,
    provider: Arc<dyn SearchProvider>,
) -> RagService {
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    let deps = ServiceDeps {
        embedder: Arc::new(HashEmbedder::new(128).expect("embedder")),
        model,
        search_provider: provider,
        rasterizer: Arc::new(NoPages),
    };
    RagService::new(config, deps)
}

fn request(text: &str) -> ChatRequest {
    ChatRequest {
        text: text.to_string(),
        ..ChatRequest::default()
    }
}

async fn ingest_text(service: &RagService, dir: &TempDir, name: &str, content: &str) {
    let source = dir.path().join(name);
    std::fs::write(&source, content).expect("write source");
    service.ingest_file(source).await.expect("ingest");
}

#[test]
fn markdown_is_rendered_to_html() {
    let html = render_markdown("**Revenue** grew\n\n- north\n- south");
    assert!(html.contains("<strong>Revenue</strong>"));
    assert!(html.contains("<li>north</li>"));
}

#[test]
fn api_keys_ignore_blank_values() {
    let keys = ApiKeys {
        gemini: None,
        serpapi: Some("  ".to_string()),
    };
    let temp_dir = TempDir::new().expect("temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    let deps = ServiceDeps::from_config(&config, keys).expect("deps");
    assert!(deps.model.is_none());
    assert!(!deps.search_provider.is_available());
}

#[tokio::test]
async fn chat_answers_from_local_context() {
    let temp_dir = TempDir::new().expect("temp dir");
    let sources = TempDir::new().expect("sources dir");
    let model = Arc::new(RecordingModel::new("**Revenue** rose by 4%."));
    let service = service(
        &temp_dir,
        Some(Arc::clone(&model) as Arc<dyn GenerativeModel>),
        Arc::new(NoSearch),
    );
    ingest_text(
        &service,
        &sources,
        "report.txt",
        "Quarterly revenue rose by four percent.\nHeadcount stayed flat.",
    )
    .await;

    let mut history = service.new_history();
    let response = service
        .chat(request("how did quarterly revenue change?"), &mut history)
        .await
        .expect("chat");

    assert_eq!(response.response.trim(), "<p><strong>Revenue</strong> rose by 4%.</p>");
    assert_eq!(response.context_docs.len(), 1);
    assert!(response.context_docs[0].contains("Quarterly revenue"));
    assert!(!response.web_search_performed);
    assert_eq!(response.web_results_count, 0);
    assert_eq!(response.search_sources, None);

    assert_eq!(history.len(), 1);
    let turn = history.turns().next().expect("turn");
    assert_eq!(turn.bot, "**Revenue** rose by 4%.");

    let calls = model.calls();
    assert_eq!(calls.len(), 1);
    match calls[0].as_slice() {
        [Part::Text(prompt), Part::Text(user)] => {
            assert!(prompt.contains("Quarterly revenue rose"));
            assert_eq!(user, "how did quarterly revenue change?");
        }
        other => panic!("unexpected parts: {other:?}"),
    }
}

#[tokio::test]
async fn image_attachment_is_sent_last() {
    let temp_dir = TempDir::new().expect("temp dir");
    let model = Arc::new(RecordingModel::new("a green square"));
    let service = service(
        &temp_dir,
        Some(Arc::clone(&model) as Arc<dyn GenerativeModel>),
        Arc::new(NoSearch),
    );

    let mut history = service.new_history();
    let response = service
        .chat(
            ChatRequest {
                text: "describe this".to_string(),
                image: Some(png_bytes()),
                web_search: false,
            },
            &mut history,
        )
        .await
        .expect("chat");

    assert!(response.context_docs.is_empty());
    let calls = model.calls();
    assert_eq!(calls[0].len(), 3);
    assert!(matches!(&calls[0][0], Part::Text(prompt) if prompt.contains("No local context found.")));
    assert!(matches!(&calls[0][1], Part::Text(user) if user == "describe this"));
    assert!(calls[0][2].is_image());
}

#[tokio::test]
async fn invalid_input_is_rejected_before_generation() {
    let temp_dir = TempDir::new().expect("temp dir");
    let model = Arc::new(RecordingModel::new("unused"));
    let service = service(
        &temp_dir,
        Some(Arc::clone(&model) as Arc<dyn GenerativeModel>),
        Arc::new(NoSearch),
    );
    let mut history = service.new_history();

    assert!(matches!(
        service.chat(request("   "), &mut history).await,
        Err(RagError::InvalidInput(_))
    ));
    assert!(matches!(
        service
            .chat(
                ChatRequest {
                    text: "what is this".to_string(),
                    image: Some(b"plain text".to_vec()),
                    web_search: false,
                },
                &mut history,
            )
            .await,
        Err(RagError::InvalidInput(_))
    ));
    assert!(model.calls().is_empty());
    assert!(history.is_empty());
}

#[tokio::test]
async fn generation_failure_is_the_only_hard_error() {
    let temp_dir = TempDir::new().expect("temp dir");
    let service = service(&temp_dir, Some(Arc::new(FailingModel)), Arc::new(NoSearch));
    let mut history = service.new_history();

    let result = service
        .chat(request("latest news on rates"), &mut history)
        .await;

    assert!(matches!(result, Err(RagError::ExternalService(_))));
    assert!(history.is_empty());
}

#[tokio::test]
async fn chat_without_model_is_unavailable() {
    let temp_dir = TempDir::new().expect("temp dir");
    let service = service(&temp_dir, None, Arc::new(NoSearch));
    let mut history = service.new_history();

    assert!(matches!(
        service.chat(request("hello"), &mut history).await,
        Err(RagError::ExternalService(_))
    ));
}

#[tokio::test]
async fn web_search_reports_sources_and_crawls() {
    let server = MockServer::start().await;
    for page in ["one", "two", "three", "four"] {
        Mock::given(method("GET"))
            .and(path(format!("/{page}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    format!("<html><head><title>{page}</title></head><body><p>Body of {page}</p></body></html>")
                        .into_bytes(),
                    "text/html; charset=utf-8",
                ),
            )
            .mount(&server)
            .await;
    }
    let results: Vec<SearchResult> = ["one", "two", "three", "four"]
        .iter()
        .map(|page| SearchResult {
            title: format!("Result {page}"),
            url: format!("{}/{page}", server.uri()),
            snippet: format!("snippet {page}"),
            source: "test".to_string(),
        })
        .collect();

    let temp_dir = TempDir::new().expect("temp dir");
    let model = Arc::new(RecordingModel::new("Here is the news."));
    let service = service(
        &temp_dir,
        Some(Arc::clone(&model) as Arc<dyn GenerativeModel>),
        Arc::new(FixedResults(results)),
    );
    let mut history = service.new_history();

    let response = service
        .chat(request("what is the latest on interest rates"), &mut history)
        .await
        .expect("chat");

    assert!(response.web_search_performed);
    assert_eq!(response.web_results_count, 4);
    assert_eq!(response.crawled_pages, 3);
    let sources = response.search_sources.expect("sources");
    assert_eq!(sources.len(), 3);
    assert_eq!(sources[0].title, "Result one");
    assert!(response.context_docs.is_empty());

    let calls = model.calls();
    let Part::Text(prompt) = &calls[0][0] else {
        panic!("prompt should be text");
    };
    assert!(prompt.contains("web search results"));
    assert!(prompt.contains("Content: Body of one..."));
    assert!(prompt.contains("Content: Body of three..."));
    assert!(!prompt.contains("Content: Body of four"));
}

#[tokio::test]
async fn repeated_query_is_evaluated_against_feedback() {
    let temp_dir = TempDir::new().expect("temp dir");
    let service = service(
        &temp_dir,
        Some(Arc::new(RecordingModel::new("rates were unchanged this month"))),
        Arc::new(NoSearch),
    );

    let record = service
        .submit_feedback(json!({
            "query": "what happened to rates",
            "retrieved_docs": [],
            "generated_response": "rates were unchanged this month",
            "feedback_rating": "positive",
        }))
        .expect("feedback");
    assert!(record.timestamp.ends_with('Z'));

    let mut history = service.new_history();
    service
        .chat(request("what happened to rates"), &mut history)
        .await
        .expect("chat");

    let trace = std::fs::read_to_string(service.config().evaluation_log_path()).expect("trace");
    let lines: Vec<&str> = trace.lines().collect();
    assert_eq!(lines.len(), 1);
    let evaluation: Value = serde_json::from_str(lines[0]).expect("trace json");
    assert_eq!(evaluation["previous_query"], "what happened to rates");
    assert_eq!(evaluation["metrics"]["BLEU"], 1.0);
}

#[tokio::test]
async fn invalid_feedback_is_rejected_without_writing() {
    let temp_dir = TempDir::new().expect("temp dir");
    let service = service(&temp_dir, None, Arc::new(NoSearch));

    assert!(matches!(
        service.submit_feedback(json!({"query": "q"})),
        Err(RagError::InvalidInput(_))
    ));
    assert!(!service.config().feedback_log_path().exists());
}

#[tokio::test]
async fn status_follows_rebuilds() {
    let temp_dir = TempDir::new().expect("temp dir");
    let sources = TempDir::new().expect("sources dir");
    let service = service(&temp_dir, None, Arc::new(NoSearch));

    assert_eq!(service.index_status().expect("status"), None);

    ingest_text(&service, &sources, "notes.md", "alpha beta gamma").await;
    let first = service.index_status().expect("status").expect("generation");
    assert_eq!(first.chunks, 1);
    assert_eq!(first.dimension, 128);

    let summary = service.rebuild().await.expect("rebuild");
    let second = service.index_status().expect("status").expect("generation");
    assert_eq!(second.generation, summary.generation);
    assert_ne!(second.generation, first.generation);
}
