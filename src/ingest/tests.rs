use super::*;
use crate::embeddings::HashEmbedder;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

struct CountingModel {
    calls: AtomicUsize,
}

impl CountingModel {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl GenerativeModel for CountingModel {
    fn generate(&self, parts: &[Part]) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(parts.iter().any(Part::is_image));
        Ok(format!("summary number {call}"))
    }
}

struct FailingModel;

impl GenerativeModel for FailingModel {
    fn generate(&self, _parts: &[Part]) -> Result<String> {
        Err(RagError::ExternalService("quota exhausted".to_string()))
    }
}

struct FixedPages(usize);

impl PageRasterizer for FixedPages {
    fn rasterize(&self, _document: &Path) -> Result<Vec<Vec<u8>>> {
        Ok((0..self.0).map(|_| png_bytes()).collect())
    }
}

fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(1, 1, image::Rgb([0, 0, 0]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

fn test_config(base: &Path) -> Config {
    let mut config = Config {
        base_dir: base.to_path_buf(),
        ..Config::default()
    };
    config.chunking.chunk_size = 100;
    config.chunking.chunk_overlap = 0;
    config.chunking.boundary = ChunkBoundary::Characters;
    config.index.n_trees = 4;
    config
}

fn pipeline(config: &Config, model: Option<Arc<dyn GenerativeModel>>) -> IngestionPipeline {
    let embedder = Arc::new(HashEmbedder::new(64).expect("embedder"));
    IngestionPipeline::new(config, embedder, model, Arc::new(FixedPages(3))).with_pacing(
        SummaryPacing {
            page_delay: Duration::ZERO,
            document_cooldown: Duration::ZERO,
        },
    )
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write source file");
    path
}

#[test]
fn file_kind_dispatch() {
    assert_eq!(FileKind::from_path(Path::new("a.txt")), Some(FileKind::Text));
    assert_eq!(FileKind::from_path(Path::new("a.MD")), Some(FileKind::Text));
    assert_eq!(FileKind::from_path(Path::new("a.csv")), Some(FileKind::Tabular));
    assert_eq!(FileKind::from_path(Path::new("a.JPeG")), Some(FileKind::Image));
    assert_eq!(FileKind::from_path(Path::new("a.pdf")), Some(FileKind::Paged));
    assert_eq!(FileKind::from_path(Path::new("a.docx")), None);
    assert_eq!(FileKind::from_path(Path::new("Makefile")), None);
    assert!(FileKind::Paged.needs_model());
    assert!(!FileKind::Tabular.needs_model());
}

#[test]
fn text_file_is_indexed() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let text = "abcdefghij".repeat(35);
    let source = write_file(temp_dir.path(), "notes.txt", text.as_bytes());

    let outcome = pipeline(&config, None).ingest_file(&source).expect("ingest");

    assert_eq!(outcome.source_name, "notes.txt");
    assert_eq!(outcome.kind, Some(FileKind::Text));
    assert_eq!(outcome.state, IngestState::Indexed);
    assert_eq!(outcome.chunk_count, 4);
    assert!(config.knowledge_dir().join("notes.txt").exists());

    let generation = IndexStore::new(config.index_dir())
        .load_current()
        .expect("load")
        .expect("generation");
    assert_eq!(generation.mapping.len(), 4);
    assert!(
        generation
            .mapping
            .records()
            .iter()
            .all(|c| c.source_file == "notes.txt")
    );
}

#[test]
fn csv_rows_become_chunks() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let source = write_file(temp_dir.path(), "team.csv", b"name,role\nAda,Engineer\n");

    let outcome = pipeline(&config, None).ingest_file(&source).expect("ingest");
    assert_eq!(outcome.chunk_count, 1);

    let artifact = ArtifactStore::new(config.artifacts_dir())
        .load("team.csv")
        .expect("artifact");
    assert_eq!(artifact.file_type, "csv");
    assert_eq!(artifact.pages, vec!["Ada | Engineer"]);
}

#[test]
fn reingesting_from_knowledge_dir_is_a_no_op_copy() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    fs::create_dir_all(config.knowledge_dir()).expect("mkdir");
    let source = write_file(&config.knowledge_dir(), "inplace.txt", b"already here");

    let outcome = pipeline(&config, None).ingest_file(&source).expect("ingest");

    assert_eq!(outcome.state, IngestState::Indexed);
    assert_eq!(
        fs::read_to_string(&source).expect("read back"),
        "already here"
    );
}

#[test]
fn unsupported_type_stops_after_copy() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let source = write_file(temp_dir.path(), "slides.pptx", b"binary");

    let outcome = pipeline(&config, None).ingest_file(&source).expect("ingest");

    assert_eq!(outcome.state, IngestState::Copied);
    assert_eq!(outcome.rebuild, None);
    assert!(config.knowledge_dir().join("slides.pptx").exists());
    assert!(
        ArtifactStore::new(config.artifacts_dir())
            .source_names()
            .expect("names")
            .is_empty()
    );
    assert_eq!(
        IndexStore::new(config.index_dir())
            .current_id()
            .expect("current"),
        None
    );
}

#[test]
fn missing_file_is_an_input_error() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let result = pipeline(&config, None).ingest_file(&temp_dir.path().join("absent.txt"));
    assert!(matches!(result, Err(RagError::InvalidInput(_))));
}

#[test]
fn image_without_model_is_rejected() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let source = write_file(temp_dir.path(), "chart.png", &png_bytes());

    let result = pipeline(&config, None).ingest_file(&source);

    assert!(matches!(result, Err(RagError::ExternalService(_))));
    assert!(!config.artifacts_dir().join("chart.png.json").exists());
}

#[test]
fn image_is_summarized_into_one_chunk() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let source = write_file(temp_dir.path(), "chart.png", &png_bytes());
    let model = Arc::new(CountingModel::new());

    let outcome = pipeline(&config, Some(Arc::clone(&model) as Arc<dyn GenerativeModel>))
        .ingest_file(&source)
        .expect("ingest");

    assert_eq!(outcome.chunk_count, 1);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn pdf_pages_are_summarized_in_order() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let source = write_file(temp_dir.path(), "paper.pdf", b"%PDF-1.4");
    let model = Arc::new(CountingModel::new());

    let outcome = pipeline(&config, Some(Arc::clone(&model) as Arc<dyn GenerativeModel>))
        .ingest_file(&source)
        .expect("ingest");
    assert_eq!(outcome.chunk_count, 3);

    let artifact = ArtifactStore::new(config.artifacts_dir())
        .load("paper.pdf")
        .expect("artifact");
    assert_eq!(
        artifact.pages,
        vec!["summary number 0", "summary number 1", "summary number 2"]
    );
}

#[test]
fn summarization_failure_keeps_previous_state() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let text_source = write_file(temp_dir.path(), "notes.txt", b"some useful notes");
    let good = pipeline(&config, None);
    let before = good.ingest_file(&text_source).expect("ingest text");

    let image_source = write_file(temp_dir.path(), "chart.png", &png_bytes());
    let result = pipeline(&config, Some(Arc::new(FailingModel))).ingest_file(&image_source);

    assert!(matches!(result, Err(RagError::ExternalService(_))));
    let store = IndexStore::new(config.index_dir());
    assert_eq!(
        store.current_id().expect("current"),
        before.rebuild.map(|r| r.generation)
    );
    assert_eq!(
        good.artifacts().source_names().expect("names"),
        vec!["notes.txt"]
    );
}

#[test]
fn rebuild_is_idempotent() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = test_config(temp_dir.path());
    let pipeline = pipeline(&config, None);
    pipeline
        .ingest_file(&write_file(temp_dir.path(), "b.txt", "beta ".repeat(60).as_bytes()))
        .expect("ingest b");
    pipeline
        .ingest_file(&write_file(temp_dir.path(), "a.txt", "alpha ".repeat(60).as_bytes()))
        .expect("ingest a");

    let first = pipeline.rebuild().expect("rebuild");
    let first_mapping = pipeline.store().load_current().expect("load").expect("gen").mapping;
    let second = pipeline.rebuild().expect("rebuild");
    let second_mapping = pipeline.store().load_current().expect("load").expect("gen").mapping;

    assert_ne!(first.generation, second.generation);
    assert_eq!(first.chunks, second.chunks);
    assert_eq!(first_mapping, second_mapping);
    // Artifacts are concatenated in name order
    assert_eq!(first_mapping.records()[0].source_file, "a.txt");
}

#[test]
fn blank_artifact_pages_are_skipped() {
    let artifacts = vec![(
        "x.txt".to_string(),
        FileArtifact {
            file_type: "txt".to_string(),
            pages: vec!["one".to_string(), "  ".to_string(), "three".to_string()],
        },
    )];
    let chunks = collect_chunks(artifacts);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].sequence_no, 2);
}
