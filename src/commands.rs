use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use crate::chat::{ChatRequest, ChatResponse, RagService};
use crate::config::Config;
use crate::embeddings::OllamaClient;
use crate::ingest::IngestState;

const EXIT_COMMANDS: [&str; 3] = ["exit", "quit", ":q"];

/// Write the effective configuration to `config.toml` so it can be edited
#[inline]
pub fn write_config(config: &Config) -> Result<()> {
    config.save().context("Failed to save configuration")?;
    println!("✅ Configuration written to {}", config.config_file_path().display());
    println!("Edit the file and run 'ragkit config --show' to check it.");
    Ok(())
}

/// Ingest every given file, continuing past failures
#[inline]
pub async fn ingest_files(service: &RagService, paths: Vec<PathBuf>) -> Result<()> {
    let total = paths.len();
    let mut failed = 0;

    for path in paths {
        info!("Ingesting {}", path.display());
        match service.ingest_file(path.clone()).await {
            Ok(outcome) if outcome.state == IngestState::Indexed => {
                println!(
                    "✅ {} ({}): {} chunks",
                    outcome.source_name,
                    outcome.kind.map_or_else(|| "unknown".to_string(), |k| format!("{k:?}")),
                    outcome.chunk_count
                );
                if let Some(rebuild) = outcome.rebuild {
                    println!(
                        "   Index generation {}: {} chunks from {} files",
                        rebuild.generation, rebuild.chunks, rebuild.files
                    );
                }
            }
            Ok(outcome) => {
                println!(
                    "⏭️  {}: unsupported file type, copied but not indexed",
                    outcome.source_name
                );
            }
            Err(e) => {
                failed += 1;
                error!("Failed to ingest {}: {}", path.display(), e);
                println!("❌ {}: {}", path.display(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {total} files failed to ingest");
    }
    Ok(())
}

#[inline]
pub async fn rebuild_index(service: &RagService) -> Result<()> {
    let summary = service.rebuild().await?;
    println!(
        "✅ Published index generation {}: {} chunks from {} files",
        summary.generation, summary.chunks, summary.files
    );
    Ok(())
}

/// Answer a single question
#[inline]
pub async fn ask(service: &RagService, question: String, web_search: bool, image: Option<&Path>) -> Result<()> {
    let image = image
        .map(|path| {
            std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
        })
        .transpose()?;

    let mut history = service.new_history();
    let response = service
        .chat(
            ChatRequest {
                text: question,
                image,
                web_search,
            },
            &mut history,
        )
        .await?;

    print_response(&response);
    Ok(())
}

/// Interactive session on stdin with a bounded history
#[inline]
pub async fn chat_repl(service: &RagService, web_search: bool) -> Result<()> {
    let mut history = service.new_history();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    println!("💬 Ask a question ('exit' to quit)");
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.contains(&line) {
            break;
        }

        let request = ChatRequest {
            text: line.to_string(),
            image: None,
            web_search,
        };
        match service.chat(request, &mut history).await {
            Ok(response) => print_response(&response),
            Err(e) => {
                error!("Chat request failed: {}", e);
                println!("❌ {}", e);
            }
        }
    }

    Ok(())
}

/// Log a feedback record given as JSON text
#[inline]
pub fn submit_feedback(service: &RagService, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Feedback must be a JSON object")?;
    let record = service.submit_feedback(payload)?;
    println!("✅ Feedback logged for query: {}", record.query);
    Ok(())
}

#[inline]
pub fn show_status(service: &RagService) -> Result<()> {
    let config = service.config();

    println!("📊 ragkit status");
    println!();
    match OllamaClient::new(&config.embedding).and_then(|client| client.health_check()) {
        Ok(()) => println!(
            "✅ Embedding service ready: {} at {}:{}",
            config.embedding.model, config.embedding.host, config.embedding.port
        ),
        Err(e) => {
            warn!("Embedding service check failed: {:#}", e);
            println!("⚠️  Embedding service unavailable: {:#}", e);
        }
    }
    match service.index_status()? {
        Some(status) => {
            println!("🗂️  Index generation: {}", status.generation);
            println!("   Chunks: {}", status.chunks);
            println!("   Dimensions: {}", status.dimension);
        }
        None => println!("🗂️  No index published yet. Use 'ragkit ingest <file>' to add documents."),
    }

    let sources = service.pipeline().artifacts().source_names()?;
    println!("📄 Ingested files: {}", sources.len());
    for name in &sources {
        println!("   • {}", name);
    }

    let feedback = crate::feedback::FeedbackLog::new(config.feedback_log_path()).records()?;
    println!("📝 Feedback records: {}", feedback.len());
    println!();
    println!("Data directory: {}", config.get_base_dir().display());

    Ok(())
}

fn print_response(response: &ChatResponse) {
    println!();
    println!("{}", response.answer.trim());
    println!();
    println!("📚 Context documents: {}", response.context_docs.len());
    if response.web_search_performed {
        println!(
            "🌐 Web results: {} ({} pages crawled)",
            response.web_results_count, response.crawled_pages
        );
        for source in response.search_sources.iter().flatten() {
            println!("   • {} <{}>", source.title, source.url);
        }
    }
    println!();
}
