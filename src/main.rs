use anyhow::Result;
use clap::{Parser, Subcommand};
use ragkit::chat::{ApiKeys, RagService};
use ragkit::commands::{
    ask, chat_repl, ingest_files, rebuild_index, show_status, submit_feedback, write_config,
};
use ragkit::config::{Config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ragkit")]
#[command(about = "Question answering over local documents with optional live web context")]
#[command(version)]
struct Cli {
    /// Data directory holding config, documents and the index
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write or show the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Add files to the knowledge base and rebuild the index
    Ingest {
        /// Files to ingest (txt, md, csv, png, jpg, webp, pdf)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Rebuild the index from every stored artifact
    Rebuild,
    /// Ask a single question
    Ask {
        question: String,
        /// Always include web search results
        #[arg(long)]
        web: bool,
        /// Image to attach to the question
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Interactive chat with conversation history
    Chat {
        /// Always include web search results
        #[arg(long)]
        web: bool,
    },
    /// Log feedback given as a JSON object
    Feedback {
        /// e.g. '{"query": "...", "retrieved_docs": [], "generated_response": "...", "feedback_rating": 5}'
        json: String,
    },
    /// Show index and knowledge base status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => Config::default_base_dir()?,
    };
    let config = Config::load(&base_dir)?;

    if let Commands::Config { show } = cli.command {
        if show {
            show_config(&config)?;
        } else {
            write_config(&config)?;
        }
        return Ok(());
    }

    let service = RagService::from_config(config, ApiKeys::from_env())?;

    match cli.command {
        Commands::Config { .. } => {}
        Commands::Ingest { files } => {
            ingest_files(&service, files).await?;
        }
        Commands::Rebuild => {
            rebuild_index(&service).await?;
        }
        Commands::Ask {
            question,
            web,
            image,
        } => {
            ask(&service, question, web, image.as_deref()).await?;
        }
        Commands::Chat { web } => {
            chat_repl(&service, web).await?;
        }
        Commands::Feedback { json } => {
            submit_feedback(&service, &json)?;
        }
        Commands::Status => {
            show_status(&service)?;
        }
    }

    Ok(())
}
