use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use notebrain::app::App;
use notebrain::config::{Config, DEFAULT_CONFIG_PATH};

/// notebrain: ask questions about your own notes.
#[derive(Parser)]
#[command(name = "notebrain", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API, watch the corpus and ingest it in the background.
    Serve,

    /// Ingest the corpus once and exit.
    Ingest {
        /// Re-ingest every file, changed or not.
        #[arg(long)]
        force: bool,
    },

    /// Ask a question and stream the answer to stdout.
    Ask {
        question: String,

        /// Chat model to use instead of the configured default.
        #[arg(long)]
        model: Option<String>,
    },

    /// Show the chunks most similar to a query.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },

    /// Print ingestion statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    config.validate().context("invalid configuration")?;
    let app = App::build(config)?;

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting notebrain v{}", env!("CARGO_PKG_VERSION"));
            app.serve().await?;
        }
        Commands::Ingest { force } => {
            app.restore().await;
            let processed = app.ingestor.ingest_all(force).await;
            println!("Processed {processed} documents");
        }
        Commands::Ask { question, model } => {
            app.restore().await;
            let mut fragments = app.rag.ask_stream(&question, model.as_deref()).await?;
            let mut stdout = std::io::stdout();
            while let Some(fragment) = fragments.next().await {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Commands::Search { query, top_k } => {
            app.restore().await;
            let hits = app.rag.search(&query, top_k).await?;
            if hits.is_empty() {
                println!("No matching chunks");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. {} (chunk {}/{}) score {:.3}",
                    i + 1,
                    hit.chunk.metadata.source,
                    hit.chunk.chunk_index + 1,
                    hit.chunk.total_chunks,
                    hit.score
                );
                println!("   {}", notebrain::models::preview(&hit.chunk.text).replace('\n', " "));
            }
        }
        Commands::Stats => {
            app.restore().await;
            let stats = app.ingestor.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
