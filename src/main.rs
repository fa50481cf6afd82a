use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ragline::config::Settings;
use ragline::factory::PipelineConfig;
use ragline::pipeline::{ExtractType, Pipeline};
use ragline::queue::{self, LocalQueue};
use ragline::server::{run_server, AppState};
use ragline::telemetry;

#[derive(Parser)]
#[command(
    name = "ragline",
    about = "ragline — a staged RAG ingestion and vector search pipeline",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API with an in-process queue worker
    Serve,

    /// Run one pipeline end to end from a configuration file
    Run {
        /// Path to a pipeline configuration JSON file
        #[arg(long)]
        config: PathBuf,

        /// Extraction mode: full or delta
        #[arg(long, default_value = "full")]
        extract_type: String,

        /// Delta checkpoint (RFC 3339); only used with --extract-type delta
        #[arg(long)]
        since: Option<String>,
    },

    /// Search previously ingested content
    Search {
        /// Path to a pipeline configuration JSON file
        #[arg(long)]
        config: PathBuf,

        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 3)]
        top_k: usize,
    },

    /// Show sink index information
    Info {
        /// Path to a pipeline configuration JSON file
        #[arg(long)]
        config: PathBuf,
    },
}

fn load_pipeline_config(path: &PathBuf) -> anyhow::Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline config: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| "failed to parse pipeline config")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    telemetry::init(&settings);

    match cli.command {
        Commands::Serve => {
            let (local_queue, rx) = LocalQueue::new();
            let worker_queue = local_queue.clone();
            let worker_settings = settings.clone();
            tokio::spawn(async move {
                queue::run_worker(rx, worker_queue, worker_settings).await;
            });

            let state = AppState::new(Arc::new(settings), local_queue);
            run_server(state).await?;
        }

        Commands::Run {
            config,
            extract_type,
            since,
        } => {
            let pipeline_config = load_pipeline_config(&config)?;
            let extract_type: ExtractType = extract_type.parse()?;
            let last_extraction = since
                .map(|s| {
                    chrono::DateTime::parse_from_rfc3339(&s)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                })
                .transpose()
                .with_context(|| "--since must be an RFC 3339 timestamp")?;

            let pipeline = Pipeline::from_config(pipeline_config, &settings).await?;
            let pairs = pipeline.extract(extract_type, last_extraction).await?;

            let mut files = 0u64;
            let mut vectors = 0u64;
            for (source_index, cloud_file) in pairs {
                let batches = pipeline.process(source_index, &cloud_file).await?;
                for batch in batches {
                    vectors += pipeline.embed_and_ingest(&batch).await? as u64;
                }
                files += 1;
            }

            println!("run {}", pipeline.config().id);
            println!("  files processed: {}", files);
            println!("  vectors written: {}", vectors);
            println!("ok");
        }

        Commands::Search {
            config,
            query,
            top_k,
        } => {
            let pipeline_config = load_pipeline_config(&config)?;
            let results =
                ragline::search::run_search(&pipeline_config, &settings, &query, top_k).await?;

            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, result) in results.iter().enumerate() {
                let score = result
                    .score
                    .map(|s| format!("{:.3}", s))
                    .unwrap_or_else(|| "-".to_string());
                let text = result
                    .metadata
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .replace('\n', " ");
                println!("{}. [{}] {}", i + 1, score, result.id);
                println!("    excerpt: \"{}\"", text.chars().take(160).collect::<String>());
            }
        }

        Commands::Info { config } => {
            let pipeline_config = load_pipeline_config(&config)?;
            let sink = ragline::factory::create_sink(&pipeline_config.sink, &settings)?;
            let info = sink.info().await?;
            println!("vectors stored: {}", info.number_vectors_stored);
        }
    }

    Ok(())
}
