use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use doc_rag_core::{
    discover_documents, document_id_from_path, AnswerGenerator, Backends, CharacterNgramEmbedder,
    DedupStrategy, Embedder, EmbeddingEndpoint, GeneratorConfig, HttpEmbedder, HttpGenerator,
    IndexManager, LocalVectorStore, MemoryCache, OcrEndpointConfig, QueryCache, RagOptions,
    WebdisCache,
};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding one sub-directory per document collection.
    #[arg(long, env = "RAG_STORE_ROOT", default_value = "./vectordb")]
    store_root: PathBuf,

    /// Embedding backend.
    #[arg(long, env = "RAG_EMBEDDER", value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Embedding server base URLs, comma separated. Requests rotate across them.
    #[arg(
        long,
        env = "RAG_EMBED_URLS",
        value_delimiter = ',',
        default_value = "http://localhost:11434"
    )]
    embed_urls: Vec<String>,

    #[arg(long, env = "RAG_EMBED_MODEL", default_value = "nomic-embed-text")]
    embed_model: String,

    #[arg(long, env = "RAG_EMBED_DIMENSIONS", default_value = "768")]
    embed_dimensions: usize,

    #[arg(long, env = "RAG_EMBED_API_KEY")]
    embed_api_key: Option<String>,

    /// OpenAI-compatible base URL (the client appends `/chat/completions`).
    #[arg(long, env = "RAG_LLM_URL", default_value = "http://localhost:11434/v1")]
    llm_url: String,

    #[arg(long, env = "RAG_LLM_MODEL", default_value = "llama3.1")]
    llm_model: String,

    /// API keys, comma separated. Rate-limited keys are rotated out for a cooldown.
    #[arg(long, env = "RAG_LLM_API_KEYS", value_delimiter = ',')]
    llm_api_keys: Vec<String>,

    #[arg(long, env = "RAG_LLM_TEMPERATURE", default_value = "0.7")]
    llm_temperature: f32,

    #[arg(long, env = "RAG_LLM_MAX_TOKENS", default_value = "2048")]
    llm_max_tokens: u32,

    #[arg(long, env = "RAG_LLM_TIMEOUT_SECS", default_value = "120")]
    llm_timeout_secs: u64,

    /// How long a rate-limited key or endpoint sits out.
    #[arg(long, env = "RAG_RATE_LIMIT_COOLDOWN_SECS", default_value = "60")]
    rate_limit_cooldown_secs: u64,

    /// URL of a Webdis HTTP gateway in front of Redis, used as the shared query cache.
    /// Plain `redis://` URLs are not supported. Without it answers are cached in-process.
    #[arg(long, env = "RAG_CACHE_URL")]
    cache_url: Option<String>,

    /// Maximum number of answers held by the in-process cache.
    #[arg(long, env = "RAG_CACHE_CAPACITY", default_value = "1024")]
    cache_capacity: usize,

    #[arg(long, env = "RAG_CACHE_TIMEOUT_MS", default_value = "2000")]
    cache_timeout_ms: u64,

    /// OCR endpoint used for PDFs without a text layer.
    #[arg(long, env = "RAG_OCR_URL")]
    ocr_url: Option<String>,

    #[arg(long, env = "RAG_OCR_API_KEY")]
    ocr_api_key: Option<String>,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    /// Local character trigram hashing, no network.
    Ngram,
    /// Ollama-style `/api/embed` server.
    Http,
}

#[derive(Clone, Copy, ValueEnum)]
enum DedupKind {
    None,
    Exact,
    Near,
}

#[derive(Args)]
struct Tuning {
    #[arg(long, env = "RAG_CHUNK_SIZE", default_value = "800")]
    chunk_size: usize,

    #[arg(long, env = "RAG_CHUNK_OVERLAP", default_value = "100")]
    chunk_overlap: usize,

    #[arg(long, env = "RAG_MIN_CHUNK_LENGTH", default_value = "50")]
    min_chunk_length: usize,

    #[arg(long, env = "RAG_DEDUP", value_enum, default_value_t = DedupKind::Exact)]
    dedup: DedupKind,

    /// Similarity above which a chunk counts as a near duplicate (`--dedup near`).
    #[arg(long, env = "RAG_DEDUP_THRESHOLD", default_value = "0.95")]
    dedup_threshold: f64,

    /// Number of previously kept chunks compared against (`--dedup near`).
    #[arg(long, env = "RAG_DEDUP_WINDOW", default_value = "8")]
    dedup_window: usize,

    #[arg(long, env = "RAG_MMR_LAMBDA", default_value = "0.7")]
    mmr_lambda: f32,

    #[arg(long, env = "RAG_FETCH_MULTIPLIER", default_value = "3")]
    fetch_multiplier: usize,

    #[arg(long, env = "RAG_DEFAULT_K", default_value = "5")]
    default_k: usize,

    #[arg(long, env = "RAG_SUCCESS_TTL_SECS", default_value = "7200")]
    success_ttl_secs: u64,

    #[arg(long, env = "RAG_FAILURE_TTL_SECS", default_value = "300")]
    failure_ttl_secs: u64,

    #[arg(long, env = "RAG_EMBED_BATCH_SIZE", default_value = "32")]
    embed_batch_size: usize,

    #[arg(long, env = "RAG_RETRY_ATTEMPTS", default_value = "3")]
    retry_attempts: u32,

    #[arg(long, env = "RAG_RETRY_BASE_DELAY_MS", default_value = "500")]
    retry_base_delay_ms: u64,

    #[arg(long, env = "RAG_QUERY_TIMEOUT_MS")]
    query_timeout_ms: Option<u64>,

    #[arg(long, env = "RAG_PREVIEW_CHARS", default_value = "200")]
    preview_chars: usize,
}

impl Tuning {
    fn options(&self) -> RagOptions {
        let dedup = match self.dedup {
            DedupKind::None => DedupStrategy::None,
            DedupKind::Exact => DedupStrategy::Exact,
            DedupKind::Near => DedupStrategy::NearDuplicate {
                threshold: self.dedup_threshold,
                window: self.dedup_window,
            },
        };

        RagOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            min_chunk_length: self.min_chunk_length,
            dedup,
            mmr_lambda: self.mmr_lambda,
            fetch_multiplier: self.fetch_multiplier,
            default_k: self.default_k,
            success_ttl_secs: self.success_ttl_secs,
            failure_ttl_secs: self.failure_ttl_secs,
            embed_batch_size: self.embed_batch_size,
            retry_attempts: self.retry_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            query_timeout_ms: self.query_timeout_ms,
            preview_chars: self.preview_chars,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build or rebuild the index of one document, or of every document in a folder.
    Build {
        /// Source file (.pdf, .txt, .md).
        #[arg(long, required_unless_present = "folder", conflicts_with = "folder")]
        path: Option<PathBuf>,
        /// Id of the document; derived from the file name when omitted.
        #[arg(long, conflicts_with = "folder")]
        document_id: Option<String>,
        /// Folder searched recursively; each file is indexed under its own id.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Ask a question against one document's index.
    Query {
        #[arg(long)]
        document_id: String,
        #[arg(long)]
        question: String,
        /// Number of passages to retrieve.
        #[arg(long)]
        k: Option<usize>,
    },
    /// Remove a document's index and its cached answers.
    Delete {
        #[arg(long)]
        document_id: String,
    },
    /// Report whether a document is indexed and how many chunks it holds.
    Status {
        #[arg(long)]
        document_id: String,
    },
    /// List every document with a persisted index.
    List,
}

fn build_embedder(cli: &Cli, cooldown: Duration) -> anyhow::Result<Arc<dyn Embedder>> {
    match cli.embedder {
        EmbedderKind::Ngram => Ok(Arc::new(CharacterNgramEmbedder::default())),
        EmbedderKind::Http => {
            let endpoints = cli
                .embed_urls
                .iter()
                .map(|url| EmbeddingEndpoint {
                    url: url.clone(),
                    api_key: cli.embed_api_key.clone(),
                })
                .collect();
            let embedder =
                HttpEmbedder::new(endpoints, &cli.embed_model, cli.embed_dimensions, cooldown)?;
            Ok(Arc::new(embedder))
        }
    }
}

fn build_cache(cli: &Cli) -> anyhow::Result<Arc<dyn QueryCache>> {
    match &cli.cache_url {
        Some(url) => Ok(Arc::new(
            WebdisCache::new(url, Duration::from_millis(cli.cache_timeout_ms))?
                .with_tracking_ttl(Duration::from_secs(cli.tuning.success_ttl_secs)),
        )),
        None => Ok(Arc::new(MemoryCache::new(cli.cache_capacity))),
    }
}

async fn build_manager(cli: &Cli) -> anyhow::Result<IndexManager> {
    let cooldown = Duration::from_secs(cli.rate_limit_cooldown_secs);
    let store = LocalVectorStore::open(&cli.store_root).await?;
    let embedder = build_embedder(cli, cooldown)?;
    let generator: Arc<dyn AnswerGenerator> = Arc::new(HttpGenerator::new(GeneratorConfig {
        base_url: cli.llm_url.clone(),
        model: cli.llm_model.clone(),
        api_keys: cli.llm_api_keys.clone(),
        temperature: cli.llm_temperature,
        max_tokens: cli.llm_max_tokens,
        timeout: Duration::from_secs(cli.llm_timeout_secs),
        key_cooldown: cooldown,
    })?);
    let ocr = cli.ocr_url.as_ref().map(|endpoint| OcrEndpointConfig {
        endpoint: endpoint.clone(),
        api_key: cli.ocr_api_key.clone(),
    });

    let manager = IndexManager::new(
        Backends {
            store: Arc::new(store),
            embedder,
            generator,
            cache: build_cache(cli)?,
            ocr,
        },
        cli.tuning.options(),
    )?;
    Ok(manager)
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let manager = build_manager(&cli).await?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        store_root = %cli.store_root.display(),
        "doc-rag boot"
    );

    match cli.command {
        Command::Build {
            path,
            document_id,
            folder,
        } => {
            if let Some(folder) = folder {
                let files = discover_documents(&folder);
                if files.is_empty() {
                    anyhow::bail!("no supported documents found in {}", folder.display());
                }
                info!(folder = %folder.display(), documents = files.len(), "building folder");

                let handles = files
                    .into_iter()
                    .map(|file| {
                        let document_id = document_id_from_path(&file);
                        manager.spawn_build(file, document_id)
                    })
                    .collect::<Vec<_>>();

                let mut reports = Vec::with_capacity(handles.len());
                for handle in handles {
                    let report = handle.await?;
                    if !report.success {
                        warn!(
                            document_id = %report.document_id,
                            error = report.error.as_deref().unwrap_or_default(),
                            "document skipped"
                        );
                    }
                    reports.push(report);
                }

                let all_succeeded = reports.iter().all(|report| report.success);
                print_json(&serde_json::to_value(&reports)?)?;
                return Ok(exit_code(all_succeeded));
            }

            let Some(path) = path else {
                anyhow::bail!("either --path or --folder is required");
            };
            let document_id = document_id.unwrap_or_else(|| document_id_from_path(&path));
            let report = manager.build_index(&path, &document_id).await;
            print_json(&serde_json::to_value(&report)?)?;
            Ok(exit_code(report.success))
        }
        Command::Query {
            document_id,
            question,
            k,
        } => {
            let outcome = manager.query(&document_id, &question, k).await;
            print_json(&serde_json::to_value(&outcome)?)?;
            Ok(exit_code(outcome.success))
        }
        Command::Delete { document_id } => {
            let report = manager.delete_index(&document_id).await;
            print_json(&serde_json::to_value(&report)?)?;
            Ok(exit_code(report.success))
        }
        Command::Status { document_id } => {
            let status = manager.status(&document_id).await;
            print_json(&serde_json::to_value(&status)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let statuses = manager.list_indexes().await?;
            print_json(&serde_json::to_value(&statuses)?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
