use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_rag_core::{
    build_index, ingest_folder_chunks_best_effort, search_index, AnswerGenerator,
    ChatAnswerGenerator, ChatModel, ChatModelConfig, ComputeBackend, ConversationTurn,
    DistanceMetric, EmbedderKind, EmbeddingConfig, IngestionOptions, OpenAiCompatibleChat,
    QueryReformulator, Resources, RetrievalEngine, RetrievalError, RetrievalOptions,
    RetrievalOutcome, ADVISOR_INSTRUCTIONS, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_EMBEDDING_MODEL, NO_RELEVANT_INFORMATION_REPLY,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version, about = "Chat with a folder of PDF documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted vector index.
    #[arg(long, global = true, env = "PDF_RAG_INDEX", default_value = "index")]
    index: PathBuf,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    llm: LlmArgs,

    /// Chunks handed to the answer model per question.
    #[arg(long, global = true, env = "PDF_RAG_TOP_K", default_value_t = 3)]
    top_k: usize,

    /// Hits must score strictly above this to count as relevant.
    #[arg(long, global = true, env = "PDF_RAG_MIN_SCORE", default_value_t = 0.0)]
    min_score: f32,
}

#[derive(Args)]
struct EmbeddingArgs {
    /// Embedding implementation: fastembed or ngram.
    #[arg(long, global = true, env = "PDF_RAG_EMBEDDER", default_value = "fastembed")]
    embedder: EmbedderKind,

    #[arg(long, global = true, env = "PDF_RAG_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Execution backend for the embedding model: auto, cpu or cuda.
    #[arg(long, global = true, env = "PDF_RAG_BACKEND", default_value = "auto")]
    backend: ComputeBackend,

    /// Where downloaded model files are cached.
    #[arg(long, global = true, env = "PDF_RAG_MODEL_CACHE_DIR")]
    model_cache_dir: Option<PathBuf>,

    /// Vector width of the ngram embedder.
    #[arg(long, global = true, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    ngram_dimensions: usize,
}

#[derive(Args)]
struct LlmArgs {
    /// OpenAI-compatible API base URL.
    #[arg(long, global = true, env = "PDF_RAG_LLM_BASE_URL", default_value = "https://api.groq.com/openai")]
    llm_base_url: String,

    #[arg(long, global = true, env = "PDF_RAG_LLM_MODEL", default_value = "llama-3.1-8b-instant")]
    llm_model: String,

    #[arg(long, global = true, env = "GROQ_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, global = true, env = "PDF_RAG_LLM_TIMEOUT_SECS", default_value_t = 30)]
    llm_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk and embed every PDF under a folder into a fresh index.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 1200)]
        max_chars: usize,
        #[arg(long, default_value_t = 300)]
        overlap: usize,
        /// Chunks with fewer non-whitespace characters are dropped.
        #[arg(long, default_value_t = 50)]
        min_chars: usize,
        /// Boilerplate line to strip; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long, default_value = "cosine")]
        metric: DistanceMetric,
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Keep chunk text without the document label prefix.
        #[arg(long, default_value_t = false)]
        no_labels: bool,
        /// Strip a page's first or last line when it recurs on most pages.
        #[arg(long, default_value_t = false)]
        detect_running_headers: bool,
    },
    /// Nearest chunks for a query, without reformulation or generation.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 3)]
        k: usize,
    },
    /// Answer one question from the indexed documents.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive session; `/reset` clears history, `/quit` exits.
    Chat,
}

impl Cli {
    fn embedding_config(&self, batch_size: Option<usize>) -> EmbeddingConfig {
        let defaults = EmbeddingConfig::default();
        EmbeddingConfig {
            kind: self.embedding.embedder,
            model: self.embedding.embedding_model.clone(),
            backend: self.embedding.backend,
            cache_dir: self.embedding.model_cache_dir.clone(),
            batch_size: batch_size.unwrap_or(defaults.batch_size),
            ngram_dimensions: self.embedding.ngram_dimensions,
        }
    }

    fn chat_model(&self) -> anyhow::Result<Arc<dyn ChatModel>> {
        let config = ChatModelConfig {
            base_url: self.llm.llm_base_url.clone(),
            model: self.llm.llm_model.clone(),
            api_key: self.llm.llm_api_key.clone(),
            timeout: self.llm_timeout(),
        };
        let model = OpenAiCompatibleChat::new(&config)
            .context("set GROQ_API_KEY or --llm-api-key to ask questions")?;
        Ok(Arc::new(model))
    }

    fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.llm_timeout_secs)
    }

    fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            top_k: self.top_k,
            min_score: self.min_score,
        }
    }
}

/// Retrieval plus generation for one conversation.
struct Session {
    engine: RetrievalEngine,
    generator: ChatAnswerGenerator,
    history: Vec<ConversationTurn>,
}

struct Reply {
    answer: String,
    sources: Vec<String>,
}

impl Session {
    async fn open(cli: &Cli, resources: &Resources) -> anyhow::Result<Self> {
        let model = cli.chat_model()?;
        let reformulator = QueryReformulator::new(Arc::clone(&model)).with_timeout(cli.llm_timeout());
        let engine = resources
            .engine(reformulator, cli.retrieval_options())
            .await
            .context("failed to load the index; run `pdf-rag ingest` first")?;
        let generator = ChatAnswerGenerator::new(model).with_timeout(cli.llm_timeout());

        Ok(Self {
            engine,
            generator,
            history: Vec::new(),
        })
    }

    async fn ask(&mut self, question: &str) -> Result<Reply, RetrievalError> {
        let outcome = self.engine.retrieve(&self.history, question).await?;

        let reply = match outcome {
            RetrievalOutcome::NoRelevantInformation { .. } => Reply {
                answer: NO_RELEVANT_INFORMATION_REPLY.to_string(),
                sources: Vec::new(),
            },
            RetrievalOutcome::Context(context) => {
                let answer = self
                    .generator
                    .generate(
                        ADVISOR_INSTRUCTIONS,
                        &self.history,
                        &context.reformulated_question,
                        &context.context_text,
                    )
                    .await?;
                Reply {
                    answer,
                    sources: context.source_ids,
                }
            }
        };

        self.history.push(ConversationTurn::user(question));
        self.history.push(ConversationTurn::assistant(reply.answer.clone()));
        Ok(reply)
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

fn print_reply(reply: &Reply) {
    println!("{}", reply.answer);
    if !reply.sources.is_empty() {
        println!("\nsources: {}", reply.sources.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index = %cli.index.display(),
        embedder = %cli.embedding.embedder,
        "pdf-rag boot"
    );

    match &cli.command {
        Command::Ingest {
            input,
            max_chars,
            overlap,
            min_chars,
            headers,
            metric,
            batch_size,
            no_labels,
            detect_running_headers,
        } => {
            let options = IngestionOptions {
                chunk_max_chars: *max_chars,
                chunk_overlap_chars: *overlap,
                min_chunk_chars: *min_chars,
                boilerplate_headers: headers.clone(),
                label_chunks: !no_labels,
                detect_running_headers: *detect_running_headers,
                ..IngestionOptions::default()
            };
            let resources = Resources::new(cli.embedding_config(Some(*batch_size)), &cli.index);
            let embedder = resources.embedder().await?;

            let input = input.clone();
            let index_dir = cli.index.clone();
            let metric = *metric;
            let batch_size = *batch_size;

            let (report, entries) = tokio::task::spawn_blocking(move || {
                let report = ingest_folder_chunks_best_effort(&input, &options)?;
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                }
                let index = build_index(report.chunks.clone(), embedder.as_ref(), metric, batch_size)?;
                index.save(&index_dir)?;
                Ok::<_, anyhow::Error>((report, index.len()))
            })
            .await??;

            println!(
                "{entries} chunks from {} documents ({} pages) indexed at {}; {} file(s) skipped",
                report.documents,
                report.pages,
                Utc::now().to_rfc3339(),
                report.skipped_files.len()
            );
        }
        Command::Search { query, k } => {
            let resources = Resources::new(cli.embedding_config(None), &cli.index);
            let embedder = resources.embedder().await?;
            let index = resources
                .index()
                .await
                .context("failed to load the index; run `pdf-rag ingest` first")?;

            let result = search_index(&embedder, &index, query, *k).await?;
            println!("query: {query}");
            for hit in &result.hits {
                let page = hit
                    .chunk
                    .page_number
                    .map(|page| format!(" page={page}"))
                    .unwrap_or_default();
                println!(
                    "[{}] score={:.4} source={}{page} chunk={}",
                    hit.rank, hit.score, hit.chunk.source_id, hit.chunk.chunk_id
                );
                println!("{}\n", hit.chunk.content());
            }
        }
        Command::Ask { question } => {
            let resources = Resources::new(cli.embedding_config(None), &cli.index);
            let mut session = Session::open(&cli, &resources).await?;
            let reply = session.ask(question).await?;
            print_reply(&reply);
        }
        Command::Chat => {
            let resources = Resources::new(cli.embedding_config(None), &cli.index);
            let mut session = Session::open(&cli, &resources).await?;
            run_chat(&mut session).await?;
        }
    }

    Ok(())
}

async fn run_chat(session: &mut Session) -> anyhow::Result<()> {
    let session_id = uuid::Uuid::new_v4();
    info!(%session_id, "chat session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("Ask about your documents. /reset clears the conversation, /quit exits.");

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset();
                info!(%session_id, "history cleared");
                println!("Conversation cleared.");
            }
            question => match session.ask(question).await {
                Ok(reply) => print_reply(&reply),
                Err(error) if error.is_downstream() => {
                    warn!(%session_id, %error, "model call failed");
                    println!("The language model is unavailable right now ({error}). Please try again.");
                }
                Err(error) => return Err(error.into()),
            },
        }
    }

    info!(%session_id, turns = session.history.len() / 2, "chat session ended");
    Ok(())
}
