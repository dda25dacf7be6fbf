//! synthscope - Systematic Review Search Strategy Pipeline
//!
//! Drafts a systematic-review search strategy from a research question by
//! chaining persona-conditioned LLM completions.
//!
//! ## Usage
//!
//! ### CLI Mode
//! ```bash
//! synthscope run "Does X reduce Y in adults?" --select first
//! ```
//!
//! ### HTTP Server Mode
//! ```bash
//! synthscope serve --port 3000
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use synthscope::completion::{CompletionClient, OpenAiClient};
use synthscope::config::{LlmConfig, PipelineConfig};
use synthscope::export;
use synthscope::personas::{default_catalogue_path, PersonaCatalogue};
use synthscope::refiner::{FirstCandidate, IndexSelector, InteractiveSelector, SelectionStrategy};
use synthscope::{Pipeline, RunSummary, Stage};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Time a cancelled run gets to unwind before the process exits
const CANCEL_GRACE: Duration = Duration::from_secs(3);

// ============================================================================
// CLI Definition
// ============================================================================

/// Systematic Review Search Strategy Pipeline
#[derive(Parser)]
#[command(name = "synthscope")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a search strategy for a research question
    Run {
        /// Research question
        question: String,

        /// Candidate selection: interactive, first, or a 1-based option number
        #[arg(long, default_value = "interactive")]
        select: String,

        /// Output directory
        #[arg(short, long, default_value = "./search_summaries")]
        output: PathBuf,

        #[command(flatten)]
        llm: LlmArgs,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Run as HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[command(flatten)]
        llm: LlmArgs,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Manage persona catalogues
    Personas {
        #[command(subcommand)]
        action: PersonaAction,
    },
}

#[derive(Args, Clone)]
struct LlmArgs {
    /// LLM API base URL (e.g., https://api.openai.com/v1)
    #[arg(long)]
    llm_base_url: Option<String>,

    /// LLM API key
    #[arg(long)]
    llm_key: Option<String>,

    /// LLM model name
    #[arg(long)]
    llm_model: Option<String>,

    /// Output token budget per completion
    #[arg(long, default_value = "2000")]
    max_tokens: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    /// Persona catalogue JSON file (defaults to the built-in personas)
    #[arg(long)]
    personas: Option<PathBuf>,
}

impl LlmArgs {
    fn to_config(&self) -> LlmConfig {
        let mut config = LlmConfig::from_env(
            self.llm_base_url.clone(),
            self.llm_key.clone(),
            self.llm_model.clone(),
        );
        config.max_tokens = self.max_tokens;
        config.request_timeout_secs = self.timeout;
        config
    }
}

#[derive(Args, Clone)]
struct PipelineArgs {
    /// Number of rephrased questions to generate
    #[arg(long, default_value = "10")]
    candidates: usize,

    /// Sampling temperature for rephrasing
    #[arg(long, default_value = "0.3")]
    temperature: f32,

    /// Concurrent completions for candidates and per-database strategies
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// Continue without per-database strategies if the database list cannot be parsed
    #[arg(long)]
    allow_empty_databases: bool,
}

impl PipelineArgs {
    fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            candidate_count: self.candidates,
            rephrase_temperature: self.temperature,
            max_concurrency: self.concurrency,
            allow_empty_database_list: self.allow_empty_databases,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum PersonaAction {
    /// Validate a persona catalogue file
    Check {
        /// Catalogue path
        path: PathBuf,
    },
    /// Print the built-in catalogue as JSON
    Dump,
    /// Show the default catalogue path
    Path,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if cli.log_json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }

    match cli.command {
        Commands::Run {
            question,
            select,
            output,
            llm,
            pipeline,
        } => run_strategy(question, select, output, llm, pipeline).await,
        Commands::Serve {
            port,
            host,
            llm,
            pipeline,
        } => run_server(host, port, llm, pipeline).await,
        Commands::Personas { action } => handle_personas(action),
    }
}

// ============================================================================
// Strategy Run
// ============================================================================

fn build_selector(select: &str) -> Result<Box<dyn SelectionStrategy>> {
    match select {
        "interactive" => Ok(Box::new(InteractiveSelector::stdio())),
        "first" => Ok(Box::new(FirstCandidate)),
        other => {
            let n: usize = other
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .with_context(|| format!("Invalid --select value: {}", other))?;
            Ok(Box::new(IndexSelector(n - 1)))
        }
    }
}

async fn run_strategy(
    question: String,
    select: String,
    output_dir: PathBuf,
    llm_args: LlmArgs,
    pipeline_args: PipelineArgs,
) -> Result<()> {
    let selector = build_selector(&select)?;

    // Configuration errors surface here, before any completion is issued
    let personas = PersonaCatalogue::resolve(llm_args.personas.as_deref())?;
    let llm_config = llm_args.to_config();
    if llm_config.api_key.is_empty() {
        warn!("No LLM API key configured; requests are sent unauthenticated");
    }
    let client = OpenAiClient::new(&llm_config)?;

    let pipeline = Pipeline::new(Arc::new(client), personas, llm_config.clone(), pipeline_args.to_config())?
        .with_progress(Arc::new(|stage: Stage| println!("{}", stage.progress_message())));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nCancelling...");
                cancel.cancel();

                // A console prompt blocked on stdin never observes the token
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(CANCEL_GRACE) => {}
                }
                eprintln!("Aborted.");
                std::process::exit(130);
            }
        });
    }

    println!("Model: {} ({})", llm_config.model, llm_config.base_url);

    let report = match pipeline.run_with_cancel(&question, selector.as_ref(), cancel).await {
        Ok(report) => report,
        Err(e) => {
            let stage = e.stage().unwrap_or("setup").to_string();
            error!(stage = %stage, error = %e, "Search strategy generation failed");
            anyhow::bail!("Generation failed at stage {}: {}", stage, e);
        }
    };

    println!("\nTemplate: {}", report.format);
    println!("Databases ({}): {}", report.databases.len(), report.databases.join(", "));

    // Output folder named after the generated file title
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let stem = export::file_base_name(report.summary.get(synthscope::summary::keys::FILE_TITLE).unwrap_or_default());
    let output_folder = output_dir.join(format!("{}_{}", timestamp, stem));

    let files = export::export_all(&report.summary, &output_folder).context("Failed to write summary files")?;

    println!("Saved: {}", files.log.display());
    println!("Saved: {}", files.markdown.display());
    println!("Saved: {}", files.json.display());
    println!("Saved: {}", files.csv.display());
    println!(
        "Token usage: {} prompt + {} completion = {} total",
        report.usage.prompt_tokens, report.usage.completion_tokens, report.usage.total_tokens
    );

    println!("\n✓ Search strategy complete. Results in: {}", output_folder.display());
    Ok(())
}

// ============================================================================
// HTTP Server
// ============================================================================

async fn run_server(host: String, port: u16, llm_args: LlmArgs, pipeline_args: PipelineArgs) -> Result<()> {
    info!(host = %host, port = port, "Starting HTTP server");

    let personas = PersonaCatalogue::resolve(llm_args.personas.as_deref())?;
    let llm = llm_args.to_config();
    let config = pipeline_args.to_config();
    config.validate()?;
    let client: Arc<dyn CompletionClient> = Arc::new(OpenAiClient::new(&llm)?);

    let app_state = Arc::new(AppState {
        client,
        personas,
        llm,
        config,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/strategy", post(strategy_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid host:port")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

struct AppState {
    client: Arc<dyn CompletionClient>,
    personas: PersonaCatalogue,
    llm: LlmConfig,
    config: PipelineConfig,
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Strategy request body
#[derive(Debug, Deserialize)]
struct StrategyRequest {
    question: String,
    candidate_count: Option<usize>,
}

/// Strategy response
#[derive(Debug, Serialize)]
struct StrategyResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<String>,
    databases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<RunSummary>,
}

impl StrategyResponse {
    fn failure(stage: Option<&str>, error: String) -> Self {
        Self {
            status: "error".to_string(),
            stage: stage.map(str::to_string),
            error: Some(error),
            template: None,
            databases: vec![],
            summary: None,
        }
    }
}

/// Strategy endpoint handler.
///
/// Dropping the request (client disconnect) drops the run and its in-flight
/// completions.
async fn strategy_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StrategyRequest>,
) -> Json<StrategyResponse> {
    info!(question = %req.question, candidates = ?req.candidate_count, "Strategy request");

    let mut config = state.config.clone();
    if let Some(count) = req.candidate_count {
        config.candidate_count = count;
    }

    let pipeline = match Pipeline::new(
        Arc::clone(&state.client),
        state.personas.clone(),
        state.llm.clone(),
        config,
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => return Json(StrategyResponse::failure(e.stage(), e.to_string())),
    };

    match pipeline.run(&req.question, &FirstCandidate).await {
        Ok(report) => Json(StrategyResponse {
            status: "success".to_string(),
            stage: None,
            error: None,
            template: Some(report.format.to_string()),
            databases: report.databases,
            summary: Some(report.summary),
        }),
        Err(e) => {
            error!(stage = ?e.stage(), error = %e, "Strategy run failed");
            Json(StrategyResponse::failure(e.stage(), e.to_string()))
        }
    }
}

// ============================================================================
// Persona Management
// ============================================================================

fn handle_personas(action: PersonaAction) -> Result<()> {
    match action {
        PersonaAction::Check { path } => {
            let catalogue = PersonaCatalogue::load(&path)
                .with_context(|| format!("Invalid persona catalogue {}", path.display()))?;
            println!("Persona catalogue OK: {}", path.display());
            println!("{} bytes of persona text", catalogue.to_json_pretty()?.len());
        }
        PersonaAction::Dump => {
            println!("{}", PersonaCatalogue::builtin().to_json_pretty()?);
        }
        PersonaAction::Path => match default_catalogue_path() {
            Some(path) => println!("Persona catalogue: {:?}", path),
            None => println!("Cannot determine config directory"),
        },
    }

    Ok(())
}
