//! # synthscope
//!
//! Systematic Review Search Strategy Pipeline
//!
//! Chains LLM completions, each conditioned on a persona, from a free-text
//! research question to a refined question, population statement,
//! inclusion/exclusion criteria, search strategy, database list, per-database
//! strategies and a PubMed query.
//!
//! ## Modules
//!
//! - [`pipeline`] - Stage orchestrator and `run_pipeline` entry point
//! - [`refiner`] - Candidate rephrasing, deduplication and selection
//! - [`completion`] - LLM completion client with timeout and retry
//! - [`extract`] - Field extraction and database list parsing
//! - [`summary`] - Ordered run summary and log
//! - [`export`] - Markdown/JSON/CSV artifacts
//! - [`personas`] - Persona catalogue
//! - [`config`] - Explicit run configuration
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use synthscope::{config::StrategyConfig, pipeline, refiner::FirstCandidate};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StrategyConfig::default();
//!     let summary = pipeline::run_pipeline("Does X reduce Y in adults?", &config, &FirstCandidate).await?;
//!     println!("{}", summary.to_log_text());
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod personas;
pub mod pipeline;
pub mod prompts;
pub mod refiner;
pub mod summary;

pub use error::{Result, StrategyError};
pub use pipeline::{run_pipeline, Pipeline, RunReport, Stage};
pub use summary::RunSummary;
