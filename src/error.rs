//! Custom error types for synthscope.
//!
//! Every failure a run can end in is one of the kinds below. Errors that happen
//! inside a stage carry the stage name so the caller can report
//! "generation failed at stage X".

use thiserror::Error;

/// Main error type for search strategy generation.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The LLM collaborator call failed (network, auth, rate limit, bad status)
    #[error("Completion failed at stage {stage}: {message}")]
    CompletionTransport {
        /// Stage that issued the call
        stage: String,
        /// Transport or API message
        message: String,
    },

    /// The completion did not return within the configured timeout
    #[error("Completion timed out at stage {stage} after {secs}s")]
    Timeout {
        /// Stage that issued the call
        stage: String,
        /// Timeout that elapsed
        secs: u64,
    },

    /// Expected marker text missing from a completion
    #[error("Extraction failed at stage {stage}: {message}")]
    Extraction {
        /// Stage whose output could not be parsed
        stage: String,
        /// What was missing
        message: String,
    },

    /// None of PICO, PECO or SPIDER found in the classification answer
    #[error("Classification error: no PICO/PECO/SPIDER template in {0:?}")]
    Classification(String),

    /// The list-reformatting completion was not a structurally valid list
    #[error("Database list parse error: {0}")]
    DatabaseListParse(String),

    /// Persona catalogue or client configuration missing/malformed
    #[error("Config error: {0}")]
    Configuration(String),

    /// The research question is blank
    #[error("Research question is empty")]
    EmptyQuestion,

    /// Every rephrasing candidate failed
    #[error("No usable question candidate after {attempted} attempts")]
    NoUsableCandidates {
        /// Number of candidate completions requested
        attempted: usize,
    },

    /// The selection strategy could not pick a candidate
    #[error("Selection error: {0}")]
    Selection(String),

    /// The run was cancelled by the caller
    #[error("Run cancelled at stage {stage}")]
    Cancelled {
        /// Stage that was in flight
        stage: String,
    },

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrategyError {
    /// Name of the stage the error was raised in, if it is stage-scoped.
    pub fn stage(&self) -> Option<&str> {
        match self {
            StrategyError::CompletionTransport { stage, .. }
            | StrategyError::Timeout { stage, .. }
            | StrategyError::Extraction { stage, .. }
            | StrategyError::Cancelled { stage } => Some(stage.as_str()),
            StrategyError::Classification(_) => Some("Classify"),
            StrategyError::DatabaseListParse(_) => Some("Database List Parse"),
            StrategyError::NoUsableCandidates { .. } => Some("Rephrase"),
            StrategyError::Selection(_) => Some("Select"),
            _ => None,
        }
    }

    /// Whether a second attempt at the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrategyError::CompletionTransport { .. } | StrategyError::Timeout { .. }
        )
    }

    pub(crate) fn extraction(stage: impl Into<String>, message: impl Into<String>) -> Self {
        StrategyError::Extraction {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using `StrategyError`
pub type Result<T> = std::result::Result<T, StrategyError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with an extraction error for `stage`
    fn ok_or_extraction(self, stage: &str, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_extraction(self, stage: &str, msg: &str) -> Result<T> {
        self.ok_or_else(|| StrategyError::extraction(stage, msg))
    }
}
