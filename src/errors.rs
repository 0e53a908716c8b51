//! Typed error hierarchy for the preview orchestrator.
//!
//! `OrchestratorError` covers every failure the pipeline, the compute client,
//! the garbage collector and the local preview proxy can produce. Pipeline
//! steps are classified with [`OrchestratorError::is_fatal`]: non-fatal errors
//! are logged at the step boundary and never propagate.

use thiserror::Error;

/// Default number of characters of upstream error text kept on an error.
pub const DEFAULT_MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Generation {id} not found")]
    GenerationNotFound { id: String },

    #[error("Invalid generation id '{id}'")]
    InvalidGenerationId { id: String },

    #[error("No workspace or archive available for generation {generation_id}")]
    SourceUnavailable { generation_id: String },

    #[error("Failed to materialize archive for generation {generation_id}: {message}")]
    ArchiveFailed {
        generation_id: String,
        message: String,
    },

    #[error("Dependency install failed: {message}")]
    DependencyInstallFailed { message: String },

    #[error("Schema step '{step}' failed: {message}")]
    SchemaStepFailed { step: String, message: String },

    #[error("Seed script failed: {message}")]
    SeedFailed { message: String },

    #[error("Provisioning instance {instance} failed: {message}")]
    ProvisionFailed { instance: String, message: String },

    #[error("Deploy to {instance} failed: {message}")]
    DeployFailed { instance: String, message: String },

    #[error("Deploy to {instance} did not go live within {wait_secs}s")]
    DeployTimeout { instance: String, wait_secs: u64 },

    #[error("Screenshot of {url} failed: {message}")]
    ScreenshotFailed { url: String, message: String },

    #[error("Compute API error: {0}")]
    ComputeApi(String),

    #[error("Generation {generation_id} has no running preview")]
    NoPreview { generation_id: String },

    #[error("Workspace for generation {generation_id} is in use (status {status})")]
    WorkspaceInUse {
        generation_id: String,
        status: String,
    },

    #[error("No ready local preview")]
    PreviewNotReady,

    #[error("Local preview unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Local preview for {generation_id} failed to start: {message}")]
    PreviewStartFailed {
        generation_id: String,
        message: String,
    },

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether this error aborts the pipeline. Schema, seed and screenshot
    /// failures are always swallowed at the step boundary.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::SchemaStepFailed { .. }
                | OrchestratorError::SeedFailed { .. }
                | OrchestratorError::ScreenshotFailed { .. }
        )
    }

    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        OrchestratorError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Keep the last `max_chars` characters of `text`, marking the cut.
///
/// The tail is kept because installers and build tools print the actual
/// failure last.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    format!("...{}", tail)
}
