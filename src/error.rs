use thiserror::Error;

/// Failures of the browser capability.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start browser: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("navigation to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no link with text {text:?} on {url}")]
    ListingLinkMissing { url: String, text: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("giving up on {url} after {attempts} attempts: {source}")]
    Render {
        url: String,
        attempts: u32,
        #[source]
        source: RenderError,
    },
}

/// Top-level failure of a pipeline run, mapped to a process exit status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("primary store failed ({cause}); run {run_id} written to the fallback journal")]
    Degraded { run_id: i64, cause: String },
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Other(_) => 1,
            PipelineError::Config(_) => 3,
            PipelineError::Discovery(_) => 4,
            PipelineError::Persistence(_) => 5,
            PipelineError::Degraded { .. } => 6,
        }
    }
}
