use thiserror::Error;

/// Failures inside the storage and endpoint plumbing.
///
/// These never cross the pipeline surface: callers either log and continue
/// or surface the failure through an outcome value.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("endpoint: {0}")]
    Endpoint(String),
}
