use thiserror::Error;

pub type Result<T> = std::result::Result<T, HaulError>;

#[derive(Debug, Error)]
pub enum HaulError {
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("stale run: {0}")]
    StaleRun(String),

    #[error("run timed out: {0}")]
    Timeout(String),

    #[error("snapshot index corrupt at '{path}': {detail}")]
    IndexCorrupt { path: String, detail: String },

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("upload failed after {attempts} attempts: {detail}")]
    UploadFailed { attempts: u32, detail: String },

    #[error("compose failed: {0}")]
    ComposeFailed(String),

    #[error("interrupted by signal")]
    Interrupted,

    #[error("object store error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HaulError {
    /// Process exit code for this error. Everything fatal maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Whether a later invocation can pick the run back up from staging.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            HaulError::UploadFailed { .. }
                | HaulError::ComposeFailed(_)
                | HaulError::SnapshotFailed(_)
        )
    }
}
