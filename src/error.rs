use thiserror::Error;

/// The error kinds the top-level CLI dispatch can observe. Every fatal
/// condition in the system ends up as one of these before it reaches `main`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("filesystem or syscall error: {0}")]
    Io(#[from] std::io::Error),

    #[error("syscall error: {0}")]
    Nix(#[from] nix::Error),

    #[error("registry or image error: {0}")]
    Registry(String),

    #[error("malformed on-disk JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
