use thiserror::Error;

/// Engine-level failures. Per-file errors never surface here -- they flip
/// the affected job to `Failed` and are accounted in `CopyStats`; an
/// `EngineError` tears down the worker (and with it the run).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("submission queue full after drain")]
    RingFull,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
