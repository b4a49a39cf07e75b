use thiserror::Error;

/// Connection-level failures. There is exactly one connection per run, so
/// any of these is fatal to the run; the process exits nonzero.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("network I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed (reason {0})")]
    AuthFailed(u8),

    #[error("crypto setup failed: {0}")]
    CryptoSetup(String),

    #[error(transparent)]
    Engine(#[from] common::EngineError),
}

pub type NetResult<T> = Result<T, NetError>;
