use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("session is closed")]
    ClosedSession,
    #[error("operation timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}
