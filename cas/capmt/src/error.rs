use std::io;
use std::sync::Arc;

use thiserror::Error;

/**
    Errors talking to a local CAM.
*/
#[derive(Debug, Clone, Error)]
pub enum CapmtError {
    // ── Transport ───────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed by CAM")]
    Closed,

    #[error("cannot bind control word port {port}: {source}")]
    Bind { port: u16, source: Arc<io::Error> },

    #[error("no free socket slot for service {0}")]
    SocketTableFull(u16),

    // ── Records ─────────────────────────────────────────────────────────
    #[error("record of {actual} bytes, expected {expected}")]
    ShortRecord { expected: usize, actual: usize },

    #[error("unknown request code {0:#010x}")]
    UnknownRequest(u32),

    #[error("descrambler index {0} out of range")]
    InvalidIndex(i32),

    #[error("invalid parity {0}")]
    InvalidParity(u32),
}

impl From<io::Error> for CapmtError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, CapmtError>;
