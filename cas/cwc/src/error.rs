use std::io;
use std::sync::Arc;

use thiserror::Error;

/**
    Errors on a CWC link.
*/
#[derive(Debug, Clone, Error)]
pub enum CwcError {
    // ── Transport ───────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed by server")]
    Closed,

    // ── Framing / link cipher ───────────────────────────────────────────
    #[error("message of {0} bytes is too large")]
    MessageTooLarge(usize),

    #[error("message of {0} bytes is too short")]
    MessageTooShort(usize),

    #[error("cipher text of {0} bytes is not a whole number of blocks")]
    BadCipherLength(usize),

    #[error("message checksum mismatch")]
    Checksum,

    #[error("unexpected message type {0:#04x}")]
    UnexpectedMessage(u8),

    #[error("invalid card data: {0}")]
    CardData(&'static str),

    // ── Authorization ───────────────────────────────────────────────────
    #[error("login rejected by server")]
    LoginRejected,
}

impl From<io::Error> for CwcError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl CwcError {
    /**
        Whether the server refused us, as opposed to a link failure.
    */
    pub fn is_access_error(&self) -> bool {
        matches!(self, Self::LoginRejected)
    }
}

pub type Result<T> = std::result::Result<T, CwcError>;
