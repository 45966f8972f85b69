use thiserror::Error;

/**
    Errors from the descrambling engine core.
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CasError {
    // ── Configuration ───────────────────────────────────────────────────
    #[error("invalid hex key '{value}': expected {expected} bytes")]
    InvalidKey { value: String, expected: usize },

    #[error("client '{0}' already exists")]
    DuplicateClient(String),

    #[error("client '{0}' not found")]
    UnknownClient(String),

    #[error("client '{id}' is a {actual} client, not {expected}")]
    KindMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    // ── Transport stream ────────────────────────────────────────────────
    #[error("TS packet has {0} bytes, expected 188")]
    PacketSize(usize),

    #[error("TS packet sync byte is {0:#04x}")]
    SyncByte(u8),
}

pub type Result<T> = std::result::Result<T, CasError>;
