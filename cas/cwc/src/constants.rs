use std::time::Duration;

/**
    Largest message on the wire, length prefix included.
*/
pub const NETMSG_SIZE: usize = 272;

/**
    Plain message header: length, sequence, service id, 6 reserved bytes.
*/
pub const HEADER_SIZE: usize = 12;

pub const DES_KEY_LEN: usize = 14;

// ── Message types ────────────────────────────────────────────────────────

pub const MSG_ECM_EVEN: u8 = 0x80;
pub const MSG_ECM_ODD: u8 = 0x81;

pub const MSG_CLIENT_LOGIN: u8 = 0xe0;
pub const MSG_CLIENT_LOGIN_ACK: u8 = 0xe1;
pub const MSG_CLIENT_LOGIN_NAK: u8 = 0xe2;
pub const MSG_CARD_DATA_REQ: u8 = 0xe3;
pub const MSG_CARD_DATA: u8 = 0xe4;
pub const MSG_KEEPALIVE: u8 = 0xfd;

/**
    Shortest ECM reply that carries a control word pair.
*/
pub const ECM_REPLY_MIN_LEN: usize = 19;

// ── Timeouts ─────────────────────────────────────────────────────────────

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const LOGIN_KEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const BODY_TIMEOUT: Duration = Duration::from_secs(1);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ── EMM ──────────────────────────────────────────────────────────────────

pub const EMM_CACHE_SIZE: usize = 32;
