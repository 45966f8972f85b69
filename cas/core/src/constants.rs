use std::time::Duration;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const CONTROL_WORD_LEN: usize = 8;

// ── Table ids ────────────────────────────────────────────────────────────

pub const TABLE_ID_ECM_EVEN: u8 = 0x80;
pub const TABLE_ID_ECM_ODD: u8 = 0x81;

/**
    Largest CA section we accept from the demux (ECM or EMM).
*/
pub const MAX_CA_SECTION_LEN: usize = 4096;

// ── Descrambling ─────────────────────────────────────────────────────────

/**
    Cluster size used when a cipher gives no parallelism hint.
*/
pub const DEFAULT_CLUSTER_SIZE: usize = 32;

/**
    Scrambled packets an instance may see without a key before the
    dispatcher counts it as refusing access.
*/
pub const UNKEYED_PACKET_LIMIT: u64 = 20_000;

// ── Reconnect policy ─────────────────────────────────────────────────────

pub const RETRY_ACTIVE_DELAY: Duration = Duration::from_secs(3);
pub const RETRY_IDLE_DELAY: Duration = Duration::from_secs(60);
