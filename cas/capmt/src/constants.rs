use std::time::Duration;

// ── CA_PMT ──────────────────────────────────────────────────────────────

/// `ca_pmt` APDU tag followed by a two-byte length field.
pub const CAPMT_INDICATOR: [u8; 4] = [0x9f, 0x80, 0x32, 0x82];
pub const CAPMT_HEADER_SIZE: usize = 13;

pub const DESC_CA: u8 = 0x09;
pub const DESC_PRIVATE: u8 = 0x81;
pub const DESC_DEMUX: u8 = 0x82;
pub const DESC_PID: u8 = 0x84;

/// Room for the largest vendor CA descriptor payload.
pub const CA_DESCRIPTOR_DATA_LEN: usize = 17;

pub const PMT_VERSION_MAX: u8 = 31;

// ── Receive records ─────────────────────────────────────────────────────

/// `{seq:u16, even[8], odd[8]}`
pub const CLASSIC_RECORD_LEN: usize = 18;

/// Request codes as the CAM writes them, i.e. the Linux DVB ioctl numbers.
pub const CA_SET_DESCR: u32 = 0x4010_6f86;
pub const CA_SET_PID: u32 = 0x4008_6f87;

/// Demux requests the CAM may interleave on its socket; read and skipped.
pub const DMX_STOP: u32 = 0x0000_6f2a;
pub const DMX_SET_FILTER: u32 = 0x403c_6f2b;

pub const REQUEST_CODE_LEN: usize = 4;
/// Adapter index byte in front of every record read from the CAM socket.
pub const ADAPTER_TAG_LEN: usize = 1;
/// `{pid:u32, index:i32}`
pub const CA_PID_LEN: usize = 8;
/// `{index:u32, parity:u32, cw[8]}`
pub const CA_DESCR_LEN: usize = 16;
/// Demux index and filter number, then `dmx_sct_filter_params`.
pub const DMX_SET_FILTER_LEN: usize = 2 + 60;
pub const DMX_STOP_LEN: usize = 4;

/// Descrambler slots per adapter.
pub const MAX_INDEX: i32 = 64;

pub const RECV_BUFFER_SIZE: usize = 64;

// ── Sockets ─────────────────────────────────────────────────────────────

/// Simultaneous per-service sockets in OSCam mode.
pub const MAX_SID_SOCKETS: usize = 16;

pub const DEFAULT_PORT: u16 = 9000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
