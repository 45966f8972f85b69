pub mod capmt;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod instance;
pub mod keystore;
pub mod records;

pub use self::capmt::{CaPmt, Command, ListManagement, VersionCounter};
pub use self::client::{CapmtClient, SessionState};
pub use self::config::{CapmtConfig, CapmtMode, RecordSource};
pub use self::error::{CapmtError, Result};
pub use self::instance::CapmtInstance;
pub use self::keystore::{KeyStore, StagedKeys};
pub use self::records::{ClassicRecord, OscamRecord};
