pub mod card;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod emm;
pub mod error;
pub mod instance;
pub mod message;

pub use self::card::{CardInfo, CardSystem};
pub use self::client::{CwcClient, SessionState};
pub use self::config::CwcConfig;
pub use self::error::{CwcError, Result};
pub use self::instance::CwcInstance;
