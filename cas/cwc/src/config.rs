use serde::{Deserialize, Serialize};

use crate::constants::DES_KEY_LEN;

fn default_enabled() -> bool {
    true
}

/**
    Configuration of one card server connection.
*/
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CwcConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(with = "cas_core::utils::hex_key")]
    pub deskey: [u8; DES_KEY_LEN],
    /// Forward EMMs to the card.
    #[serde(default)]
    pub emm: bool,
    #[serde(default)]
    pub comment: String,
}

impl std::fmt::Debug for CwcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CwcConfig")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("emm", &self.emm)
            .finish_non_exhaustive()
    }
}
