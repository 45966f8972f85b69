use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_PORT;

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_adapters() -> Vec<u8> {
    vec![0]
}

/**
    How CA_PMT objects reach the CAM and how control words come back.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapmtMode {
    /// One shared socket for all services, 18-byte records over UDP.
    Classic,
    /// One socket per service id, `CA_SET_PID`/`CA_SET_DESCR` records.
    #[default]
    Oscam,
}

impl fmt::Display for CapmtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => f.write_str("classic"),
            Self::Oscam => f.write_str("oscam"),
        }
    }
}

/**
    Where OSCam-mode `CA_SET_PID`/`CA_SET_DESCR` records are read from.
    Classic mode always listens on UDP.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// The CAM socket itself, each record prefixed with its adapter index.
    #[default]
    Socket,
    /// Loopback UDP on `port + adapter`.
    Udp,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => f.write_str("socket"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapmtConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub socket_path: PathBuf,
    /// Control words for adapter `n` arrive on UDP `port + n`.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: CapmtMode,
    #[serde(default)]
    pub records: RecordSource,
    #[serde(default = "default_adapters")]
    pub adapters: Vec<u8>,
    #[serde(default)]
    pub comment: String,
}

impl CapmtConfig {
    pub fn port_for(&self, adapter: u8) -> u16 {
        self.port.wrapping_add(u16::from(adapter))
    }

    /// Records come over loopback UDP rather than the CAM socket.
    pub fn uses_udp(&self) -> bool {
        self.mode == CapmtMode::Classic || self.records == RecordSource::Udp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: CapmtConfig = serde_yaml::from_str(
            r#"
            id: oscam
            socket_path: /tmp/camd.socket
            "#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, CapmtMode::Oscam);
        assert_eq!(config.adapters, vec![0]);
        assert_eq!(config.records, RecordSource::Socket);
        assert!(!config.uses_udp());
        assert_eq!(config.port_for(2), 9002);
    }

    #[test]
    fn classic_mode() {
        let config: CapmtConfig = serde_json::from_str(
            r#"{"id":"cam","socket_path":"/tmp/x","mode":"classic","adapters":[0,1],"port":5000}"#,
        )
        .unwrap();
        assert_eq!(config.mode, CapmtMode::Classic);
        assert_eq!(config.adapters, vec![0, 1]);
        assert!(config.uses_udp());
    }

    #[test]
    fn oscam_records_over_udp() {
        let config: CapmtConfig = serde_yaml::from_str(
            r#"
            id: oscam
            socket_path: /tmp/camd.socket
            records: udp
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, CapmtMode::Oscam);
        assert!(config.uses_udp());
    }
}
