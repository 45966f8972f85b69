use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use cas_capmt::CapmtConfig;
use cas_core::{CcwConfig, ClientKind};
use cas_cwc::CwcConfig;
use serde::Deserialize;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9982))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/**
    One configured CA client, tagged by `type`.
*/
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientConfig {
    Cwc(CwcConfig),
    Capmt(CapmtConfig),
    Ccw(CcwConfig),
}

impl ClientConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Cwc(c) => &c.id,
            Self::Capmt(c) => &c.id,
            Self::Ccw(c) => &c.id,
        }
    }

    pub fn kind(&self) -> ClientKind {
        match self {
            Self::Cwc(_) => ClientKind::Cwc,
            Self::Capmt(_) => ClientKind::Capmt,
            Self::Ccw(_) => ClientKind::Ccw,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Cwc(c) => c.enabled,
            Self::Capmt(c) => c.enabled,
            Self::Ccw(c) => c.enabled,
        }
    }

    /**
        One-line summary without secrets.
    */
    pub fn describe(&self) -> String {
        match self {
            Self::Cwc(c) => format!("{}:{} as {}", c.hostname, c.port, c.username),
            Self::Capmt(c) if c.uses_udp() => format!(
                "{} ({} mode, records on udp port {}, adapters {:?})",
                c.socket_path.display(),
                c.mode,
                c.port,
                c.adapters
            ),
            Self::Capmt(c) => format!(
                "{} ({} mode, records on socket, adapters {:?})",
                c.socket_path.display(),
                c.mode,
                c.adapters
            ),
            Self::Ccw(c) => format!("caid {:04x} tsid {} sid {}", c.caid, c.tsid, c.sid),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub admin: AdminConfig,
    /// Overrides the cipher's preferred cluster size.
    #[serde(default)]
    pub cluster_size: Option<usize>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for client in &self.clients {
            if client.id().is_empty() {
                bail!("client with empty id");
            }
            if !ids.insert(client.id()) {
                bail!("duplicate client id '{}'", client.id());
            }
        }
        if self.cluster_size == Some(0) {
            bail!("cluster_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const SAMPLE: &str = r#"
admin:
  listen: 0.0.0.0:9982
cluster_size: 64
clients:
  - type: cwc
    id: card1
    hostname: cardserver.local
    port: 12000
    username: user
    password: secret
    deskey: "01:02:03:04:05:06:07:08:09:10:11:12:13:14"
    emm: true
  - type: capmt
    id: oscam
    socket_path: /tmp/camd.socket
    mode: classic
    adapters: [0, 1]
  - type: ccw
    id: fixed
    caid: 1536
    tsid: 1
    sid: 100
    key: "0102030405060708"
"#;

    #[test]
    fn parses_all_client_kinds() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.admin.listen.port(), 9982);
        assert_eq!(config.cluster_size, Some(64));
        assert_eq!(config.clients.len(), 3);

        let ClientConfig::Cwc(cwc) = &config.clients[0] else {
            panic!("cwc expected");
        };
        assert_eq!(cwc.deskey, hex!("0102030405060708091011121314"));
        assert!(cwc.emm);

        assert_eq!(config.clients[1].kind(), ClientKind::Capmt);
        let ClientConfig::Ccw(ccw) = &config.clients[2] else {
            panic!("ccw expected");
        };
        assert_eq!(ccw.caid, 0x0600);
        assert_eq!(ccw.key, hex!("0102030405060708"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.admin.listen, default_listen());
        assert!(config.clients.is_empty());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let text = r#"
clients:
  - { type: ccw, id: a, caid: 1, tsid: 1, sid: 1, key: "0000000000000001" }
  - { type: ccw, id: a, caid: 2, tsid: 1, sid: 1, key: "0000000000000001" }
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn describe_hides_password() {
        let config = Config::parse(SAMPLE).unwrap();
        let line = config.clients[0].describe();
        assert!(line.contains("cardserver.local:12000"));
        assert!(!line.contains("secret"));
    }
}
