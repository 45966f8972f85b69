use std::sync::Arc;

use cas_capmt::CapmtClient;
use cas_core::{Activity, CasClient, CcwClient};
use cas_cwc::CwcClient;

use crate::config::ClientConfig;

/**
    Build and start the client described by `config`.

    Network clients spawn their session task immediately, so this must run
    inside the runtime.
*/
pub fn build_client(config: ClientConfig, activity: Arc<Activity>) -> Arc<dyn CasClient> {
    match config {
        ClientConfig::Cwc(config) => CwcClient::spawn(config, activity),
        ClientConfig::Capmt(config) => CapmtClient::spawn(config, activity),
        ClientConfig::Ccw(config) => CcwClient::new(config),
    }
}

#[cfg(test)]
mod tests {
    use cas_core::{CcwConfig, ClientKind};

    use super::*;

    #[tokio::test]
    async fn builds_each_kind() {
        let activity = Arc::new(Activity::new());
        let ccw = ClientConfig::Ccw(CcwConfig {
            id: "fixed".into(),
            enabled: true,
            caid: 0x0600,
            tsid: 1,
            sid: 100,
            key: [1, 2, 3, 4, 5, 6, 7, 8],
            comment: String::new(),
        });
        let client = build_client(ccw, Arc::clone(&activity));
        assert_eq!(client.id(), "fixed");
        assert_eq!(client.kind(), ClientKind::Ccw);

        let capmt: ClientConfig = serde_yaml::from_str(
            "{ type: capmt, id: softcam, enabled: false, socket_path: /nonexistent/camd.socket }",
        )
        .unwrap();
        let client = build_client(capmt, activity);
        assert_eq!(client.kind(), ClientKind::Capmt);
        assert!(!client.status().connected);
        client.shutdown().await;
    }
}
