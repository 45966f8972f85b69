use std::any::Any;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cipher::CipherFactory;
use crate::client::{CasClient, ClientStatus, Descrambler, SectionContext};
use crate::instance::DescramblerInstance;
use crate::service::{AttachedServices, Service};
use crate::types::{CaidEntry, ClientKind, ControlWord, KeyState};

fn default_enabled() -> bool {
    true
}

fn apply_key(instance: &mut DescramblerInstance, config: &CcwConfig) {
    let key = ControlWord(config.key);
    instance.set_keys(key, key);
    instance.set_key_state(KeyState::Resolved);
}

/**
    A fixed control word for one service.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcwConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub caid: u16,
    pub tsid: u16,
    pub sid: u16,
    #[serde(with = "crate::utils::hex_key")]
    pub key: [u8; 8],
    #[serde(default)]
    pub comment: String,
}

/**
    Constant control word client. No network, no ECMs: a matching service
    is resolved as soon as it starts.
*/
pub struct CcwClient {
    config: CcwConfig,
    attached: AttachedServices,
}

impl CcwClient {
    pub fn new(config: CcwConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            attached: AttachedServices::new(),
        })
    }

    pub fn config(&self) -> &CcwConfig {
        &self.config
    }
}

impl CasClient for CcwClient {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Ccw
    }

    fn start_service(
        self: Arc<Self>,
        service: &Arc<Service>,
        caids: &[CaidEntry],
        cipher: &CipherFactory,
    ) -> Option<Box<dyn Descrambler>> {
        let config = &self.config;
        let info = service.info();
        if !config.enabled
            || !caids.iter().any(|c| c.caid == config.caid)
            || info.service_id != config.sid
            || info.transport_stream_id != config.tsid
        {
            return None;
        }

        let mut instance = DescramblerInstance::new(cipher());
        apply_key(&mut instance, config);
        self.attached.attach(service);

        info!(client = %config.id, service = %info.name, caid = format_args!("{:04x}", config.caid), "constant key applied");
        Some(Box::new(CcwInstance {
            client: Arc::clone(&self),
            service_key: service.key(),
            instance,
        }))
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            id: self.config.id.clone(),
            kind: ClientKind::Ccw,
            enabled: self.config.enabled,
            connected: self.config.enabled,
            state: "static".to_string(),
            comment: self.config.comment.clone(),
            caid: Some(self.config.caid),
            providers: 0,
            services: self.attached.statuses(&self.config.id),
        }
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

pub struct CcwInstance {
    client: Arc<CcwClient>,
    service_key: u64,
    instance: DescramblerInstance,
}

impl Descrambler for CcwInstance {
    fn client_id(&self) -> &str {
        &self.client.config.id
    }

    fn instance(&self) -> &DescramblerInstance {
        &self.instance
    }

    fn instance_mut(&mut self) -> &mut DescramblerInstance {
        &mut self.instance
    }

    fn handle_section(&mut self, ctx: &SectionContext<'_>, data: &[u8]) {
        debug!(
            client = %self.client.config.id,
            service = %ctx.service.name,
            pid = ctx.pid,
            table_id = data[0],
            "section ignored by constant key client"
        );
    }

    fn stop(&mut self, deliver: &mut dyn FnMut(&[u8])) {
        self.instance.flush(deliver);
        self.client.attached.detach(self.service_key);
    }

    fn caid_change(&mut self, caids: &[CaidEntry]) {
        let config = &self.client.config;
        if caids.iter().any(|c| c.caid == config.caid) {
            if self.instance.key_state() != KeyState::Resolved {
                debug!(client = %config.id, "constant key re-applied");
            }
            apply_key(&mut self.instance, config);
        } else {
            self.instance.reset_keys();
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
