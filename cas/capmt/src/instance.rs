use std::any::Any;
use std::sync::Arc;

use cas_core::{
    CaidEntry, ControlWord, Descrambler, DescramblerInstance, KeyState, SectionContext, Service,
};
use tracing::{debug, info, warn};

use crate::capmt::{CaPmt, Command, ListManagement};
use crate::client::CapmtClient;

/**
    Descrambler fed by a local CAM. The CAM reads ECMs itself; all we do
    is keep its CA_PMT current and apply the words it sends back.
*/
pub struct CapmtInstance {
    client: Arc<CapmtClient>,
    service_key: u64,
    service_name: String,
    service_id: u16,
    transport_stream_id: u16,
    adapter: u8,
    sequence: u16,
    caids: Vec<CaidEntry>,
    instance: DescramblerInstance,
}

impl CapmtInstance {
    pub(crate) fn new(
        client: Arc<CapmtClient>,
        service: &Arc<Service>,
        caids: Vec<CaidEntry>,
        sequence: u16,
        instance: DescramblerInstance,
    ) -> Self {
        let info = service.info();
        Self {
            client,
            service_key: service.key(),
            service_name: info.name.clone(),
            service_id: info.service_id,
            transport_stream_id: info.transport_stream_id,
            adapter: info.adapter,
            sequence,
            caids,
            instance,
        }
    }

    pub(crate) fn is_owned_by(&self, client: &CapmtClient) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.client), client)
    }

    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    pub fn adapter(&self) -> u8 {
        self.adapter
    }

    /**
        Sequence number the CAM echoes back with our control words.
    */
    pub fn sequence_number(&self) -> u16 {
        self.sequence
    }

    pub fn caids(&self) -> &[CaidEntry] {
        &self.caids
    }

    pub(crate) fn ca_pmt(&self, list: ListManagement, version: u8) -> Vec<u8> {
        if self.instance.key_state() != KeyState::Resolved {
            debug!(client = %self.client.config().id, service = %self.service_name, "requesting key");
        }
        CaPmt {
            list,
            command: Command::OkDescrambling,
            mode: self.client.config().mode,
            service_id: self.service_id,
            transport_stream_id: self.transport_stream_id,
            adapter: self.adapter,
            sequence: self.sequence,
            version,
            caids: &self.caids,
        }
        .encode()
    }

    pub(crate) fn keys_received(&mut self, even: ControlWord, odd: ControlWord) {
        if self.instance.key_state() != KeyState::Resolved {
            info!(client = %self.client.config().id, service = %self.service_name, "obtained key");
        }
        self.instance.set_keys(even, odd);
        self.instance.set_key_state(KeyState::Resolved);
    }

    pub(crate) fn forbid(&mut self) {
        if self.instance.key_state() != KeyState::Forbidden {
            warn!(client = %self.client.config().id, service = %self.service_name, "access denied");
            self.instance.set_key_state(KeyState::Forbidden);
        }
    }

    /**
        Pick up CAIDs announced on `pid` that we have not told the CAM about.
    */
    fn learn_caids(&mut self, ctx: &SectionContext<'_>) -> bool {
        let mut changed = false;
        for entry in ctx.caids.iter().filter(|c| c.pid == ctx.pid) {
            if self.caids.iter().any(|c| c.caid == entry.caid) {
                continue;
            }
            debug!(
                client = %self.client.config().id,
                service = %self.service_name,
                caid = format_args!("{:04x}", entry.caid),
                "new CAID"
            );
            self.caids.push(*entry);
            changed = true;
        }
        changed
    }
}

impl Descrambler for CapmtInstance {
    fn client_id(&self) -> &str {
        &self.client.config().id
    }

    fn instance(&self) -> &DescramblerInstance {
        &self.instance
    }

    fn instance_mut(&mut self) -> &mut DescramblerInstance {
        &mut self.instance
    }

    fn handle_section(&mut self, ctx: &SectionContext<'_>, data: &[u8]) {
        // EMMs are the CAM's business
        if !matches!(data.first(), Some(0x80 | 0x81)) {
            return;
        }
        let changed = self.learn_caids(ctx);
        if !self.client.is_running() {
            self.instance.set_key_state(KeyState::Unknown);
            return;
        }
        if changed {
            self.client.service_changed(self);
        }
    }

    fn stop(&mut self, deliver: &mut dyn FnMut(&[u8])) {
        self.instance.flush(deliver);
        self.client
            .service_stopped(self.service_key, self.service_id, self.sequence);
        info!(client = %self.client.config().id, service = %self.service_name, "CAPMT descrambler removed");
    }

    fn caid_change(&mut self, caids: &[CaidEntry]) {
        self.instance.reset_keys();
        self.caids = caids.to_vec();
        self.client.service_changed(self);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
