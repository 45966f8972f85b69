use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use cas_core::{
    CaidEntry, ControlWord, Descrambler, DescramblerInstance, EcmOffer, EcmTrackerSet, KeyState,
    SectionContext, Service,
};
use tracing::{debug, info, warn};

use crate::card::CardSystem;
use crate::client::CwcClient;
use crate::constants::{ECM_REPLY_MIN_LEN, MSG_ECM_EVEN, MSG_ECM_ODD};

/**
    Descrambler fed by a CWC card server.
*/
pub struct CwcInstance {
    client: Arc<CwcClient>,
    service_key: u64,
    service_name: String,
    service_id: u16,
    instance: DescramblerInstance,
    trackers: EcmTrackerSet,
    /// Irdeto channel that last produced keys.
    ok_channel: Option<u16>,
}

impl CwcInstance {
    pub(crate) fn new(
        client: Arc<CwcClient>,
        service: &Arc<Service>,
        instance: DescramblerInstance,
    ) -> Self {
        Self {
            client,
            service_key: service.key(),
            service_name: service.info().name.clone(),
            service_id: service.info().service_id,
            instance,
            trackers: EcmTrackerSet::new(),
            ok_channel: None,
        }
    }

    pub(crate) fn is_owned_by(&self, client: &CwcClient) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.client), client)
    }

    pub fn trackers(&self) -> &EcmTrackerSet {
        &self.trackers
    }

    fn handle_ecm(&mut self, ctx: &SectionContext<'_>, ecm: &[u8]) {
        if !self.client.is_running() {
            self.instance.set_key_state(KeyState::Unknown);
            return;
        }
        if self.instance.key_state() == KeyState::Forbidden {
            return;
        }

        let Some(entry) = ctx
            .caids
            .iter()
            .filter(|c| c.pid == ctx.pid)
            .find(|c| self.client.accepts_stream(c))
        else {
            return;
        };

        let irdeto = CardSystem::from_caid(entry.caid) == CardSystem::Irdeto;
        let (section, last_section, channel) = if irdeto {
            if ecm.len() < 8 {
                return;
            }
            (ecm[4], ecm[5], Some(u16::from_be_bytes([ecm[6], ecm[7]])))
        } else {
            (0, 0, None)
        };

        let tracker = self.trackers.get_or_insert(ctx.pid);
        match tracker.offer(section, last_section, ecm) {
            EcmOffer::Fresh => {}
            EcmOffer::Duplicate | EcmOffer::Busy => return,
        }

        if let (Some(locked), Some(channel)) = (self.ok_channel, channel) {
            if locked != channel {
                debug!(
                    client = %self.client.config().id,
                    service = %self.service_name,
                    channel,
                    locked,
                    "ECM for other channel skipped"
                );
                return;
            }
        }

        let Some(sequence) = self.client.enqueue(ecm, self.service_id) else {
            return;
        };
        tracker.record_request(section, ecm, sequence, channel, Instant::now());
        debug!(
            client = %self.client.config().id,
            service = %self.service_name,
            pid = ctx.pid,
            caid = format_args!("{:04x}", entry.caid),
            section,
            last_section,
            sequence,
            "ECM sent"
        );
    }

    /**
        Apply a reply to an ECM request. Returns `false` if no section of
        this instance was waiting for `sequence`.
    */
    pub(crate) fn ecm_reply(&mut self, sequence: u16, body: &[u8]) -> bool {
        let ok = body.len() >= ECM_REPLY_MIN_LEN
            && matches!(body.first(), Some(&MSG_ECM_EVEN | &MSG_ECM_ODD));
        let Some((pid, section)) = self.trackers.complete(sequence, ok) else {
            return false;
        };
        let client_id = &self.client.config().id;
        let channel = self
            .trackers
            .get(pid)
            .and_then(|t| t.section(section))
            .and_then(|s| s.channel);

        if !ok {
            debug!(client = %client_id, service = %self.service_name, pid, section, "ECM rejected");
            if channel.is_some() && channel == self.ok_channel {
                debug!(client = %client_id, service = %self.service_name, ?channel, "channel lock released");
                self.ok_channel = None;
            }
            if self.trackers.all_rejected() && self.instance.key_state() != KeyState::Forbidden {
                warn!(client = %client_id, service = %self.service_name, "access denied");
                self.instance.set_key_state(KeyState::Forbidden);
            }
            return true;
        }

        if channel.is_some() {
            self.ok_channel = channel;
        }

        let (Some(even), Some(odd)) = (
            ControlWord::from_slice(&body[3..11]),
            ControlWord::from_slice(&body[11..19]),
        ) else {
            return true;
        };
        if self.instance.key_state() != KeyState::Resolved {
            info!(client = %client_id, service = %self.service_name, "obtained key");
        }
        debug!(client = %client_id, service = %self.service_name, pid, section, ?even, ?odd, "control words");
        self.instance.set_keys(even, odd);
        self.instance.set_key_state(KeyState::Resolved);
        true
    }

    /**
        The session ended: keys and outstanding requests are void.
    */
    pub(crate) fn connection_lost(&mut self) {
        self.instance.reset_keys();
        self.trackers.clear();
        self.ok_channel = None;
    }
}

impl Descrambler for CwcInstance {
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
        if data.len() < 3 || data[0] & 0xf0 != 0x80 {
            return;
        }
        let len = ((usize::from(data[1] & 0x0f) << 8) | usize::from(data[2])) + 3;
        let Some(section) = data.get(..len) else {
            warn!(client = %self.client.config().id, pid = ctx.pid, len = data.len(), "truncated CA section");
            return;
        };

        match section[0] {
            MSG_ECM_EVEN | MSG_ECM_ODD => self.handle_ecm(ctx, section),
            _ => self.client.forward_emm(section),
        }
    }

    fn stop(&mut self, deliver: &mut dyn FnMut(&[u8])) {
        self.instance.flush(deliver);
        self.client.detach(self.service_key);
        debug!(client = %self.client.config().id, service = %self.service_name, "descrambler stopped");
    }

    fn caid_change(&mut self, _caids: &[CaidEntry]) {
        self.connection_lost();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::card::CardInfo;
    use crate::client::Outbound;
    use crate::config::CwcConfig;
    use cas_core::{ProviderRecord, Registry, ServiceInfo};

    fn config() -> CwcConfig {
        CwcConfig {
            id: "cwc".to_string(),
            enabled: true,
            hostname: "localhost".to_string(),
            port: 12000,
            username: "user".to_string(),
            password: "pass".to_string(),
            deskey: hex!("0102030405060708091011121314"),
            emm: false,
            comment: String::new(),
        }
    }

    fn card(caid: u16) -> CardInfo {
        CardInfo {
            caid,
            user: 1,
            unique_address: hex!("0000000012345678"),
            providers: vec![ProviderRecord {
                caid,
                provider_id: 0x000100,
                shared_address: [0; 8],
            }],
        }
    }

    fn info() -> ServiceInfo {
        ServiceInfo {
            name: "test".to_string(),
            service_id: 100,
            transport_stream_id: 1,
            ..Default::default()
        }
    }

    struct Setup {
        rx: UnboundedReceiver<Outbound>,
        service: Arc<Service>,
        registry: Registry,
    }

    fn setup(caid: u16) -> Setup {
        let (client, rx) = CwcClient::connected(config(), card(caid));
        let registry = Registry::new();
        registry.add_client(client).unwrap();
        let service = registry.service_started(
            info(),
            vec![CaidEntry::new(caid, 0x100, 0)],
            Box::new(|_: &[u8]| {}),
        );
        Setup {
            rx,
            service,
            registry,
        }
    }

    fn section(service: &Service, data: &[u8]) {
        let mut streams = service.streams();
        let caids = streams.caids.clone();
        let ctx = SectionContext {
            service: service.info(),
            pid: 0x100,
            caids: &caids,
        };
        for d in streams.descramblers.iter_mut() {
            d.handle_section(&ctx, data);
        }
    }

    fn reply(service: &Service, sequence: u16, body: &[u8]) -> bool {
        let mut streams = service.streams();
        let instance = streams.find_instance::<CwcInstance>(|_| true).unwrap();
        instance.ecm_reply(sequence, body)
    }

    fn key_state(service: &Service) -> KeyState {
        service.streams().descramblers[0].key_state()
    }

    fn ecm(fill: u8) -> Vec<u8> {
        let mut ecm = vec![0x80, 0x70, 0x08];
        ecm.extend_from_slice(&[fill; 8]);
        ecm
    }

    fn ok_reply() -> Vec<u8> {
        let mut body = vec![0x80, 0x00, 0x10];
        body.extend_from_slice(&hex!("1111111111111111"));
        body.extend_from_slice(&hex!("2222222222222222"));
        body
    }

    #[test]
    fn same_ecm_is_sent_once() {
        let mut s = setup(0x0500);
        section(&s.service, &ecm(1));
        section(&s.service, &ecm(1));
        let out = s.rx.try_recv().unwrap();
        assert_eq!(out.msg, ecm(1));
        assert_eq!(out.service_id, 100);
        assert!(s.rx.try_recv().is_err());

        // a different ECM while the first is pending is dropped
        section(&s.service, &ecm(2));
        assert!(s.rx.try_recv().is_err());

        assert!(reply(&s.service, out.sequence, &ok_reply()));
        section(&s.service, &ecm(2));
        assert_eq!(s.rx.try_recv().unwrap().msg, ecm(2));
    }

    #[test]
    fn reply_resolves_keys() {
        let mut s = setup(0x0500);
        section(&s.service, &ecm(1));
        let out = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, out.sequence, &ok_reply()));

        let streams = s.service.streams();
        let instance = streams.descramblers[0].instance();
        assert_eq!(instance.key_state(), KeyState::Resolved);
        assert_eq!(
            instance.control_words(),
            (
                ControlWord(hex!("1111111111111111")),
                ControlWord(hex!("2222222222222222"))
            )
        );
    }

    #[test]
    fn unknown_sequence_is_not_consumed() {
        let s = setup(0x0500);
        assert!(!reply(&s.service, 42, &ok_reply()));
    }

    #[test]
    fn rejected_sections_converge_to_forbidden() {
        let mut s = setup(0x0500);
        section(&s.service, &ecm(1));
        let out = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, out.sequence, &[0x80, 0x00, 0x00]));
        assert_eq!(key_state(&s.service), KeyState::Forbidden);

        // no more requests until the CAIDs change
        section(&s.service, &ecm(2));
        assert!(s.rx.try_recv().is_err());

        s.registry
            .caids_changed(&s.service, vec![CaidEntry::new(0x0500, 0x100, 0)]);
        assert_eq!(key_state(&s.service), KeyState::Unknown);
        section(&s.service, &ecm(2));
        assert_eq!(s.rx.try_recv().unwrap().msg, ecm(2));
    }

    #[test]
    fn foreign_caid_is_not_relayed() {
        let (client, mut rx) = CwcClient::connected(config(), card(0x0500));
        let registry = Registry::new();
        registry.add_client(client).unwrap();
        let service = registry.service_started(
            info(),
            vec![CaidEntry::new(0x0500, 0x100, 0x000200)],
            Box::new(|_: &[u8]| {}),
        );
        section(&service, &ecm(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn irdeto_locks_to_resolved_channel() {
        let mut s = setup(0x0604);
        let irdeto = |section: u8, channel: u16| {
            let mut ecm = vec![0x80, 0x70, 0x08, 0x00, section, 0x01];
            ecm.extend_from_slice(&channel.to_be_bytes());
            ecm.extend_from_slice(&[0xaa; 3]);
            ecm
        };

        section(&s.service, &irdeto(0, 7));
        let first = s.rx.try_recv().unwrap();
        section(&s.service, &irdeto(1, 9));
        let second = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, first.sequence, &ok_reply()));

        // channel 7 resolved, channel 9 gets dropped from now on
        assert!(reply(&s.service, second.sequence, &[0x80, 0, 0]));
        let mut other = irdeto(1, 9);
        other[10] = 0xbb;
        section(&s.service, &other);
        assert!(s.rx.try_recv().is_err());

        let mut again = irdeto(0, 7);
        again[10] = 0xbb;
        section(&s.service, &again);
        assert_eq!(s.rx.try_recv().unwrap().msg, again);
    }

    fn irdeto_ecm(section: u8, last_section: u8, channel: u16, fill: u8) -> Vec<u8> {
        let mut ecm = vec![0x80, 0x70, 0x08, 0x00, section, last_section];
        ecm.extend_from_slice(&channel.to_be_bytes());
        ecm.extend_from_slice(&[fill; 3]);
        ecm
    }

    #[test]
    fn irdeto_forbidden_only_after_every_section() {
        let mut s = setup(0x0604);
        section(&s.service, &irdeto_ecm(0, 1, 7, 0xaa));
        let first = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, first.sequence, &[0x80, 0, 0]));
        assert_eq!(key_state(&s.service), KeyState::Unknown);

        section(&s.service, &irdeto_ecm(1, 1, 7, 0xaa));
        let second = s.rx.try_recv().unwrap();
        assert_eq!(key_state(&s.service), KeyState::Unknown);
        assert!(reply(&s.service, second.sequence, &[0x80, 0, 0]));
        assert_eq!(key_state(&s.service), KeyState::Forbidden);
    }

    #[test]
    fn rejected_channel_releases_lock() {
        let mut s = setup(0x0604);
        section(&s.service, &irdeto_ecm(0, 1, 7, 0xaa));
        let first = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, first.sequence, &ok_reply()));

        // locked to channel 7
        section(&s.service, &irdeto_ecm(1, 1, 9, 0xaa));
        assert!(s.rx.try_recv().is_err());

        section(&s.service, &irdeto_ecm(0, 1, 7, 0xbb));
        let refused = s.rx.try_recv().unwrap();
        assert!(reply(&s.service, refused.sequence, &[0x80, 0, 0]));

        let other = irdeto_ecm(1, 1, 9, 0xcc);
        section(&s.service, &other);
        assert_eq!(s.rx.try_recv().unwrap().msg, other);
    }

    #[test]
    fn emm_sections_go_through_the_filter() {
        let mut s = setup(0x0b00);
        let emm = hex!("82700700000000000000");
        section(&s.service, &emm);
        let out = s.rx.try_recv().unwrap();
        assert_eq!(out.msg, emm);
        assert_eq!(out.service_id, 0);

        // recently forwarded
        section(&s.service, &emm);
        assert!(s.rx.try_recv().is_err());
    }
}
