use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::cipher::CipherFactory;
use crate::instance::{DescrambleResult, DescramblerInstance};
use crate::registry::ServiceDirectory;
use crate::service::{Service, ServiceInfo};
use crate::types::{CaidEntry, ClientKind, KeyState};

/**
    What a descrambler sees of a table section's origin.
*/
#[derive(Debug, Clone, Copy)]
pub struct SectionContext<'a> {
    pub service: &'a ServiceInfo,
    pub pid: u16,
    pub caids: &'a [CaidEntry],
}

impl SectionContext<'_> {
    /**
        The CAID entry announced on the section's PID, if any.
    */
    pub fn stream_caid(&self) -> Option<&CaidEntry> {
        self.caids.iter().find(|c| c.pid == self.pid)
    }
}

/**
    One client's descrambler attached to one service.

    All methods run with the service stream lock held and must not block.
*/
pub trait Descrambler: Send {
    fn client_id(&self) -> &str;

    fn instance(&self) -> &DescramblerInstance;

    fn instance_mut(&mut self) -> &mut DescramblerInstance;

    /**
        ECM or EMM section for this service.
    */
    fn handle_section(&mut self, ctx: &SectionContext<'_>, data: &[u8]);

    /**
        Detach from the client and flush the partial cluster into `deliver`.
    */
    fn stop(&mut self, deliver: &mut dyn FnMut(&[u8]));

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn descramble(&mut self, tsb: &[u8], deliver: &mut dyn FnMut(&[u8])) -> DescrambleResult {
        self.instance_mut().descramble(tsb, deliver)
    }

    /**
        The service's CAID set changed; previous keys and verdicts are void.
    */
    fn caid_change(&mut self, _caids: &[CaidEntry]) {
        self.instance_mut().reset_keys();
    }

    fn key_state(&self) -> KeyState {
        self.instance().key_state()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub service_id: u16,
    pub key_state: KeyState,
}

/**
    Read-only status snapshot of a client.
*/
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: String,
    pub kind: ClientKind,
    pub enabled: bool,
    pub connected: bool,
    pub state: String,
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caid: Option<u16>,
    pub providers: usize,
    pub services: Vec<ServiceStatus>,
}

/**
    A configured source of control words.
*/
pub trait CasClient: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ClientKind;

    /**
        Called with the service stream lock held when a service starts or
        its CAIDs change. Returns a descrambler if this client can serve it.
    */
    fn start_service(
        self: Arc<Self>,
        service: &Arc<Service>,
        caids: &[CaidEntry],
        cipher: &CipherFactory,
    ) -> Option<Box<dyn Descrambler>>;

    fn status(&self) -> ClientStatus;

    /**
        Called once when the client joins a registry. Clients that only
        learn their CAID after connecting keep the directory to attach
        late.
    */
    fn bind(&self, _directory: ServiceDirectory) {}

    /**
        Called when the client leaves its registry, before its descramblers
        are swept. No attach may start after this returns.
    */
    fn unbind(&self) {}

    /**
        Configuration changed somewhere; cut any reconnect wait short.
    */
    fn wake(&self) {}

    /**
        Stop background tasks and wait for them to finish.
    */
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}
