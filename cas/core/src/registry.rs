use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backoff::Activity;
use crate::cipher::{CipherFactory, des_ncb_factory};
use crate::client::{CasClient, ClientStatus};
use crate::error::{CasError, Result};
use crate::service::{PacketSink, Service, ServiceInfo, ServiceStreams};
use crate::types::CaidEntry;

/**
    Running services plus the cipher used for new descramblers. Shared with
    clients so they can attach once they learn what they can serve.
*/
#[derive(Clone)]
pub struct ServiceDirectory {
    services: Arc<Mutex<Vec<Weak<Service>>>>,
    cipher: CipherFactory,
}

impl ServiceDirectory {
    fn new(cipher: CipherFactory) -> Self {
        Self {
            services: Arc::new(Mutex::new(Vec::new())),
            cipher,
        }
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn insert(&self, service: &Arc<Service>) {
        self.services.lock().push(Arc::downgrade(service));
    }

    fn remove(&self, service: &Arc<Service>) {
        self.services
            .lock()
            .retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr(), Arc::as_ptr(service)));
    }

    /**
        Drop `client`'s descramblers everywhere and offer it every running
        service again. Must not be called with a client lock held.
    */
    pub fn reattach(&self, client: &Arc<dyn CasClient>) {
        for service in self.services() {
            let mut streams = service.streams();
            let ServiceStreams {
                descramblers, sink, ..
            } = &mut *streams;
            descramblers.retain_mut(|d| {
                if d.client_id() != client.id() {
                    return true;
                }
                d.stop(&mut |tsb| sink.deliver(tsb));
                false
            });
            let caids = streams.caids.clone();
            self.attach(client, &service, &mut streams, &caids);
        }
    }

    fn attach(
        &self,
        client: &Arc<dyn CasClient>,
        service: &Arc<Service>,
        streams: &mut ServiceStreams,
        caids: &[CaidEntry],
    ) {
        if streams
            .descramblers
            .iter()
            .any(|d| d.client_id() == client.id())
        {
            return;
        }
        if let Some(descrambler) = Arc::clone(client).start_service(service, caids, &self.cipher) {
            debug!(client = %client.id(), service = %service.info().name, "descrambler attached");
            streams.descramblers.push(descrambler);
        }
    }
}

/**
    All configured CA clients and all running services.

    Lock order is service stream lock first, then the client list lock.
    Nothing here takes a stream lock while holding `clients`. A client's
    own directory lock sits above both: it is taken before any stream lock
    and never while one is held.
*/
pub struct Registry {
    clients: RwLock<Vec<Arc<dyn CasClient>>>,
    directory: ServiceDirectory,
    activity: Arc<Activity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_cipher(des_ncb_factory())
    }

    pub fn with_cipher(cipher: CipherFactory) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            directory: ServiceDirectory::new(cipher),
            activity: Arc::new(Activity::new()),
        }
    }

    pub fn activity(&self) -> Arc<Activity> {
        Arc::clone(&self.activity)
    }

    // ── Clients ─────────────────────────────────────────────────────────

    /**
        Register a client and attach it to every running service it can serve.
    */
    pub fn add_client(&self, client: Arc<dyn CasClient>) -> Result<()> {
        {
            let mut clients = self.clients.write();
            if clients.iter().any(|c| c.id() == client.id()) {
                return Err(CasError::DuplicateClient(client.id().to_string()));
            }
            clients.push(Arc::clone(&client));
        }
        info!(client = %client.id(), kind = %client.kind(), "client added");
        client.bind(self.directory.clone());

        for service in self.services() {
            let mut streams = service.streams();
            let caids = streams.caids.clone();
            self.directory.attach(&client, &service, &mut streams, &caids);
        }
        Ok(())
    }

    pub fn client(&self, id: &str) -> Option<Arc<dyn CasClient>> {
        self.clients.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<dyn CasClient>> {
        self.clients.read().clone()
    }

    pub fn statuses(&self) -> Vec<ClientStatus> {
        self.clients().iter().map(|c| c.status()).collect()
    }

    /**
        Remove a client. Its descramblers are stopped under each service's
        lock before its tasks are joined.
    */
    pub async fn remove_client(&self, id: &str) -> Result<()> {
        let client = {
            let mut clients = self.clients.write();
            let index = clients
                .iter()
                .position(|c| c.id() == id)
                .ok_or_else(|| CasError::UnknownClient(id.to_string()))?;
            clients.remove(index)
        };
        client.unbind();

        for service in self.services() {
            let mut streams = service.streams();
            let ServiceStreams {
                descramblers, sink, ..
            } = &mut *streams;
            let mut kept = Vec::with_capacity(descramblers.len());
            for mut descrambler in descramblers.drain(..) {
                if descrambler.client_id() == id {
                    descrambler.stop(&mut |tsb| sink.deliver(tsb));
                    debug!(client = %id, service = %service.info().name, "descrambler force-stopped");
                } else {
                    kept.push(descrambler);
                }
            }
            *descramblers = kept;
        }

        client.shutdown().await;
        info!(client = %id, "client removed");
        Ok(())
    }

    /**
        Swap a client for a reconfigured one with the same id.
    */
    pub async fn replace_client(&self, client: Arc<dyn CasClient>) -> Result<()> {
        if self.client(client.id()).is_some() {
            self.remove_client(client.id()).await?;
        }
        self.add_client(client)
    }

    /**
        Tell every client that configuration changed.
    */
    pub fn config_changed(&self) {
        for client in self.clients() {
            client.wake();
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.clients().iter().map(|c| c.id().to_string()).collect();
        for id in ids {
            if let Err(e) = self.remove_client(&id).await {
                warn!(client = %id, error = %e, "client removal failed during shutdown");
            }
        }
    }

    // ── Services ────────────────────────────────────────────────────────

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.directory.services()
    }

    /**
        A service started: create descramblers for every client that
        matches one of its CAIDs.
    */
    pub fn service_started(
        &self,
        info: ServiceInfo,
        caids: Vec<CaidEntry>,
        sink: Box<dyn PacketSink>,
    ) -> Arc<Service> {
        let service = Arc::new(Service::new(info, caids, sink));
        {
            let mut streams = service.streams();
            let caids = streams.caids.clone();
            for client in self.clients() {
                self.directory.attach(&client, &service, &mut streams, &caids);
            }
        }
        self.directory.insert(&service);
        self.activity.subscribe();
        info!(
            service = %service.info().name,
            sid = service.info().service_id,
            descramblers = service.streams().descramblers.len(),
            "service started"
        );
        service
    }

    /**
        A service stopped: stop and drop all of its descramblers.
    */
    pub fn service_stopped(&self, service: &Arc<Service>) {
        {
            let mut streams = service.streams();
            let ServiceStreams {
                descramblers, sink, ..
            } = &mut *streams;
            for mut descrambler in descramblers.drain(..) {
                descrambler.stop(&mut |tsb| sink.deliver(tsb));
            }
        }
        self.directory.remove(service);
        self.activity.unsubscribe();
        info!(service = %service.info().name, "service stopped");
    }

    /**
        New CAID list from the PMT. Existing descramblers drop their keys,
        clients not yet attached get a chance to attach.
    */
    pub fn caids_changed(&self, service: &Arc<Service>, caids: Vec<CaidEntry>) {
        let mut streams = service.streams();
        if streams.caids == caids {
            return;
        }
        streams.caids = caids.clone();
        for descrambler in streams.descramblers.iter_mut() {
            descrambler.caid_change(&caids);
        }
        for client in self.clients() {
            self.directory.attach(&client, service, &mut streams, &caids);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
