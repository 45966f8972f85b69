use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::client::{Descrambler, ServiceStatus};
use crate::types::{CaidEntry, FeedStatus};

static NEXT_SERVICE_KEY: AtomicU64 = AtomicU64::new(1);

/**
    Identity of a running service as handed to us by the scheduler.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub service_id: u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub adapter: u8,
    pub pmt_pid: u16,
}

/**
    Receives clear packets once they leave the descrambling path.
*/
pub trait PacketSink: Send {
    fn deliver(&mut self, tsb: &[u8]);
}

impl<F> PacketSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn deliver(&mut self, tsb: &[u8]) {
        self(tsb)
    }
}

/**
    Everything guarded by the service stream lock.
*/
pub struct ServiceStreams {
    pub caids: Vec<CaidEntry>,
    pub descramblers: Vec<Box<dyn Descrambler>>,
    pub status: FeedStatus,
    pub sink: Box<dyn PacketSink>,
}

impl ServiceStreams {
    /**
        CAIDs announced on one elementary stream.
    */
    pub fn caids_for_pid(&self, pid: u16) -> impl Iterator<Item = &CaidEntry> {
        self.caids.iter().filter(move |c| c.pid == pid)
    }

    pub fn has_caid(&self, caid: u16) -> bool {
        self.caids.iter().any(|c| c.caid == caid)
    }

    /**
        Find the descrambler of concrete type `T` matching `pred`.
    */
    pub fn find_instance<T: Descrambler + 'static>(
        &mut self,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<&mut T> {
        self.descramblers
            .iter_mut()
            .filter_map(|d| d.as_any_mut().downcast_mut::<T>())
            .find(|d| pred(d))
    }
}

/**
    A running service with its CA streams and attached descramblers.
*/
pub struct Service {
    key: u64,
    info: ServiceInfo,
    streams: Mutex<ServiceStreams>,
}

impl Service {
    pub fn new(info: ServiceInfo, caids: Vec<CaidEntry>, sink: Box<dyn PacketSink>) -> Self {
        Self {
            key: NEXT_SERVICE_KEY.fetch_add(1, Ordering::Relaxed),
            info,
            streams: Mutex::new(ServiceStreams {
                caids,
                descramblers: Vec::new(),
                status: FeedStatus::Unknown,
                sink,
            }),
        }
    }

    /**
        Process-unique key, stable for the lifetime of the service.
    */
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn streams(&self) -> MutexGuard<'_, ServiceStreams> {
        self.streams.lock()
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.streams.lock().status
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.key)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/**
    Services a client currently has descramblers on.

    The inner lock is a client lock: never hold it while taking a
    service stream lock.
*/
#[derive(Default)]
pub struct AttachedServices {
    services: Mutex<Vec<Weak<Service>>>,
}

impl AttachedServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, service: &Arc<Service>) {
        let mut services = self.services.lock();
        services.retain(|s| s.strong_count() > 0);
        if !services.iter().any(|s| s.as_ptr() == Arc::as_ptr(service)) {
            services.push(Arc::downgrade(service));
        }
    }

    pub fn detach(&self, key: u64) {
        self.services
            .lock()
            .retain(|s| s.upgrade().is_some_and(|s| s.key() != key));
    }

    pub fn snapshot(&self) -> Vec<Arc<Service>> {
        self.services.lock().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
        Key state of this client's descrambler on each attached service.
    */
    pub fn statuses(&self, client_id: &str) -> Vec<ServiceStatus> {
        self.snapshot()
            .iter()
            .filter_map(|service| {
                let streams = service.streams();
                let descrambler = streams
                    .descramblers
                    .iter()
                    .find(|d| d.client_id() == client_id)?;
                Some(ServiceStatus {
                    name: service.info().name.clone(),
                    service_id: service.info().service_id,
                    key_state: descrambler.key_state(),
                })
            })
            .collect()
    }
}
