use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::SectionContext;
use crate::constants::{MAX_CA_SECTION_LEN, UNKEYED_PACKET_LIMIT};
use crate::instance::DescrambleResult;
use crate::registry::Registry;
use crate::service::{PacketSink, Service, ServiceInfo, ServiceStreams};
use crate::ts;
use crate::types::{CaidEntry, FeedStatus};

/**
    What the demux should do with a packet after handing it over.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    /// Taken; the clear packet reaches the service sink.
    Pass,
    /// No descrambler has a key yet.
    NeedKey,
    /// Every descrambler refused access.
    DropNow,
}

/**
    Entry point for the demux: packets, table sections and PMT updates.
*/
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn service_started(
        &self,
        info: ServiceInfo,
        caids: Vec<CaidEntry>,
        sink: Box<dyn PacketSink>,
    ) -> Arc<Service> {
        self.registry.service_started(info, caids, sink)
    }

    pub fn service_stopped(&self, service: &Arc<Service>) {
        self.registry.service_stopped(service)
    }

    pub fn caid_list(&self, service: &Arc<Service>, caids: Vec<CaidEntry>) {
        self.registry.caids_changed(service, caids)
    }

    /**
        Route one 188-byte packet. Clear packets go straight to the sink,
        scrambled ones to the first descrambler that accepts them.
    */
    pub fn on_packet(&self, service: &Service, tsb: &[u8]) -> PacketVerdict {
        if let Err(e) = ts::check_packet(tsb) {
            warn!(service = %service.info().name, error = %e, "dropping malformed packet");
            return PacketVerdict::DropNow;
        }

        let mut streams = service.streams();
        let ServiceStreams {
            descramblers,
            status,
            sink,
            ..
        } = &mut *streams;

        if !ts::is_scrambled(tsb) {
            sink.deliver(tsb);
            return PacketVerdict::Pass;
        }

        if descramblers.is_empty() {
            set_status(service, status, FeedStatus::NoDescrambler);
            return PacketVerdict::NeedKey;
        }

        let mut refused = 0;
        let mut forbidden = 0;
        for descrambler in descramblers.iter_mut() {
            match descrambler.descramble(tsb, &mut |p| sink.deliver(p)) {
                DescrambleResult::Accepted => {
                    set_status(service, status, FeedStatus::Resolved);
                    return PacketVerdict::Pass;
                }
                DescrambleResult::Forbidden => {
                    refused += 1;
                    forbidden += 1;
                }
                DescrambleResult::NeedKey => {
                    if descrambler.instance().unkeyed_packets() > UNKEYED_PACKET_LIMIT {
                        refused += 1;
                    }
                }
            }
        }

        if refused == descramblers.len() {
            set_status(service, status, FeedStatus::NoAccess);
            if forbidden == descramblers.len() {
                return PacketVerdict::DropNow;
            }
        }
        PacketVerdict::NeedKey
    }

    /**
        Hand an ECM or EMM section to every descrambler of the service,
        whatever its key state.
    */
    pub fn on_table_section(&self, service: &Service, pid: u16, data: &[u8]) {
        if data.is_empty() || data.len() > MAX_CA_SECTION_LEN {
            debug!(service = %service.info().name, pid, len = data.len(), "ignoring CA section");
            return;
        }
        let mut streams = service.streams();
        let ServiceStreams {
            caids,
            descramblers,
            ..
        } = &mut *streams;
        let ctx = SectionContext {
            service: service.info(),
            pid,
            caids,
        };
        for descrambler in descramblers.iter_mut() {
            descrambler.handle_section(&ctx, data);
        }
    }
}

fn set_status(service: &Service, current: &mut FeedStatus, next: FeedStatus) {
    if *current != next {
        debug!(service = %service.info().name, status = ?next, "feed status");
        *current = next;
    }
}
