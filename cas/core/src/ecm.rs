use std::collections::BTreeMap;
use std::time::Instant;

/**
    Request bookkeeping for one ECM section of one elementary stream.
*/
#[derive(Debug, Clone, Default)]
pub struct EcmSection {
    pub last_ecm: Vec<u8>,
    pub sequence: Option<u16>,
    pub pending: bool,
    pub nok: bool,
    pub sent_at: Option<Instant>,
    pub channel: Option<u16>,
}

/**
    Outcome of offering a freshly received ECM to the tracker.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcmOffer {
    /// Same bytes as the last ECM sent for this section.
    Duplicate,
    /// A request for this section is still outstanding.
    Busy,
    Fresh,
}

/**
    Per-PID ECM tracker, keyed by section number.
*/
#[derive(Debug, Clone)]
pub struct EcmTracker {
    pid: u16,
    last_section: u8,
    sections: BTreeMap<u8, EcmSection>,
}

impl EcmTracker {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            last_section: 0,
            sections: BTreeMap::new(),
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn last_section(&self) -> u8 {
        self.last_section
    }

    pub fn section(&self, number: u8) -> Option<&EcmSection> {
        self.sections.get(&number)
    }

    pub fn sections(&self) -> impl Iterator<Item = (u8, &EcmSection)> {
        self.sections.iter().map(|(n, s)| (*n, s))
    }

    /**
        Check whether `ecm` for `section` should be sent. Nothing is stored
        until `record_request`.
    */
    pub fn offer(&mut self, section: u8, last_section: u8, ecm: &[u8]) -> EcmOffer {
        self.last_section = last_section;
        match self.sections.get(&section) {
            Some(s) if s.pending => EcmOffer::Busy,
            Some(s) if s.last_ecm == ecm => EcmOffer::Duplicate,
            _ => EcmOffer::Fresh,
        }
    }

    pub fn record_request(
        &mut self,
        section: u8,
        ecm: &[u8],
        sequence: u16,
        channel: Option<u16>,
        now: Instant,
    ) {
        let entry = self.sections.entry(section).or_default();
        entry.last_ecm.clear();
        entry.last_ecm.extend_from_slice(ecm);
        entry.sequence = Some(sequence);
        entry.pending = true;
        entry.sent_at = Some(now);
        entry.channel = channel;
    }

    /**
        Find the pending section waiting for `sequence` and mark it answered.
    */
    pub fn complete(&mut self, sequence: u16, ok: bool) -> Option<(u8, &EcmSection)> {
        let (number, section) = self
            .sections
            .iter_mut()
            .find(|(_, s)| s.pending && s.sequence == Some(sequence))?;
        section.pending = false;
        section.nok = !ok;
        Some((*number, section))
    }

    /**
        Forget in-flight requests, keeping nothing that could dedup a resend.
    */
    pub fn clear(&mut self) {
        self.sections.clear();
        self.last_section = 0;
    }

    /**
        Every section from 0 to `last_section` was sent and refused.
    */
    fn is_rejected(&self) -> bool {
        (0..=self.last_section).all(|n| {
            self.sections
                .get(&n)
                .is_some_and(|s| s.nok && !s.pending)
        })
    }
}

/**
    All ECM trackers of one descrambler instance, one per ECM-carrying PID.
*/
#[derive(Debug, Clone, Default)]
pub struct EcmTrackerSet {
    trackers: Vec<EcmTracker>,
}

impl EcmTrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, pid: u16) -> &mut EcmTracker {
        let index = match self.trackers.iter().position(|t| t.pid == pid) {
            Some(index) => index,
            None => {
                self.trackers.push(EcmTracker::new(pid));
                self.trackers.len() - 1
            }
        };
        &mut self.trackers[index]
    }

    pub fn get(&self, pid: u16) -> Option<&EcmTracker> {
        self.trackers.iter().find(|t| t.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EcmTracker> {
        self.trackers.iter()
    }

    /**
        Route a reply to whichever tracker holds the pending `sequence`.
        Returns the PID and section number that were answered.
    */
    pub fn complete(&mut self, sequence: u16, ok: bool) -> Option<(u16, u8)> {
        self.trackers.iter_mut().find_map(|t| {
            let pid = t.pid;
            t.complete(sequence, ok).map(|(section, _)| (pid, section))
        })
    }

    pub fn has_pending(&self, sequence: u16) -> bool {
        self.trackers.iter().any(|t| {
            t.sections
                .values()
                .any(|s| s.pending && s.sequence == Some(sequence))
        })
    }

    /**
        True once every tracked section has been answered negatively.
    */
    pub fn all_rejected(&self) -> bool {
        let mut tracked = self.trackers.iter().filter(|t| !t.sections.is_empty());
        let mut any = false;
        let all = tracked.all(|t| {
            any = true;
            t.is_rejected()
        });
        any && all
    }

    pub fn clear(&mut self) {
        self.trackers.clear();
    }
}
