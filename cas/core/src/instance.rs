use tracing::debug;

use crate::cipher::{BatchEntry, ControlWordCipher};
use crate::constants::TS_PACKET_SIZE;
use crate::ts;
use crate::types::{ControlWord, KeyState, Parity};

/**
    Result of handing one packet to a descrambler instance.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescrambleResult {
    /// The packet was taken into the cluster.
    Accepted,
    /// No usable key yet.
    NeedKey,
    /// Access was refused, drop without retrying.
    Forbidden,
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingKeys {
    even: Option<ControlWord>,
    odd: Option<ControlWord>,
}

/**
    Key state, control words and the packet cluster for one service on one
    CA client.

    Packets are collected into a cluster of `cluster_size` packets and
    decrypted in one call per parity. New control words are staged and only
    applied while the cluster is empty, so a cluster never mixes keys.
*/
pub struct DescramblerInstance {
    key_state: KeyState,
    even: ControlWord,
    odd: ControlWord,
    pending: Option<PendingKeys>,
    cipher: Box<dyn ControlWordCipher>,
    cluster_size: usize,
    cluster: Vec<u8>,
    fill: usize,
    even_batch: Vec<BatchEntry>,
    odd_batch: Vec<BatchEntry>,
    unkeyed_packets: u64,
}

impl DescramblerInstance {
    pub fn new(cipher: Box<dyn ControlWordCipher>) -> Self {
        let cluster_size = cipher.suggested_cluster_size().max(1);
        Self::with_cluster_size(cipher, cluster_size)
    }

    pub fn with_cluster_size(cipher: Box<dyn ControlWordCipher>, cluster_size: usize) -> Self {
        let cluster_size = cluster_size.max(1);
        Self {
            key_state: KeyState::Unknown,
            even: ControlWord::ZERO,
            odd: ControlWord::ZERO,
            pending: None,
            cipher,
            cluster_size,
            cluster: vec![0; cluster_size * TS_PACKET_SIZE],
            fill: 0,
            even_batch: Vec::with_capacity(cluster_size + 1),
            odd_batch: Vec::with_capacity(cluster_size + 1),
            unkeyed_packets: 0,
        }
    }

    pub fn key_state(&self) -> KeyState {
        self.key_state
    }

    pub fn set_key_state(&mut self, state: KeyState) {
        if state != self.key_state {
            debug!(from = %self.key_state, to = %state, "key state change");
        }
        self.key_state = state;
        if state == KeyState::Resolved {
            self.unkeyed_packets = 0;
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    /**
        Control words currently applied to the cipher.
    */
    pub fn control_words(&self) -> (ControlWord, ControlWord) {
        (self.even, self.odd)
    }

    pub fn has_pending_keys(&self) -> bool {
        self.pending.is_some()
    }

    /**
        Scrambled packets seen without a usable key since the last resolve.
    */
    pub fn unkeyed_packets(&self) -> u64 {
        self.unkeyed_packets
    }

    /**
        Stage new control words. All-zero words mean "no update for this
        parity" and never overwrite a previous word.
    */
    pub fn set_keys(&mut self, even: ControlWord, odd: ControlWord) {
        let even = even.non_zero();
        let odd = odd.non_zero();
        if even.is_none() && odd.is_none() {
            return;
        }
        let pending = self.pending.get_or_insert_with(PendingKeys::default);
        if even.is_some() {
            pending.even = even;
        }
        if odd.is_some() {
            pending.odd = odd;
        }
        if self.fill == 0 {
            self.apply_pending();
        }
    }

    /**
        Forget all key material, as on reconnect or CAID change.
    */
    pub fn reset_keys(&mut self) {
        self.key_state = KeyState::Unknown;
        self.even = ControlWord::ZERO;
        self.odd = ControlWord::ZERO;
        self.pending = None;
        self.unkeyed_packets = 0;
    }

    fn apply_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if let Some(cw) = pending.even {
            self.cipher.set_control_word(Parity::Even, &cw);
            self.even = cw;
        }
        if let Some(cw) = pending.odd {
            self.cipher.set_control_word(Parity::Odd, &cw);
            self.odd = cw;
        }
    }

    fn has_key(&self, parity: Parity) -> bool {
        match parity {
            Parity::Even => !self.even.is_zero(),
            Parity::Odd => !self.odd.is_zero(),
        }
    }

    /**
        Take one 188-byte packet. Completed clusters are handed to `deliver`
        one packet at a time in arrival order.
    */
    pub fn descramble(
        &mut self,
        tsb: &[u8],
        deliver: &mut dyn FnMut(&[u8]),
    ) -> DescrambleResult {
        match self.key_state {
            KeyState::Forbidden => return DescrambleResult::Forbidden,
            KeyState::Unknown => {
                self.unkeyed_packets += 1;
                return DescrambleResult::NeedKey;
            }
            KeyState::Resolved => {}
        }

        if self.fill == 0 {
            self.apply_pending();
        }

        let base = self.fill * TS_PACKET_SIZE;
        let slot = &mut self.cluster[base..base + TS_PACKET_SIZE];
        slot.copy_from_slice(&tsb[..TS_PACKET_SIZE]);

        let bits = ts::scrambling_control(slot);
        if bits & 0b10 != 0 {
            let parity = Parity::from_scrambling_control(bits);
            if let Some(offset) = ts::payload_offset(slot) {
                let len = TS_PACKET_SIZE - offset;
                if len >= 8 {
                    let entry = BatchEntry {
                        start: base + offset,
                        len,
                    };
                    match parity {
                        Parity::Even => self.even_batch.push(entry),
                        Parity::Odd => self.odd_batch.push(entry),
                    }
                }
            }
        }

        self.fill += 1;
        if self.fill == self.cluster_size {
            self.flush(deliver);
        }
        DescrambleResult::Accepted
    }

    /**
        Decrypt and deliver whatever is in the cluster, then start a new one.
    */
    pub fn flush(&mut self, deliver: &mut dyn FnMut(&[u8])) {
        if self.fill == 0 {
            return;
        }
        let used = self.fill * TS_PACKET_SIZE;

        for parity in [Parity::Even, Parity::Odd] {
            let batch = match parity {
                Parity::Even => &self.even_batch,
                Parity::Odd => &self.odd_batch,
            };
            if batch.is_empty() || !self.has_key(parity) {
                continue;
            }
            self.cipher.decrypt(parity, &mut self.cluster[..used], batch);
            for entry in batch {
                let start = entry.start - entry.start % TS_PACKET_SIZE;
                ts::clear_scrambling_control(&mut self.cluster[start..start + TS_PACKET_SIZE]);
            }
        }

        for packet in self.cluster[..used].chunks_exact(TS_PACKET_SIZE) {
            deliver(packet);
        }

        self.fill = 0;
        self.even_batch.clear();
        self.odd_batch.clear();
        self.apply_pending();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::ts::packet;

    /**
        Cipher that records every call and XORs payloads with the key byte.
    */
    #[derive(Default)]
    pub(crate) struct RecordingCipher {
        pub calls: Arc<Mutex<Vec<(Parity, usize, u8)>>>,
        keys: [u8; 2],
    }

    impl ControlWordCipher for RecordingCipher {
        fn suggested_cluster_size(&self) -> usize {
            4
        }

        fn set_control_word(&mut self, parity: Parity, cw: &ControlWord) {
            self.keys[parity.index()] = cw.0[0];
        }

        fn decrypt(&mut self, parity: Parity, cluster: &mut [u8], batch: &[BatchEntry]) {
            let key = self.keys[parity.index()];
            self.calls.lock().push((parity, batch.len(), key));
            for entry in batch {
                for b in &mut cluster[entry.start..entry.start + entry.len] {
                    *b ^= key;
                }
            }
        }
    }

    fn resolved(cipher: RecordingCipher, even: u8, odd: u8) -> DescramblerInstance {
        let mut instance = DescramblerInstance::new(Box::new(cipher));
        instance.set_keys(ControlWord([even; 8]), ControlWord([odd; 8]));
        instance.set_key_state(KeyState::Resolved);
        instance
    }

    #[test]
    fn unresolved_instance_needs_key() {
        let mut instance = DescramblerInstance::new(Box::new(RecordingCipher::default()));
        let result = instance.descramble(&packet(0x100, 0b10, 0), &mut |_| {});
        assert_eq!(result, DescrambleResult::NeedKey);
        assert_eq!(instance.unkeyed_packets(), 1);

        instance.set_key_state(KeyState::Forbidden);
        let result = instance.descramble(&packet(0x100, 0b10, 0), &mut |_| {});
        assert_eq!(result, DescrambleResult::Forbidden);
    }

    #[test]
    fn full_even_cluster_is_one_even_call() {
        let cipher = RecordingCipher::default();
        let calls = cipher.calls.clone();
        let mut instance = resolved(cipher, 0x0f, 0xf0);

        let mut out = Vec::new();
        for _ in 0..instance.cluster_size() {
            instance.descramble(&packet(0x100, 0b10, 0x33), &mut |p| out.push(p.to_vec()));
        }

        assert_eq!(*calls.lock(), vec![(Parity::Even, 4, 0x0f)]);
        assert_eq!(out.len(), 4);
        for p in &out {
            assert_eq!(ts::scrambling_control(p), 0);
            assert!(p[4..].iter().all(|b| *b == 0x33 ^ 0x0f));
        }
    }

    #[test]
    fn clear_packets_pass_unchanged() {
        let cipher = RecordingCipher::default();
        let calls = cipher.calls.clone();
        let mut instance = resolved(cipher, 0x0f, 0xf0);

        let clear = packet(0x100, 0b00, 0x55);
        let reserved = packet(0x100, 0b01, 0x66);
        let mut out = Vec::new();
        for tsb in [&clear, &reserved, &clear, &clear] {
            instance.descramble(tsb, &mut |p| out.push(p.to_vec()));
        }

        assert!(calls.lock().is_empty());
        assert_eq!(out[0], clear.to_vec());
        assert_eq!(out[1], reserved.to_vec());
    }

    #[test]
    fn mixed_parities_keep_order() {
        let cipher = RecordingCipher::default();
        let calls = cipher.calls.clone();
        let mut instance = resolved(cipher, 0x01, 0x02);

        let mut out = Vec::new();
        for (bits, fill) in [(0b10, 0x10), (0b11, 0x20), (0b00, 0x30), (0b11, 0x40)] {
            instance.descramble(&packet(0x100, bits, fill), &mut |p| out.push(p[10]));
        }

        assert_eq!(
            *calls.lock(),
            vec![(Parity::Even, 1, 0x01), (Parity::Odd, 2, 0x02)]
        );
        assert_eq!(out, vec![0x11, 0x22, 0x30, 0x42]);
    }

    #[test]
    fn empty_payload_after_adaptation_is_skipped() {
        let cipher = RecordingCipher::default();
        let calls = cipher.calls.clone();
        let mut instance = resolved(cipher, 0x01, 0x02);

        let mut tsb = packet(0x100, 0b10, 0);
        tsb[3] |= 0x20;
        tsb[4] = 180;
        for _ in 0..4 {
            instance.descramble(&tsb, &mut |_| {});
        }
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn key_update_waits_for_empty_cluster() {
        let cipher = RecordingCipher::default();
        let calls = cipher.calls.clone();
        let mut instance = resolved(cipher, 0x01, 0x02);

        let mut out = Vec::new();
        instance.descramble(&packet(0x100, 0b10, 0), &mut |p| out.push(p[4]));
        instance.descramble(&packet(0x100, 0b10, 0), &mut |p| out.push(p[4]));
        instance.set_keys(ControlWord([0x07; 8]), ControlWord::ZERO);
        assert!(instance.has_pending_keys());
        assert_eq!(instance.control_words().0, ControlWord([0x01; 8]));

        instance.descramble(&packet(0x100, 0b10, 0), &mut |p| out.push(p[4]));
        instance.descramble(&packet(0x100, 0b10, 0), &mut |p| out.push(p[4]));
        assert_eq!(out, vec![0x01; 4]);
        assert!(!instance.has_pending_keys());
        assert_eq!(instance.control_words(), (ControlWord([0x07; 8]), ControlWord([0x02; 8])));

        for _ in 0..4 {
            instance.descramble(&packet(0x100, 0b10, 0), &mut |p| out.push(p[4]));
        }
        assert_eq!(out[4..], [0x07; 4]);
        assert_eq!(calls.lock().last(), Some(&(Parity::Even, 4, 0x07)));
    }

    #[test]
    fn zero_half_does_not_overwrite() {
        let mut instance = resolved(RecordingCipher::default(), 0x01, 0x02);
        instance.set_keys(ControlWord::ZERO, ControlWord([0x09; 8]));
        assert_eq!(instance.control_words(), (ControlWord([0x01; 8]), ControlWord([0x09; 8])));
        instance.set_keys(ControlWord::ZERO, ControlWord::ZERO);
        assert!(!instance.has_pending_keys());
    }

    #[test]
    fn flush_delivers_partial_cluster() {
        let mut instance = resolved(RecordingCipher::default(), 0x01, 0x02);
        let mut out = 0;
        instance.descramble(&packet(0x100, 0b10, 0), &mut |_| out += 1);
        assert_eq!(out, 0);
        instance.flush(&mut |_| out += 1);
        assert_eq!(out, 1);
        assert_eq!(instance.fill(), 0);
    }
}
