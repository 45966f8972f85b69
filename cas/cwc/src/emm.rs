/*!
    Per-vendor EMM address matching.

    An EMM is only worth forwarding when it is addressed to our card (by
    unique address) or to one of its providers (by shared address).
    Viaccess splits shared EMMs in two parts that are reassembled here.
*/

use cas_core::crc::crc32;
use tracing::{debug, warn};

use crate::card::{CardInfo, CardSystem};
use crate::constants::EMM_CACHE_SIZE;

/**
    Ring of CRCs of recently forwarded EMMs.
*/
#[derive(Debug, Clone, Default)]
pub struct EmmCache {
    entries: Vec<u32>,
    next: usize,
}

impl EmmCache {
    pub fn contains(&self, crc: u32) -> bool {
        self.entries.contains(&crc)
    }

    pub fn insert(&mut self, crc: u32) {
        if self.entries.len() < EMM_CACHE_SIZE {
            self.entries.push(crc);
        } else {
            self.entries[self.next] = crc;
        }
        self.next = (self.next + 1) % EMM_CACHE_SIZE;
    }
}

#[derive(Debug, Clone)]
struct ViaccessShared {
    toggle: u8,
    emm: Vec<u8>,
}

/**
    Decides which EMMs go to the card server.
*/
#[derive(Debug, Clone)]
pub struct EmmFilter {
    card: CardInfo,
    cache: EmmCache,
    viaccess: Option<ViaccessShared>,
}

impl EmmFilter {
    pub fn new(card: CardInfo) -> Self {
        Self {
            card,
            cache: EmmCache::default(),
            viaccess: None,
        }
    }

    /**
        Returns the bytes to forward, or `None` if the EMM is not for us or
        was forwarded recently.
    */
    pub fn filter(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 4 {
            return None;
        }
        let emm = match self.card.system() {
            CardSystem::Conax => self.conax(data).then(|| data.to_vec()),
            CardSystem::Irdeto => self.irdeto(data).then(|| data.to_vec()),
            CardSystem::Seca => self.seca(data).then(|| data.to_vec()),
            CardSystem::Dre => self.dre(data).then(|| data.to_vec()),
            CardSystem::Nagra => self.nagra(data).then(|| data.to_vec()),
            CardSystem::Nds => self.nds(data).then(|| data.to_vec()),
            CardSystem::Viaccess => self.viaccess(data),
            CardSystem::Unknown => None,
        }?;

        let crc = crc32(&emm);
        if self.cache.contains(crc) {
            return None;
        }
        self.cache.insert(crc);
        debug!(table_id = emm[0], len = emm.len(), "forwarding EMM");
        Some(emm)
    }

    fn ua(&self) -> &[u8; 8] {
        &self.card.unique_address
    }

    fn conax(&self, data: &[u8]) -> bool {
        data[0] == 0x82
            && data.get(3..10).is_some_and(|addr| {
                self.card
                    .providers
                    .iter()
                    .any(|p| addr == &p.shared_address[1..8])
            })
    }

    fn irdeto(&self, data: &[u8]) -> bool {
        let mode = data[3] >> 3;
        let len = usize::from(data[3] & 0x07);
        let Some(addr) = data.get(4..4 + len) else {
            return false;
        };
        let matches =
            |base: u8, rest: &[u8]| mode == base && (len == 0 || rest.get(..len) == Some(addr));

        if mode & 0x10 != 0 {
            matches(self.ua()[4], &self.ua()[5..])
        } else {
            self.card
                .providers
                .iter()
                .any(|p| matches(p.shared_address[4], &p.shared_address[5..]))
        }
    }

    fn seca(&self, data: &[u8]) -> bool {
        match data[0] {
            0x82 => data.get(3..9) == Some(&self.ua()[2..8]),
            0x84 => data.get(5..8).is_some_and(|addr| {
                self.card
                    .providers
                    .iter()
                    .any(|p| addr == &p.shared_address[5..8])
            }),
            _ => false,
        }
    }

    fn dre(&self, data: &[u8]) -> bool {
        match data[0] {
            0x87 => data.get(3..7) == Some(&self.ua()[4..8]),
            0x86 => data.get(40..44).is_some_and(|addr| {
                self.card
                    .providers
                    .iter()
                    .any(|p| addr == &p.shared_address[4..8])
            }),
            _ => false,
        }
    }

    fn nagra(&self, data: &[u8]) -> bool {
        match data[0] {
            0x83 => {
                let Some(d) = data.get(..8) else {
                    return false;
                };
                let serial = [d[5], d[4], d[3], d[6]];
                let len = if d[7] == 0x10 { 3 } else { 4 };
                serial[..len] == self.ua()[4..4 + len]
            }
            0x82 => true,
            _ => false,
        }
    }

    fn nds(&self, data: &[u8]) -> bool {
        let serials = usize::from((data[3] >> 4) & 0x03) + 1;
        match (data[3] & 0xc0) >> 6 {
            0 => true,
            kind @ (1 | 2) => {
                let len = 5 - usize::from(kind);
                (0..serials).any(|i| {
                    let start = i * 4 + 4;
                    // compare only as far as the UA reaches
                    let want = &self.ua()[4..(4 + len).min(8)];
                    data.get(start..start + want.len()) == Some(want)
                })
            }
            _ => false,
        }
    }

    fn viaccess(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let sct_len = 3 + (usize::from(data[1] & 0x0f) << 8) + usize::from(data[2]);
        let data = data.get(..sct_len)?;

        match data[0] {
            0x8c | 0x8d => {
                let id = viaccess_provider_id(data)?;
                if !self.card.providers.iter().any(|p| p.provider_id == id) {
                    return None;
                }
                if self.viaccess.as_ref().is_none_or(|s| s.toggle != data[0]) {
                    self.viaccess = Some(ViaccessShared {
                        toggle: data[0],
                        emm: data.to_vec(),
                    });
                }
                None
            }
            0x8e => {
                let shared = self.viaccess.as_ref()?;
                let shared_id = viaccess_provider_id(&shared.emm);
                let header = data.get(..7)?;
                let matched = self.card.providers.iter().any(|p| {
                    header[3..6] == p.shared_address[4..7]
                        && header[6] & 0x02 == 0
                        && shared_id == Some(p.provider_id)
                });
                if !matched {
                    return None;
                }

                let unique = &data[7..];
                let mut nanos = Vec::with_capacity(unique.len() + shared.emm.len() + 4);
                if header[6] & 0x02 == 0 {
                    let addr_len = unique.len().checked_sub(8)?;
                    let Ok(nano_len) = u8::try_from(addr_len) else {
                        warn!(len = addr_len, "viaccess unique address nano too long, emm dropped");
                        return None;
                    };
                    nanos.push(0x9e);
                    nanos.push(nano_len);
                    nanos.extend_from_slice(&unique[..addr_len]);
                    nanos.push(0xf0);
                    nanos.push(0x08);
                    nanos.extend_from_slice(&unique[addr_len..]);
                } else {
                    nanos.extend_from_slice(unique);
                }
                nanos.extend_from_slice(&shared.emm[nano_start(&shared.emm)?..]);

                let sorted = sort_nanos(&nanos)?;
                let sct_len = sorted.len() + 4;
                let mut out = Vec::with_capacity(sorted.len() + 7);
                out.extend_from_slice(header);
                out[1] = ((sct_len >> 8) as u8) | 0x70;
                out[2] = sct_len as u8;
                out.extend_from_slice(&sorted);
                Some(out)
            }
            _ => None,
        }
    }
}

/**
    Offset of the first nano in a Viaccess section.
*/
fn nano_start(data: &[u8]) -> Option<usize> {
    match data.first()? {
        0x88 => Some(8),
        0x8e => Some(7),
        0x8c | 0x8d => Some(3),
        0x80 | 0x81 => Some(4),
        _ => None,
    }
}

/**
    Provider id from a leading nano 0x90, if present and non-zero.
*/
fn viaccess_provider_id(data: &[u8]) -> Option<u32> {
    let start = nano_start(data)?;
    let nano = data.get(start..start + 5)?;
    if nano[0] != 0x90 || nano[1] != 0x03 {
        return None;
    }
    let id = (u32::from(nano[2]) << 16) | (u32::from(nano[3]) << 8) | u32::from(nano[4] & 0xf0);
    (id != 0).then_some(id)
}

/**
    Stable sort of TLV nanos by tag. `None` if the list is malformed.
*/
fn sort_nanos(src: &[u8]) -> Option<Vec<u8>> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < src.len() {
        let len = usize::from(*src.get(pos + 1)?) + 2;
        if pos + len > src.len() {
            return None;
        }
        spans.push((src[pos], pos, len));
        pos += len;
    }
    spans.sort_by_key(|(tag, _, _)| *tag);
    Some(
        spans
            .into_iter()
            .flat_map(|(_, start, len)| src[start..start + len].iter().copied())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use cas_core::ProviderRecord;
    use hex_literal::hex;

    use super::*;

    fn card(caid: u16, ua: [u8; 8], providers: &[(u32, [u8; 8])]) -> CardInfo {
        CardInfo {
            caid,
            user: 1,
            unique_address: ua,
            providers: providers
                .iter()
                .map(|(id, sa)| ProviderRecord {
                    caid,
                    provider_id: *id,
                    shared_address: *sa,
                })
                .collect(),
        }
    }

    #[test]
    fn conax_shared_address() {
        let mut filter = EmmFilter::new(card(0x0b00, [1; 8], &[(0, hex!("00a1a2a3a4a5a6a7"))]));
        let emm = hex!("827000a1a2a3a4a5a6a7ff");
        assert_eq!(filter.filter(&emm), Some(emm.to_vec()));

        let other = hex!("827000a1a2a3a4a5a6a8ff");
        assert_eq!(filter.filter(&other), None);
    }

    #[test]
    fn repeated_emm_is_sent_once() {
        let mut filter = EmmFilter::new(card(0x1800, hex!("0000000011223344"), &[]));
        let global = hex!("82700401020304");
        assert!(filter.filter(&global).is_some());
        assert!(filter.filter(&global).is_none());
    }

    #[test]
    fn cache_evicts_oldest() {
        let mut cache = EmmCache::default();
        for crc in 0..(EMM_CACHE_SIZE as u32 + 1) {
            cache.insert(crc);
        }
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(EMM_CACHE_SIZE as u32));
    }

    #[test]
    fn irdeto_card_and_provider() {
        // card addressed: mode has bit 0x10 and equals ua[4]
        let mut by_card = EmmFilter::new(card(0x0604, hex!("0000000012aabbcc"), &[]));
        let unique = [0x82, 0x70, 0x04, (0x12 << 3) | 2, 0xaa, 0xbb, 0x01];
        assert!(by_card.filter(&unique).is_some());

        // provider addressed: mode equals sa[4], address follows sa[5..]
        let providers = [(0, hex!("0000000002343400"))];
        let mut by_provider = EmmFilter::new(card(0x0604, [1; 8], &providers));
        let shared = [0x82, 0x70, 0x04, (0x02 << 3) | 1, 0x34, 0x00, 0x02];
        assert!(by_provider.filter(&shared).is_some());

        let wrong = [0x82, 0x70, 0x04, (0x02 << 3) | 1, 0x35, 0x00, 0x03];
        assert!(by_provider.filter(&wrong).is_none());
    }

    #[test]
    fn seca_unique() {
        let ua = hex!("0000112233445566");
        let mut filter = EmmFilter::new(card(0x0100, ua, &[]));
        assert!(filter.filter(&hex!("827000112233445566aa")).is_some());
        assert!(filter.filter(&hex!("827000112233445567aa")).is_none());
    }

    #[test]
    fn nagra_unique_uses_swapped_serial() {
        let ua = hex!("00000000a1b2c3d4");
        let mut filter = EmmFilter::new(card(0x1801, ua, &[]));
        // serial bytes at 3..7 in the order [c3, b2, a1, d4]
        let emm = hex!("837000c3b2a1d400ff");
        assert!(filter.filter(&emm).is_some());
    }

    #[test]
    fn nds_types() {
        let ua = hex!("0000000001020304");
        let mut filter = EmmFilter::new(card(0x0963, ua, &[]));
        // type 1, one serial, 4 bytes compared
        assert!(filter.filter(&hex!("82700040010203040506")).is_some());
        // global
        assert!(filter.filter(&hex!("827000000000")).is_some());
        // type 1 mismatch
        assert!(filter.filter(&hex!("82700040010203050506")).is_none());
    }

    #[test]
    fn unknown_card_forwards_nothing() {
        let mut filter = EmmFilter::new(card(0x2600, [1; 8], &[]));
        assert!(filter.filter(&hex!("82700401020304")).is_none());
    }

    #[test]
    fn sorts_nanos_by_tag() {
        let sorted = sort_nanos(&hex!("9e01aa f001bb 9001cc 9e01dd")).unwrap();
        assert_eq!(sorted, hex!("9001cc 9e01aa 9e01dd f001bb"));
        assert!(sort_nanos(&hex!("9e05")).is_none());
    }

    #[test]
    fn viaccess_shared_and_unique_are_joined() {
        let providers = [(0x023800, hex!("00000000aabbcc00"))];
        let mut filter = EmmFilter::new(card(0x0500, [1; 8], &providers));

        // shared part: nano 0x90 with provider id, then a data nano
        let shared = hex!("8c7009 90 03 023801 a1 02 5555");
        assert_eq!(filter.filter(&shared), None);

        // unique part addressed to the provider's shared address
        let unique = hex!("8e700d aabbcc 00 01 0203040506070809");
        let assembled = filter.filter(&unique).unwrap();

        assert_eq!(assembled[0], 0x8e);
        assert_eq!(&assembled[3..7], &hex!("aabbcc00"));
        let nanos = &assembled[7..];
        assert_eq!(
            nanos,
            &hex!("9003023801 9e0101 a1025555 f0080203040506070809")[..]
        );
        let sct_len = nanos.len() + 4;
        assert_eq!(assembled[1], 0x70 | (sct_len >> 8) as u8);
        assert_eq!(assembled[2], sct_len as u8);

        assert_eq!(filter.filter(&unique), None);
    }

    #[test]
    fn viaccess_oversized_address_is_dropped() {
        let providers = [(0x023800, hex!("00000000aabbcc00"))];
        let mut filter = EmmFilter::new(card(0x0500, [1; 8], &providers));
        assert_eq!(filter.filter(&hex!("8c7009 90 03 023801 a1 02 5555")), None);

        // 256 address bytes plus the 8 byte key block
        let unique_len = 256 + 8;
        let sct_len = 4 + unique_len;
        let mut unique = vec![0x8e, 0x70 | (sct_len >> 8) as u8, sct_len as u8];
        unique.extend_from_slice(&hex!("aabbcc 00"));
        unique.extend((0..unique_len).map(|i| i as u8));
        assert_eq!(filter.filter(&unique), None);

        // a well-formed unique part still goes through afterwards
        let unique = hex!("8e700d aabbcc 00 01 0203040506070809");
        assert!(filter.filter(&unique).is_some());
    }

    #[test]
    fn viaccess_unique_without_shared_is_dropped() {
        let providers = [(0x023800, hex!("00000000aabbcc00"))];
        let mut filter = EmmFilter::new(card(0x0500, [1; 8], &providers));
        assert_eq!(filter.filter(&hex!("8e700d aabbcc 00 01 0203040506070809")), None);
    }
}
