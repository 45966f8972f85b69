use std::fmt;

use cas_core::ProviderRecord;

use crate::error::{CwcError, Result};

/**
    CA vendor of the card behind a server, from the CAID high byte.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSystem {
    Unknown,
    Irdeto,
    Viaccess,
    Conax,
    Seca,
    Dre,
    Nagra,
    Nds,
}

impl CardSystem {
    pub fn from_caid(caid: u16) -> Self {
        match caid >> 8 {
            0x17 | 0x06 => Self::Irdeto,
            0x05 => Self::Viaccess,
            0x0b => Self::Conax,
            0x01 => Self::Seca,
            0x4a => Self::Dre,
            0x18 => Self::Nagra,
            0x09 => Self::Nds,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for CardSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Irdeto => "irdeto",
            Self::Viaccess => "viaccess",
            Self::Conax => "conax",
            Self::Seca => "seca",
            Self::Dre => "dre",
            Self::Nagra => "nagra",
            Self::Nds => "nds",
        };
        f.write_str(name)
    }
}

/**
    Card metadata from the server's card-data reply.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub caid: u16,
    pub user: u8,
    pub unique_address: [u8; 8],
    pub providers: Vec<ProviderRecord>,
}

impl CardInfo {
    /**
        Decode a card-data reply. `msg` starts at the message type byte.

        Layout: `[type, len_hi & 0x0f, len_lo, user, caid(2), ua(8),
        n_providers, n * (id(3), sa(8))]`.
    */
    pub fn decode(msg: &[u8]) -> Result<Self> {
        if msg.len() < 3 {
            return Err(CwcError::CardData("reply too short"));
        }
        let declared = (usize::from(msg[1] & 0x0f) << 8) | usize::from(msg[2]);
        if declared < 14 || msg.len() < 15 {
            return Err(CwcError::CardData("truncated header"));
        }
        let count = usize::from(msg[14]);
        if declared < count * 11 || msg.len() < 15 + count * 11 {
            return Err(CwcError::CardData("truncated provider list"));
        }

        let caid = u16::from_be_bytes([msg[4], msg[5]]);
        let mut unique_address = [0u8; 8];
        unique_address.copy_from_slice(&msg[6..14]);

        let providers = msg[15..15 + count * 11]
            .chunks_exact(11)
            .map(|p| {
                let mut shared_address = [0u8; 8];
                shared_address.copy_from_slice(&p[3..11]);
                ProviderRecord {
                    caid,
                    provider_id: u32::from_be_bytes([0, p[0], p[1], p[2]]),
                    shared_address,
                }
            })
            .collect();

        Ok(Self {
            caid,
            user: msg[3],
            unique_address,
            providers,
        })
    }

    pub fn system(&self) -> CardSystem {
        CardSystem::from_caid(self.caid)
    }

    /**
        Provider 0 is a wildcard; anything else must be on the card.
    */
    pub fn has_provider(&self, provider_id: u32) -> bool {
        provider_id == 0 || self.providers.iter().any(|p| p.provider_id == provider_id)
    }

    /**
        The server hides the UA (all zeroes) when it will not take EMMs.
    */
    pub fn accepts_emm(&self) -> bool {
        self.unique_address.iter().any(|b| *b != 0) && self.system() != CardSystem::Unknown
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use hex_literal::hex;

    use super::*;

    pub(crate) fn card_reply(caid: u16, ua: [u8; 8], providers: &[(u32, [u8; 8])]) -> Vec<u8> {
        let body_len = 12 + providers.len() * 11;
        let mut msg = vec![0xe4, (body_len >> 8) as u8, body_len as u8, 0x01];
        msg.extend_from_slice(&caid.to_be_bytes());
        msg.extend_from_slice(&ua);
        msg.push(providers.len() as u8);
        for (id, sa) in providers {
            msg.extend_from_slice(&id.to_be_bytes()[1..]);
            msg.extend_from_slice(sa);
        }
        msg
    }

    #[test]
    fn decodes_card_with_providers() {
        let ua = hex!("0000000012345678");
        let reply = card_reply(
            0x0500,
            ua,
            &[(0x023800, hex!("0000000011223300")), (0x007c00, [0; 8])],
        );
        let card = CardInfo::decode(&reply).unwrap();
        assert_eq!(card.caid, 0x0500);
        assert_eq!(card.user, 0x01);
        assert_eq!(card.unique_address, ua);
        assert_eq!(card.providers.len(), 2);
        assert_eq!(card.providers[0].provider_id, 0x023800);
        assert_eq!(card.providers[0].shared_address, hex!("0000000011223300"));
        assert_eq!(card.system(), CardSystem::Viaccess);
        assert!(card.has_provider(0x007c00));
        assert!(card.has_provider(0));
        assert!(!card.has_provider(0x123456));
        assert!(card.accepts_emm());
    }

    #[test]
    fn rejects_truncated_replies() {
        assert!(CardInfo::decode(&[0xe4, 0]).is_err());
        let mut reply = card_reply(0x0500, [1; 8], &[(1, [0; 8])]);
        reply.truncate(reply.len() - 1);
        assert!(CardInfo::decode(&reply).is_err());
    }

    #[test]
    fn hidden_ua_disables_emm() {
        let card = CardInfo::decode(&card_reply(0x0b00, [0; 8], &[(0, [0; 8])])).unwrap();
        assert_eq!(card.system(), CardSystem::Conax);
        assert!(!card.accepts_emm());
        let card = CardInfo::decode(&card_reply(0x2600, [1; 8], &[(0, [0; 8])])).unwrap();
        assert!(!card.accepts_emm());
    }

    #[test]
    fn card_systems() {
        assert_eq!(CardSystem::from_caid(0x1702), CardSystem::Irdeto);
        assert_eq!(CardSystem::from_caid(0x0604), CardSystem::Irdeto);
        assert_eq!(CardSystem::from_caid(0x0100), CardSystem::Seca);
        assert_eq!(CardSystem::from_caid(0x4ae1), CardSystem::Dre);
        assert_eq!(CardSystem::from_caid(0x1801), CardSystem::Nagra);
        assert_eq!(CardSystem::from_caid(0x0963), CardSystem::Nds);
    }
}
