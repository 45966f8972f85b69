use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::CONTROL_WORD_LEN;

/**
    Conditional-access system id announced for one elementary stream.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaidEntry {
    pub caid: u16,
    pub pid: u16,
    pub provider_id: u32,
}

impl CaidEntry {
    pub const fn new(caid: u16, pid: u16, provider_id: u32) -> Self {
        Self {
            caid,
            pid,
            provider_id,
        }
    }
}

/**
    A provider entitlement reported by a card server.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderRecord {
    pub caid: u16,
    pub provider_id: u32,
    #[serde(with = "hex::serde")]
    pub shared_address: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    /**
        Parity from the TS scrambling-control bits (`10` even, `11` odd).
    */
    pub const fn from_scrambling_control(bits: u8) -> Self {
        if bits & 0x01 == 0 { Self::Even } else { Self::Odd }
    }

    pub const fn index(self) -> usize {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Even => write!(f, "even"),
            Self::Odd => write!(f, "odd"),
        }
    }
}

/**
    An 8-byte control word. All zeroes means "not set".
*/
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ControlWord(pub [u8; CONTROL_WORD_LEN]);

impl ControlWord {
    pub const ZERO: Self = Self([0; CONTROL_WORD_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; CONTROL_WORD_LEN] = bytes.get(..CONTROL_WORD_LEN)?.try_into().ok()?;
        Some(Self(array))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /**
        `Some(self)` unless the word is all zeroes.
    */
    pub fn non_zero(self) -> Option<Self> {
        if self.is_zero() { None } else { Some(self) }
    }

    pub fn as_bytes(&self) -> &[u8; CONTROL_WORD_LEN] {
        &self.0
    }
}

impl fmt::Debug for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlWord({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    #[default]
    Unknown,
    Resolved,
    Forbidden,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Resolved => write!(f, "resolved"),
            Self::Forbidden => write!(f, "forbidden"),
        }
    }
}

/**
    Descrambling status of a whole service, aggregated over its instances.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    #[default]
    Unknown,
    NoDescrambler,
    NoAccess,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Cwc,
    Capmt,
    Ccw,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cwc => write!(f, "cwc"),
            Self::Capmt => write!(f, "capmt"),
            Self::Ccw => write!(f, "ccw"),
        }
    }
}
