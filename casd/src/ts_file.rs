/*!
    Helpers for reading CA sections out of a recorded transport stream.
*/

use std::str::FromStr;

use cas_core::constants::MAX_CA_SECTION_LEN;
use cas_core::ts;

const SECTION_HEADER_LEN: usize = 3;
const STUFFING: u8 = 0xff;

/**
    Reassembles PSI sections carried on one PID.
*/
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buf: Vec<u8>,
    active: bool,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /**
        Feed one packet of the PID, returning every section it completes.
    */
    pub fn push(&mut self, tsb: &[u8]) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();
        if !ts::has_payload(tsb) {
            return sections;
        }
        let Some(offset) = ts::payload_offset(tsb) else {
            return sections;
        };
        let mut payload = &tsb[offset..];

        if ts::payload_unit_start(tsb) {
            let Some((&pointer, rest)) = payload.split_first() else {
                return sections;
            };
            let pointer = usize::from(pointer);
            if pointer > rest.len() {
                self.reset();
                return sections;
            }
            if self.active {
                self.buf.extend_from_slice(&rest[..pointer]);
                self.drain(&mut sections);
            }
            self.buf.clear();
            self.active = true;
            payload = &rest[pointer..];
        } else if !self.active {
            return sections;
        }

        self.buf.extend_from_slice(payload);
        self.drain(&mut sections);
        sections
    }

    fn drain(&mut self, sections: &mut Vec<Vec<u8>>) {
        while self.buf.len() >= SECTION_HEADER_LEN {
            if self.buf[0] == STUFFING {
                self.reset();
                return;
            }
            let total = SECTION_HEADER_LEN
                + ((usize::from(self.buf[1] & 0x0f) << 8) | usize::from(self.buf[2]));
            if total > MAX_CA_SECTION_LEN {
                self.reset();
                return;
            }
            if self.buf.len() < total {
                return;
            }
            sections.push(self.buf.drain(..total).collect());
        }
        if self.buf.is_empty() {
            self.active = false;
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.active = false;
    }
}

/**
    `pid:caid[:provider]`, each number decimal or `0x` hex.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcmArg {
    pub pid: u16,
    pub caid: u16,
    pub provider_id: u32,
}

fn parse_number<T: TryFrom<u64>>(text: &str) -> Result<T, String> {
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .map_err(|_| format!("invalid number '{text}'"))?;
    T::try_from(value).map_err(|_| format!("number '{text}' out of range"))
}

impl FromStr for EcmArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (pid, caid, provider) = match parts.as_slice() {
            [pid, caid] => (pid, caid, None),
            [pid, caid, provider] => (pid, caid, Some(provider)),
            _ => return Err(format!("expected pid:caid[:provider], got '{s}'")),
        };
        let pid: u16 = parse_number(pid)?;
        if pid > 0x1fff {
            return Err(format!("pid {pid} out of range"));
        }
        Ok(Self {
            pid,
            caid: parse_number(caid)?,
            provider_id: provider.map(|p| parse_number(p)).transpose()?.unwrap_or(0),
        })
    }
}
