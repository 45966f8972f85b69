use cas_core::{ControlWord, Parity};

use crate::constants::{
    CA_DESCR_LEN, CA_PID_LEN, CA_SET_DESCR, CA_SET_PID, CLASSIC_RECORD_LEN, REQUEST_CODE_LEN,
};
use crate::error::{CapmtError, Result};

/**
    Classic-mode control word datagram.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicRecord {
    pub sequence: u16,
    pub even: ControlWord,
    pub odd: ControlWord,
}

impl ClassicRecord {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CLASSIC_RECORD_LEN {
            return Err(CapmtError::ShortRecord {
                expected: CLASSIC_RECORD_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            sequence: u16::from_le_bytes([buf[0], buf[1]]),
            even: word(&buf[2..10]),
            odd: word(&buf[10..18]),
        })
    }
}

/**
    OSCam-mode record: a request code followed by the ioctl argument, all
    integers in the CAM's (little-endian) byte order.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscamRecord {
    /// Map a descrambler slot to a PID. Index -1 clears the adapter.
    SetPid { pid: u32, index: i32 },
    SetDescr {
        index: i32,
        parity: u32,
        cw: ControlWord,
    },
}

impl OscamRecord {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let request = u32_at(buf, 0).ok_or(CapmtError::ShortRecord {
            expected: REQUEST_CODE_LEN,
            actual: buf.len(),
        })?;
        let arg = &buf[REQUEST_CODE_LEN..];
        let short = |expected: usize| CapmtError::ShortRecord {
            expected: REQUEST_CODE_LEN + expected,
            actual: buf.len(),
        };

        match request {
            CA_SET_PID => {
                if arg.len() < CA_PID_LEN {
                    return Err(short(CA_PID_LEN));
                }
                Ok(Self::SetPid {
                    pid: u32_at(arg, 0).unwrap_or_default(),
                    index: u32_at(arg, 4).unwrap_or_default() as i32,
                })
            }
            CA_SET_DESCR => {
                if arg.len() < CA_DESCR_LEN {
                    return Err(short(CA_DESCR_LEN));
                }
                Ok(Self::SetDescr {
                    index: u32_at(arg, 0).unwrap_or_default() as i32,
                    parity: u32_at(arg, 4).unwrap_or_default(),
                    cw: word(&arg[8..16]),
                })
            }
            other => Err(CapmtError::UnknownRequest(other)),
        }
    }
}

/**
    Map the wire parity value to a key slot.
*/
pub fn parity(value: u32) -> Result<Parity> {
    match value {
        0 => Ok(Parity::Even),
        1 => Ok(Parity::Odd),
        other => Err(CapmtError::InvalidParity(other)),
    }
}

fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn word(bytes: &[u8]) -> ControlWord {
    ControlWord::from_slice(bytes).unwrap_or(ControlWord::ZERO)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn classic() {
        let record =
            ClassicRecord::decode(&hex!("0201 0000000000000000 1122334455667788")).unwrap();
        assert_eq!(record.sequence, 0x0102);
        assert!(record.even.is_zero());
        assert_eq!(record.odd, ControlWord(hex!("1122334455667788")));
    }

    #[test]
    fn classic_short() {
        assert!(matches!(
            ClassicRecord::decode(&[0; 10]),
            Err(CapmtError::ShortRecord {
                expected: 18,
                actual: 10
            })
        ));
    }

    #[test]
    fn set_pid() {
        let record = OscamRecord::decode(&hex!("876f0840 00010000 03000000")).unwrap();
        assert_eq!(
            record,
            OscamRecord::SetPid {
                pid: 0x0100,
                index: 3
            }
        );

        let clear = OscamRecord::decode(&hex!("876f0840 00000000 ffffffff")).unwrap();
        assert_eq!(clear, OscamRecord::SetPid { pid: 0, index: -1 });
    }

    #[test]
    fn set_descr() {
        let record =
            OscamRecord::decode(&hex!("866f1040 03000000 01000000 0102030405060708")).unwrap();
        assert_eq!(
            record,
            OscamRecord::SetDescr {
                index: 3,
                parity: 1,
                cw: ControlWord(hex!("0102030405060708")),
            }
        );
        assert_eq!(parity(1).unwrap(), Parity::Odd);
        assert!(parity(2).is_err());
    }

    #[test]
    fn truncated_and_unknown() {
        assert!(matches!(
            OscamRecord::decode(&hex!("866f1040 03000000")),
            Err(CapmtError::ShortRecord { expected: 20, .. })
        ));
        assert!(matches!(
            OscamRecord::decode(&hex!("01020304")),
            Err(CapmtError::UnknownRequest(0x04030201))
        ));
        assert!(OscamRecord::decode(&[0x87]).is_err());
    }
}
