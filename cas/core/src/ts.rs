/*!
    Minimal transport-stream header accessors used on the descrambling path.
*/

use crate::constants::{TS_HEADER_SIZE, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::error::{CasError, Result};

pub fn check_packet(tsb: &[u8]) -> Result<()> {
    if tsb.len() != TS_PACKET_SIZE {
        return Err(CasError::PacketSize(tsb.len()));
    }
    if tsb[0] != TS_SYNC_BYTE {
        return Err(CasError::SyncByte(tsb[0]));
    }
    Ok(())
}

pub fn pid(tsb: &[u8]) -> u16 {
    (u16::from(tsb[1] & 0x1f) << 8) | u16::from(tsb[2])
}

pub fn payload_unit_start(tsb: &[u8]) -> bool {
    tsb[1] & 0x40 != 0
}

/**
    The two scrambling-control bits (`tsb[3] >> 6`).
*/
pub fn scrambling_control(tsb: &[u8]) -> u8 {
    (tsb[3] >> 6) & 0x03
}

pub fn is_scrambled(tsb: &[u8]) -> bool {
    tsb[3] & 0xc0 != 0
}

pub fn clear_scrambling_control(tsb: &mut [u8]) {
    tsb[3] &= 0x3f;
}

pub fn has_adaptation_field(tsb: &[u8]) -> bool {
    tsb[3] & 0x20 != 0
}

pub fn has_payload(tsb: &[u8]) -> bool {
    tsb[3] & 0x10 != 0
}

/**
    Offset of the payload inside the packet, or `None` if the adaptation
    field leaves no room for a payload.
*/
pub fn payload_offset(tsb: &[u8]) -> Option<usize> {
    let offset = if has_adaptation_field(tsb) {
        TS_HEADER_SIZE + 1 + usize::from(tsb[4])
    } else {
        TS_HEADER_SIZE
    };
    (offset < TS_PACKET_SIZE).then_some(offset)
}

#[cfg(test)]
pub(crate) fn packet(pid: u16, scrambling: u8, payload: u8) -> [u8; TS_PACKET_SIZE] {
    let mut tsb = [payload; TS_PACKET_SIZE];
    tsb[0] = TS_SYNC_BYTE;
    tsb[1] = ((pid >> 8) as u8) & 0x1f;
    tsb[2] = pid as u8;
    tsb[3] = (scrambling << 6) | 0x10;
    tsb
}
