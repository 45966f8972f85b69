use cas_core::CaidEntry;
use tracing::warn;

use crate::config::CapmtMode;
use crate::constants::{
    CA_DESCRIPTOR_DATA_LEN, CAPMT_HEADER_SIZE, CAPMT_INDICATOR, DESC_CA, DESC_DEMUX, DESC_PID,
    DESC_PRIVATE, PMT_VERSION_MAX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListManagement {
    More = 0x00,
    First = 0x01,
    Last = 0x02,
    Only = 0x03,
    Add = 0x04,
    Update = 0x05,
}

impl ListManagement {
    /**
        Position of entry `index` in a list of `count` objects.
    */
    pub fn for_position(index: usize, count: usize) -> Self {
        match (index == 0, index + 1 == count) {
            (true, true) => Self::Only,
            (true, false) => Self::First,
            (false, true) => Self::Last,
            (false, false) => Self::More,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    OkDescrambling = 0x01,
    OkMmi = 0x02,
    Query = 0x03,
    NotSelected = 0x04,
}

/**
    PMT version counter stamped into every CA_PMT, cycling 1..=31.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCounter(u8);

impl Default for VersionCounter {
    fn default() -> Self {
        Self(1)
    }
}

impl VersionCounter {
    pub fn next(&mut self) -> u8 {
        let version = self.0;
        self.0 = if version >= PMT_VERSION_MAX { 1 } else { version + 1 };
        version
    }
}

/**
    A CA_PMT object for one service.
*/
#[derive(Debug, Clone)]
pub struct CaPmt<'a> {
    pub list: ListManagement,
    pub command: Command,
    pub mode: CapmtMode,
    pub service_id: u16,
    pub transport_stream_id: u16,
    pub adapter: u8,
    pub sequence: u16,
    pub version: u8,
    pub caids: &'a [CaidEntry],
}

impl CaPmt<'_> {
    /**
        Encode header, descriptors and trailer. The ECM PID descriptor
        carries the PID of the first CA stream.
    */
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = header(self.list, self.service_id, self.version, self.command);

        let sid = self.service_id.to_be_bytes();
        let tsid = self.transport_stream_id.to_be_bytes();
        push_descriptor(
            &mut buf,
            DESC_PRIVATE,
            &[0, 0, 0, 0, sid[0], sid[1], tsid[0], tsid[1]],
        );

        let demux = match self.mode {
            CapmtMode::Oscam => [0, self.adapter],
            CapmtMode::Classic => [1u8.checked_shl(u32::from(self.adapter)).unwrap_or(0), self.adapter],
        };
        push_descriptor(&mut buf, DESC_DEMUX, &demux);

        let ecm_pid = self.caids.first().map_or(0, |c| c.pid);
        push_descriptor(&mut buf, DESC_PID, &ecm_pid.to_be_bytes());

        for entry in self.caids {
            let (data, len) = ca_descriptor(entry);
            push_descriptor(&mut buf, DESC_CA, &data[..len]);
        }

        finish(buf, self.sequence)
    }
}

/**
    Classic-mode stop: an empty `ONLY`/`NOT_SELECTED` object.
*/
pub fn stop_message(service_id: u16, sequence: u16) -> Vec<u8> {
    let buf = header(ListManagement::Only, service_id, 1, Command::NotSelected);
    finish(buf, sequence)
}

fn header(list: ListManagement, service_id: u16, version: u8, command: Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(&CAPMT_INDICATOR);
    // length, patched in finish
    buf.extend_from_slice(&[0, 0]);
    buf.push(list as u8);
    buf.extend_from_slice(&service_id.to_be_bytes());
    buf.push(version);
    // program_info_length, patched in finish
    buf.extend_from_slice(&[0, 0]);
    buf.push(command as u8);
    debug_assert_eq!(buf.len(), CAPMT_HEADER_SIZE);
    buf
}

fn push_descriptor(buf: &mut Vec<u8>, tag: u8, data: &[u8]) {
    buf.push(tag);
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
}

fn finish(mut buf: Vec<u8>, sequence: u16) -> Vec<u8> {
    let seq = sequence.to_be_bytes();
    buf.extend_from_slice(&[0x01, seq[0], seq[1], 0x00, 0x06]);

    let pos = buf.len();
    let len = (pos - 6) as u16;
    buf[4..6].copy_from_slice(&len.to_be_bytes());
    let info_len = (pos.saturating_sub(5 + 12) & 0x0fff) as u16;
    buf[10..12].copy_from_slice(&info_len.to_be_bytes());
    buf
}

/**
    Payload of a CA descriptor. Where the provider id goes, and how long
    the descriptor is, depends on the CA family.
*/
fn ca_descriptor(entry: &CaidEntry) -> ([u8; CA_DESCRIPTOR_DATA_LEN], usize) {
    let mut data = [0u8; CA_DESCRIPTOR_DATA_LEN];
    let caid = entry.caid.to_be_bytes();
    data[0] = caid[0];
    data[1] = caid[1];
    data[2] = (entry.pid >> 8) as u8 | 0xe0;
    data[3] = entry.pid as u8;

    let provider = entry.provider_id;
    if provider == 0 {
        return (data, 4);
    }
    let len = match caid[0] {
        0x01 => {
            data[4] = (provider >> 8) as u8;
            data[5] = provider as u8;
            0x11
        }
        0x05 => {
            data[10] = 0x14;
            data[11..15].copy_from_slice(&provider.to_be_bytes());
            0x0f
        }
        0x18 => {
            data[5] = (provider >> 8) as u8;
            data[6] = provider as u8;
            0x07
        }
        0x4a => {
            data[4] = provider as u8;
            0x05
        }
        _ => {
            warn!(
                caid = format_args!("{:04x}", entry.caid),
                provider = format_args!("{provider:06x}"),
                "no provider id placement known for CA system"
            );
            4
        }
    };
    (data, len)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn capmt(mode: CapmtMode, caids: &[CaidEntry]) -> Vec<u8> {
        CaPmt {
            list: ListManagement::Only,
            command: Command::OkDescrambling,
            mode,
            service_id: 0x1234,
            transport_stream_id: 0x0001,
            adapter: 1,
            sequence: 7,
            version: 3,
            caids,
        }
        .encode()
    }

    /// Descriptors between the fixed header and the trailer.
    fn descriptors(buf: &[u8]) -> &[u8] {
        &buf[CAPMT_HEADER_SIZE..buf.len() - 5]
    }

    /// The first CA descriptor, after private (10), demux (4) and PID (4).
    fn ca(buf: &[u8]) -> &[u8] {
        &descriptors(buf)[18..]
    }

    #[test]
    fn header_and_trailer() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x0b00, 0x0100, 0)]);
        assert_eq!(buf.len(), 13 + 10 + 4 + 4 + 6 + 5);
        assert_eq!(&buf[..4], &CAPMT_INDICATOR);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]) as usize, buf.len() - 6);
        assert_eq!(buf[6], ListManagement::Only as u8);
        assert_eq!(&buf[7..9], &[0x12, 0x34]);
        assert_eq!(buf[9], 3);
        assert_eq!(
            u16::from_be_bytes([buf[10], buf[11]]) as usize,
            buf.len() - 17
        );
        assert_eq!(buf[12], Command::OkDescrambling as u8);
        assert_eq!(&buf[buf.len() - 5..], &hex!("0100070006"));

        assert_eq!(
            descriptors(&buf),
            &hex!(
                "81 08 00000000 1234 0001"
                "82 02 00 01"
                "84 02 0100"
                "09 04 0b00 e100"
            )
        );
    }

    #[test]
    fn classic_demux_is_bitmask() {
        let buf = capmt(CapmtMode::Classic, &[CaidEntry::new(0x0b00, 0x0100, 0)]);
        assert_eq!(&descriptors(&buf)[10..14], &hex!("82 02 02 01"));
    }

    #[test]
    fn seca_provider() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x0100, 0x0101, 0x0070)]);
        let ca = ca(&buf);
        assert_eq!(ca[1], 0x11);
        assert_eq!(&ca[2..8], &hex!("0100 e101 0070"));
        assert_eq!(ca.len(), 2 + 0x11);
    }

    #[test]
    fn viaccess_provider() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x0500, 0x0102, 0x023800)]);
        let ca = ca(&buf);
        assert_eq!(ca[1], 0x0f);
        assert_eq!(&ca[2..6], &hex!("0500 e102"));
        assert_eq!(ca[12], 0x14);
        assert_eq!(&ca[13..17], &hex!("00023800"));
    }

    #[test]
    fn nagra_provider() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x1800, 0x0103, 0x0501)]);
        let ca = ca(&buf);
        assert_eq!(ca, &hex!("09 07 1800 e103 00 0501"));
    }

    #[test]
    fn dre_provider() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x4ae1, 0x0104, 0x11)]);
        assert_eq!(ca(&buf), &hex!("09 05 4ae1 e104 11"));
    }

    #[test]
    fn unknown_family_drops_provider() {
        let buf = capmt(CapmtMode::Oscam, &[CaidEntry::new(0x0b00, 0x0105, 0x1234)]);
        assert_eq!(ca(&buf), &hex!("09 04 0b00 e105"));
    }

    #[test]
    fn stop() {
        let buf = stop_message(0x0064, 0x0102);
        assert_eq!(buf, hex!("9f803282 000c 03 0064 01 0001 04 0101020006"));
    }

    #[test]
    fn version_cycles() {
        let mut counter = VersionCounter::default();
        let versions: Vec<u8> = (0..33).map(|_| counter.next()).collect();
        assert_eq!(versions[0], 1);
        assert_eq!(versions[30], 31);
        assert_eq!(versions[31], 1);
        assert_eq!(versions[32], 2);
    }

    #[test]
    fn list_positions() {
        use ListManagement::*;
        let positions: Vec<_> = (0..3).map(|i| ListManagement::for_position(i, 3)).collect();
        assert_eq!(positions, vec![First, More, Last]);
        assert_eq!(ListManagement::for_position(0, 1), Only);
    }
}
