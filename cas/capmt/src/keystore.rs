use std::collections::{BTreeMap, HashMap};

use cas_core::{ControlWord, Parity};

use crate::constants::MAX_INDEX;
use crate::error::{CapmtError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    pid: u16,
    even: ControlWord,
    odd: ControlWord,
}

/**
    Key material for one descrambler slot after a `CA_SET_DESCR`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedKeys {
    pub pid: u16,
    pub even: ControlWord,
    pub odd: ControlWord,
}

/**
    Per-adapter, per-index staging of PIDs and control word halves as the
    CAM announces them one ioctl at a time.
*/
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    adapters: HashMap<u8, BTreeMap<i32, Slot>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pid(&mut self, adapter: u8, index: i32, pid: u32) -> Result<()> {
        if index == -1 {
            self.adapters.remove(&adapter);
            return Ok(());
        }
        check_index(index)?;
        let slot = self
            .adapters
            .entry(adapter)
            .or_default()
            .entry(index)
            .or_default();
        slot.pid = pid as u16;
        Ok(())
    }

    /**
        Store one half. Returns both halves and the slot's PID, or `None`
        for the "remove descrambler" request (index -1).
    */
    pub fn set_descr(
        &mut self,
        adapter: u8,
        index: i32,
        parity: Parity,
        cw: ControlWord,
    ) -> Result<Option<StagedKeys>> {
        if index == -1 {
            return Ok(None);
        }
        check_index(index)?;
        let slot = self
            .adapters
            .entry(adapter)
            .or_default()
            .entry(index)
            .or_default();
        match parity {
            Parity::Even => slot.even = cw,
            Parity::Odd => slot.odd = cw,
        }
        Ok(Some(StagedKeys {
            pid: slot.pid,
            even: slot.even,
            odd: slot.odd,
        }))
    }

    pub fn clear(&mut self) {
        self.adapters.clear();
    }
}

fn check_index(index: i32) -> Result<()> {
    if (0..MAX_INDEX).contains(&index) {
        Ok(())
    } else {
        Err(CapmtError::InvalidIndex(index))
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const EVEN: ControlWord = ControlWord(hex!("1111111111111111"));
    const ODD: ControlWord = ControlWord(hex!("2222222222222222"));

    #[test]
    fn halves_accumulate() {
        let mut store = KeyStore::new();
        store.set_pid(0, 2, 7).unwrap();

        let staged = store.set_descr(0, 2, Parity::Even, EVEN).unwrap().unwrap();
        assert_eq!(staged.pid, 7);
        assert_eq!(staged.even, EVEN);
        assert!(staged.odd.is_zero());

        let staged = store.set_descr(0, 2, Parity::Odd, ODD).unwrap().unwrap();
        assert_eq!((staged.even, staged.odd), (EVEN, ODD));
    }

    #[test]
    fn adapters_are_separate() {
        let mut store = KeyStore::new();
        store.set_pid(0, 0, 1).unwrap();
        store.set_pid(1, 0, 2).unwrap();
        let staged = store.set_descr(1, 0, Parity::Even, EVEN).unwrap().unwrap();
        assert_eq!(staged.pid, 2);
    }

    #[test]
    fn clear_adapter() {
        let mut store = KeyStore::new();
        store.set_pid(0, 0, 5).unwrap();
        store.set_descr(0, 0, Parity::Even, EVEN).unwrap();
        store.set_pid(0, -1, 0).unwrap();

        let staged = store.set_descr(0, 0, Parity::Odd, ODD).unwrap().unwrap();
        assert_eq!(staged.pid, 0);
        assert!(staged.even.is_zero());
    }

    #[test]
    fn removal_and_range() {
        let mut store = KeyStore::new();
        assert_eq!(store.set_descr(0, -1, Parity::Even, EVEN).unwrap(), None);
        assert!(store.set_pid(0, 64, 1).is_err());
        assert!(store.set_descr(0, -2, Parity::Odd, ODD).is_err());
    }
}
