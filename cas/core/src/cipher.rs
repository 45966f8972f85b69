use std::sync::Arc;

use des::{
    Des,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};

use crate::constants::DEFAULT_CLUSTER_SIZE;
use crate::types::{ControlWord, Parity};

/**
    One encrypted region inside a cluster buffer.

    `start` is an absolute byte offset into the cluster, `len` the number of
    encrypted payload bytes that follow it.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub start: usize,
    pub len: usize,
}

/**
    Bulk decryptor for scrambled TS payloads.

    Implementations keep their own key schedule per parity. The instance
    calls `set_control_word` only with non-zero words and then `decrypt`
    once per non-empty parity batch when a cluster is full.
*/
pub trait ControlWordCipher: Send {
    /**
        Number of packets the cipher prefers to decrypt in one call.
    */
    fn suggested_cluster_size(&self) -> usize {
        DEFAULT_CLUSTER_SIZE
    }

    fn set_control_word(&mut self, parity: Parity, cw: &ControlWord);

    fn decrypt(&mut self, parity: Parity, cluster: &mut [u8], batch: &[BatchEntry]);
}

/**
    Builds a fresh cipher context for each descrambler instance.
*/
pub type CipherFactory = Arc<dyn Fn() -> Box<dyn ControlWordCipher> + Send + Sync>;

pub fn des_ncb_factory() -> CipherFactory {
    des_ncb_factory_sized(DEFAULT_CLUSTER_SIZE)
}

pub fn des_ncb_factory_sized(cluster_size: usize) -> CipherFactory {
    let cluster_size = cluster_size.max(1);
    Arc::new(move || {
        Box::new(DesNcbCipher::with_cluster_size(cluster_size)) as Box<dyn ControlWordCipher>
    })
}

/**
    Reference cipher: DES in ECB mode over each whole 8-byte block of the
    payload. A trailing residue shorter than a block is left untouched.
*/
pub struct DesNcbCipher {
    keys: [Option<Des>; 2],
    cluster_size: usize,
}

impl DesNcbCipher {
    pub fn new() -> Self {
        Self::with_cluster_size(DEFAULT_CLUSTER_SIZE)
    }

    pub fn with_cluster_size(cluster_size: usize) -> Self {
        Self {
            keys: [None, None],
            cluster_size,
        }
    }

    /**
        Encrypt `data` in place with `cw`, the inverse of what the cipher
        undoes on the descrambling path.
    */
    pub fn scramble(cw: &ControlWord, data: &mut [u8]) {
        let des = Des::new(GenericArray::from_slice(cw.as_bytes()));
        for block in data.chunks_exact_mut(8) {
            des.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }
}

impl Default for DesNcbCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlWordCipher for DesNcbCipher {
    fn suggested_cluster_size(&self) -> usize {
        self.cluster_size
    }

    fn set_control_word(&mut self, parity: Parity, cw: &ControlWord) {
        self.keys[parity.index()] = Some(Des::new(GenericArray::from_slice(cw.as_bytes())));
    }

    fn decrypt(&mut self, parity: Parity, cluster: &mut [u8], batch: &[BatchEntry]) {
        let Some(des) = &self.keys[parity.index()] else {
            return;
        };
        for entry in batch {
            let Some(region) = cluster.get_mut(entry.start..entry.start + entry.len) else {
                continue;
            };
            for block in region.chunks_exact_mut(8) {
                des.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
    }
}
