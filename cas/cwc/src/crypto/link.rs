use des::{
    Des,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use rand::Rng;

use crate::constants::{DES_KEY_LEN, NETMSG_SIZE};
use crate::error::CwcError;

/**
    Expand a 14-byte key into two parity-adjusted 8-byte DES keys.

    Each half of 7 bytes (56 key bits) is spread over 8 bytes, leaving the
    low bit of every byte for odd parity.
*/
pub fn spread_key(normal: &[u8; DES_KEY_LEN]) -> [u8; 16] {
    let mut spread = [0u8; 16];
    for (half, out) in normal.chunks_exact(7).zip(spread.chunks_exact_mut(8)) {
        out[0] = half[0] & 0xfe;
        for k in 1..7 {
            out[k] = ((half[k - 1] << (8 - k)) | (half[k] >> k)) & 0xfe;
        }
        out[7] = half[6] << 1;
    }
    for byte in &mut spread {
        *byte |= odd_parity_bit(*byte);
    }
    spread
}

fn odd_parity_bit(byte: u8) -> u8 {
    // parity over bits 1..8, bit 0 is about to be set
    u8::from((byte >> 1).count_ones() % 2 == 0)
}

/**
    The two-key DES session used on a CWC link.
*/
#[derive(Clone)]
pub struct LinkKey {
    k1: Des,
    k2: Des,
}

impl LinkKey {
    pub fn from_des14(key: &[u8; DES_KEY_LEN]) -> Self {
        let spread = spread_key(key);
        Self {
            k1: Des::new(GenericArray::from_slice(&spread[..8])),
            k2: Des::new(GenericArray::from_slice(&spread[8..])),
        }
    }

    /**
        Key for the login exchange: master key XOR the server's login key.
    */
    pub fn login(master: &[u8; DES_KEY_LEN], login_key: &[u8; DES_KEY_LEN]) -> Self {
        let mut des14 = *master;
        for (k, l) in des14.iter_mut().zip(login_key) {
            *k ^= l;
        }
        Self::from_des14(&des14)
    }

    /**
        Key for everything after login: the master key with the salted
        password XORed in cyclically.
    */
    pub fn session(master: &[u8; DES_KEY_LEN], salted_password: &[u8]) -> Self {
        let mut des14 = *master;
        for (i, b) in salted_password.iter().enumerate() {
            des14[i % DES_KEY_LEN] ^= b;
        }
        Self::from_des14(&des14)
    }

    /**
        Encrypt a message in place. `buf` holds two length bytes followed by
        the plain body; on return it holds padding, checksum and IV trailer.
    */
    pub fn encrypt(&self, buf: &mut Vec<u8>) -> Result<(), CwcError> {
        self.encrypt_with(buf, &mut rand::rng())
    }

    pub fn encrypt_with(&self, buf: &mut Vec<u8>, rng: &mut impl Rng) -> Result<(), CwcError> {
        let len = buf.len();
        if len < 2 {
            return Err(CwcError::MessageTooShort(len));
        }
        let pad = (8 - ((len - 1) % 8)) % 8;
        if len + pad + 1 >= NETMSG_SIZE - 8 {
            return Err(CwcError::MessageTooLarge(len));
        }

        buf.extend((0..pad).map(|_| rng.random::<u8>()));
        let checksum = buf[2..].iter().fold(0u8, |acc, b| acc ^ b);
        buf.push(checksum);

        let mut iv = [0u8; 8];
        rng.fill(&mut iv);
        let trailer = iv;

        for block in buf[2..].chunks_exact_mut(8) {
            for (b, v) in block.iter_mut().zip(&iv) {
                *b ^= v;
            }
            let block = GenericArray::from_mut_slice(block);
            self.k1.encrypt_block(block);
            self.k2.decrypt_block(block);
            self.k1.encrypt_block(block);
            iv.copy_from_slice(block);
        }

        buf.extend_from_slice(&trailer);
        Ok(())
    }

    /**
        Decrypt a received message in place and verify its checksum.
        Returns the length of the message without the IV trailer.
    */
    pub fn decrypt(&self, buf: &mut [u8]) -> Result<usize, CwcError> {
        let len = buf.len();
        if len < 18 || (len - 2) % 8 != 0 {
            return Err(CwcError::BadCipherLength(len));
        }
        let len = len - 8;
        let mut next_iv = [0u8; 8];
        next_iv.copy_from_slice(&buf[len..]);

        for block in buf[2..len].chunks_exact_mut(8) {
            let iv = next_iv;
            next_iv.copy_from_slice(block);
            let cipher_block = GenericArray::from_mut_slice(block);
            self.k1.decrypt_block(cipher_block);
            self.k2.encrypt_block(cipher_block);
            self.k1.decrypt_block(cipher_block);
            for (b, v) in block.iter_mut().zip(&iv) {
                *b ^= v;
            }
        }

        let checksum = buf[2..len].iter().fold(0u8, |acc, b| acc ^ b);
        if checksum != 0 {
            return Err(CwcError::Checksum);
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn spread_known_vectors() {
        let key: [u8; 14] = core::array::from_fn(|i| i as u8 + 1);
        assert_eq!(spread_key(&key), hex!("018080614029190e08044340b061341c"));
        assert_eq!(spread_key(&[0xff; 14]), [0xfe; 16]);
    }

    #[test]
    fn spread_has_odd_parity() {
        let key: [u8; 14] = hex!("a1b2c3d4e5f60718293a4b5c6d7e");
        for byte in spread_key(&key) {
            assert_eq!(byte.count_ones() % 2, 1);
        }
    }

    #[test]
    fn round_trip_random_bodies() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut master = [0u8; 14];
            let mut login = [0u8; 14];
            rng.fill(&mut master);
            rng.fill(&mut login);
            let key = LinkKey::login(&master, &login);

            let body_len = rng.random_range(0..=250);
            let mut buf = vec![0u8, 0u8];
            buf.extend((0..body_len).map(|_| rng.random::<u8>()));
            let plain = buf.clone();

            key.encrypt_with(&mut buf, &mut rng).unwrap();
            assert_eq!((buf.len() - 2) % 8, 0);
            assert!(buf.len() <= NETMSG_SIZE);

            let len = key.decrypt(&mut buf).unwrap();
            assert_eq!(&buf[..plain.len()], &plain[..]);
            assert!(len > plain.len());
        }
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let key = LinkKey::session(&[0x11; 14], b"$1$abcdefgh$x");
        let mut buf = vec![0, 0, 0xe3, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        key.encrypt(&mut buf).unwrap();

        // the trailer IV only feeds the first block, so one flipped bit
        // flips exactly one plaintext bit
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(key.decrypt(&mut buf), Err(CwcError::Checksum)));
    }

    #[test]
    fn oversized_message_is_refused() {
        let key = LinkKey::from_des14(&[0; 14]);
        let mut buf = vec![0u8; NETMSG_SIZE - 8];
        assert!(matches!(key.encrypt(&mut buf), Err(CwcError::MessageTooLarge(_))));
    }

    #[test]
    fn short_cipher_text_is_refused() {
        let key = LinkKey::from_des14(&[0; 14]);
        assert!(matches!(key.decrypt(&mut [0u8; 10]), Err(CwcError::BadCipherLength(10))));
    }
}
