//! AES-256 in the two modes MTProto needs: IGE for message payloads and
//! CTR for the obfuscated transport keystream.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;

/// Encrypt `data` in place with AES-256-IGE.
///
/// `data.len()` must be a multiple of 16. The 32-byte `iv` is split into
/// `y₀ ∥ x₀` per the MTProto convention.
pub fn ige_encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut y_prev: [u8; 16] = iv[..16].try_into().unwrap();
    let mut x_prev: [u8; 16] = iv[16..].try_into().unwrap();

    for block in data.chunks_exact_mut(16) {
        let x: [u8; 16] = (&*block).try_into().unwrap();
        let mut y = GenericArray::clone_from_slice(&x);
        for (b, p) in y.iter_mut().zip(&y_prev) {
            *b ^= p;
        }
        cipher.encrypt_block(&mut y);
        for (b, p) in y.iter_mut().zip(&x_prev) {
            *b ^= p;
        }
        block.copy_from_slice(y.as_slice());
        y_prev.copy_from_slice(y.as_slice());
        x_prev = x;
    }
}

/// Decrypt `data` in place with AES-256-IGE. Inverse of [`ige_encrypt`].
pub fn ige_decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut y_prev: [u8; 16] = iv[..16].try_into().unwrap();
    let mut x_prev: [u8; 16] = iv[16..].try_into().unwrap();

    for block in data.chunks_exact_mut(16) {
        let y: [u8; 16] = (&*block).try_into().unwrap();
        let mut x = GenericArray::clone_from_slice(&y);
        for (b, p) in x.iter_mut().zip(&x_prev) {
            *b ^= p;
        }
        cipher.decrypt_block(&mut x);
        for (b, p) in x.iter_mut().zip(&y_prev) {
            *b ^= p;
        }
        block.copy_from_slice(x.as_slice());
        x_prev.copy_from_slice(x.as_slice());
        y_prev = y;
    }
}

/// AES-256-CTR keystream used by the obfuscated transport.
///
/// One instance per direction; `apply` advances the stream.
pub struct AesCtr(ctr::Ctr128BE<Aes256>);

impl AesCtr {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self(ctr::Ctr128BE::<Aes256>::new(key.into(), iv.into()))
    }

    /// XOR `data` in place with the next bytes of the keystream.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ige_roundtrip() {
        let key = [7u8; 32];
        let iv = [3u8; 32];
        let plain: Vec<u8> = (0..64).collect();

        let mut buf = plain.clone();
        ige_encrypt(&mut buf, &key, &iv);
        assert_ne!(buf, plain);
        ige_decrypt(&mut buf, &key, &iv);
        assert_eq!(buf, plain);
    }

    #[test]
    fn ige_chains_blocks() {
        // Identical plaintext blocks must not produce identical ciphertext.
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut buf = [0xabu8; 32];
        ige_encrypt(&mut buf, &key, &iv);
        assert_ne!(buf[..16], buf[16..]);
    }

    #[test]
    fn ctr_is_symmetric() {
        let key = [9u8; 32];
        let iv = [4u8; 16];
        let mut enc = AesCtr::new(&key, &iv);
        let mut dec = AesCtr::new(&key, &iv);

        let mut data = b"obfuscated transport bytes".to_vec();
        let original = data.clone();
        enc.apply(&mut data);
        assert_ne!(data, original);
        dec.apply(&mut data);
        assert_eq!(data, original);
    }
}
