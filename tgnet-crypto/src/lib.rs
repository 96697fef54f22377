//! Cryptographic primitives for Telegram MTProto v2.
//!
//! Provides:
//! - AES-256-IGE and AES-256-CTR
//! - SHA-1 / SHA-256 hash macros
//! - Pollard-rho PQ factorization
//! - RSA-PAD encryption and the trusted server-key register
//! - [`AuthKey`] — the 256-byte per-DC key
//! - MTProto 2.0 message encryption / decryption
//! - DH nonce → AES key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// Which peer authored a message. Key derivation differs by 8 bytes of
/// key-slice offset between the two directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt `plaintext` as `side` using MTProto 2.0.
///
/// Returns `key_id ∥ msg_key ∥ AES-IGE(plaintext ∥ padding)` ready for the
/// transport. The session layer always passes [`Side::Client`]; the server
/// role exists for loopback servers in tests.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom");
    do_encrypt_data_v2(plaintext, auth_key, side, &rnd)
}

fn do_encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side, rnd: &[u8; 32]) -> Vec<u8> {
    let pad = padding_len(plaintext.len());

    let mut buffer = Vec::with_capacity(24 + plaintext.len() + pad);
    buffer.extend_from_slice(&[0u8; 24]); // room for key_id ∥ msg_key
    buffer.extend_from_slice(plaintext);
    buffer.extend_from_slice(&rnd[..pad]);

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut buffer[24..], &key, &iv);

    buffer[..8].copy_from_slice(&auth_key.key_id);
    buffer[8..24].copy_from_slice(&msg_key);
    buffer
}

/// Decrypt an MTProto 2.0 ciphertext authored by `from`.
///
/// `buffer` must be `key_id ∥ msg_key ∥ ciphertext`. Verifies both the key id
/// and the msg-key before returning the plaintext (padding included).
pub fn decrypt_data_v2(buffer: &[u8], auth_key: &AuthKey, from: Side) -> Result<Vec<u8>, DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, from);
    let mut plaintext = buffer[24..].to_vec();
    aes::ige_decrypt(&mut plaintext, &key, &iv);

    let x = from.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &plaintext);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(plaintext)
}

/// Derive `(key, iv)` from the handshake nonces for the
/// `server_DH_params_ok.encrypted_answer` payload.
pub fn generate_key_data_from_nonce(
    server_nonce: &[u8; 16],
    new_nonce: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn v2_roundtrip_client_to_server() {
        let key = key();
        let plain = b"salt.session.msgid.seq.len.body".to_vec();
        let wire = encrypt_data_v2(&plain, &key, Side::Client);
        assert_eq!(&wire[..8], &key.key_id());
        let out = decrypt_data_v2(&wire, &key, Side::Client).unwrap();
        assert_eq!(&out[..plain.len()], plain.as_slice());
        // Padding stays within the MTProto bounds.
        assert!(out.len() - plain.len() >= 12 && out.len() - plain.len() <= 1024);
    }

    #[test]
    fn v2_roundtrip_server_to_client() {
        let key = key();
        let plain = vec![0x42u8; 64];
        let wire = encrypt_data_v2(&plain, &key, Side::Server);
        let out = decrypt_data_v2(&wire, &key, Side::Server).unwrap();
        assert_eq!(&out[..plain.len()], plain.as_slice());
        // The directions must not be interchangeable.
        assert_eq!(
            decrypt_data_v2(&wire, &key, Side::Client),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn v2_rejects_wrong_key_id() {
        let wire = encrypt_data_v2(b"data", &key(), Side::Client);
        let other = AuthKey::from_bytes([9u8; 256]);
        assert_eq!(
            decrypt_data_v2(&wire, &other, Side::Client),
            Err(DecryptError::AuthKeyMismatch)
        );
    }

    #[test]
    fn v2_rejects_tampered_ciphertext() {
        let key = key();
        let mut wire = encrypt_data_v2(b"data", &key, Side::Client);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert_eq!(
            decrypt_data_v2(&wire, &key, Side::Client),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn v2_rejects_short_or_misaligned_buffers() {
        let key = key();
        assert_eq!(
            decrypt_data_v2(&[0u8; 23], &key, Side::Server),
            Err(DecryptError::InvalidBuffer)
        );
        assert_eq!(
            decrypt_data_v2(&[0u8; 25], &key, Side::Server),
            Err(DecryptError::InvalidBuffer)
        );
    }

    #[test]
    fn nonce_key_derivation_is_deterministic() {
        let (k1, iv1) = generate_key_data_from_nonce(&[1; 16], &[2; 32]);
        let (k2, iv2) = generate_key_data_from_nonce(&[1; 16], &[2; 32]);
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);
        let (k3, _) = generate_key_data_from_nonce(&[3; 16], &[2; 32]);
        assert_ne!(k1, k3);
    }
}
