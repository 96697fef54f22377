//! The 2048-bit authorization key shared with one datacenter.

use crate::sha1;

/// A datacenter authorization key (256 bytes) with its derived identifiers.
///
/// Immutable once created; produced either by the DH handshake or by loading
/// persisted bytes.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from the raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// The raw 256-byte representation, for persistence.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The key identifier sent in every encrypted message header
    /// (low 64 bits of SHA-1 of the key).
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// [`AuthKey::key_id`] as the signed integer the wire format uses.
    pub fn id(&self) -> i64 {
        i64::from_le_bytes(self.key_id)
    }

    /// The `new_nonce_hashN` value expected in `dh_gen_ok` / `retry` / `fail`.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={})", self.id())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_low_64_bits_of_sha1() {
        let key = AuthKey::from_bytes([0x55; 256]);
        let sha = sha1!(&[0x55u8; 256]);
        assert_eq!(key.key_id(), sha[12..20]);
        assert_eq!(key.id(), i64::from_le_bytes(sha[12..20].try_into().unwrap()));
    }

    #[test]
    fn nonce_hash_depends_on_number() {
        let key = AuthKey::from_bytes([1; 256]);
        let nonce = [9u8; 32];
        assert_ne!(
            key.calc_new_nonce_hash(&nonce, 1),
            key.calc_new_nonce_hash(&nonce, 2)
        );
    }
}
