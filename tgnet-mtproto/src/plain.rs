//! Unencrypted message framing, used only while no auth key exists.
//!
//! Wire layout: `auth_key_id = 0 (8B) ∥ msg_id (8B) ∥ body_len (4B) ∥ body`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Errors from [`unpack`].
#[derive(Clone, Debug, PartialEq)]
pub enum PlainError {
    /// Shorter than the fixed 20-byte header.
    TooShort,
    /// `auth_key_id` was not zero.
    BadAuthKeyId,
    /// The body length field pointed past the end of the frame.
    BadLength,
}

impl std::fmt::Display for PlainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "plaintext frame too short"),
            Self::BadAuthKeyId => write!(f, "expected auth_key_id = 0"),
            Self::BadLength => write!(f, "plaintext body length out of bounds"),
        }
    }
}
impl std::error::Error for PlainError {}

/// Allocates handshake message ids and frames plaintext payloads.
pub struct PlainSession {
    counter: u32,
}

impl PlainSession {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// A server-acceptable plaintext msg id: current Unix time in the top
    /// half, an in-second counter below, low two bits zero.
    fn next_msg_id(&mut self) -> i64 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.counter += 1;
        ((secs << 32) | (u64::from(self.counter) << 2)) as i64
    }

    /// Frame `body` as a plaintext message.
    pub fn pack(&mut self, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + body.len());
        buf.extend_from_slice(&0i64.to_le_bytes());
        buf.extend_from_slice(&self.next_msg_id().to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf
    }
}

impl Default for PlainSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the plaintext header from an inbound frame, returning the body.
pub fn unpack(frame: &[u8]) -> Result<&[u8], PlainError> {
    if frame.len() < 20 {
        return Err(PlainError::TooShort);
    }
    if frame[..8] != [0u8; 8] {
        return Err(PlainError::BadAuthKeyId);
    }
    let body_len = u32::from_le_bytes(frame[16..20].try_into().unwrap()) as usize;
    if body_len > frame.len() - 20 {
        return Err(PlainError::BadLength);
    }
    Ok(&frame[20..20 + body_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout() {
        let mut s = PlainSession::new();
        let wire = s.pack(&[0xaa, 0xbb]);
        assert_eq!(wire.len(), 20 + 2);
        assert_eq!(&wire[..8], &[0u8; 8]);
        assert_eq!(u32::from_le_bytes(wire[16..20].try_into().unwrap()), 2);
        assert_eq!(&wire[20..], &[0xaa, 0xbb]);
    }

    #[test]
    fn msg_ids_increase_within_a_second() {
        let mut s = PlainSession::new();
        let a = i64::from_le_bytes(s.pack(&[])[8..16].try_into().unwrap());
        let b = i64::from_le_bytes(s.pack(&[])[8..16].try_into().unwrap());
        assert!(b > a);
        assert_eq!(a & 0b11, 0);
    }

    #[test]
    fn unpack_roundtrip_and_errors() {
        let mut s = PlainSession::new();
        let wire = s.pack(b"body");
        assert_eq!(unpack(&wire).unwrap(), b"body");

        assert_eq!(unpack(&wire[..10]), Err(PlainError::TooShort));

        let mut nonzero = wire.clone();
        nonzero[0] = 1;
        assert_eq!(unpack(&nonzero), Err(PlainError::BadAuthKeyId));

        let mut truncated = wire;
        truncated[16] = 200;
        assert_eq!(unpack(&truncated), Err(PlainError::BadLength));
    }
}
