//! Per-DC session state: message ids, sequence numbers, inbound-id
//! validation and the encrypted message envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use tgnet_crypto::{decrypt_data_v2, encrypt_data_v2, AuthKey, DecryptError, Side};

/// How many inbound message ids the duplicate filter remembers.
const INBOUND_REGISTER_SIZE: usize = 128;

/// Why an inbound message id was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidInboundMsgId {
    /// Server message ids must be odd.
    Even,
    /// The embedded timestamp is outside the `[-300 s, +30 s]` window.
    InvalidTime,
    /// The id was already seen, or predates everything in the register.
    Duplicate,
}

/// Errors from [`Session::unpack`].
#[derive(Clone, Debug, PartialEq)]
pub enum UnpackError {
    /// The crypto layer rejected the frame.
    Decrypt(DecryptError),
    /// The plaintext was too short for the inner header.
    TooShort,
    /// The body length field pointed past the end of the plaintext.
    BadLength,
    /// The frame targeted the session id retired by the last
    /// [`Session::reset_session_id`]; safe to drop silently.
    RetiredSession,
    /// The frame targeted an unknown session id.
    SessionMismatch {
        got: i64,
    },
}

impl std::fmt::Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decrypt(e) => write!(f, "decrypt: {e}"),
            Self::TooShort => write!(f, "inner plaintext too short"),
            Self::BadLength => write!(f, "inner body length out of bounds"),
            Self::RetiredSession => write!(f, "frame for retired session id"),
            Self::SessionMismatch { got } => write!(f, "session_id mismatch (got {got})"),
        }
    }
}
impl std::error::Error for UnpackError {}

/// The decrypted inner payload of a server frame.
#[derive(Debug, PartialEq)]
pub struct DecryptedMessage {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

// ─── Inbound id register ─────────────────────────────────────────────────────

/// Fixed-capacity ordered set of the most recent inbound message ids.
///
/// Ids at or below the oldest retained entry are rejected without scanning.
/// Capacity must be a power of two (≥ 16).
struct MessageIdRegister {
    buffer: Vec<i64>,
    pos: usize,
    overflow: bool,
}

impl MessageIdRegister {
    fn new(size: usize) -> Self {
        assert!(size >= 16 && size.is_power_of_two());
        Self { buffer: vec![0; size], pos: 0, overflow: false }
    }

    /// `true` if `msg_id` is fresh (and, when incremental, now recorded).
    fn check(&mut self, msg_id: i64) -> bool {
        debug_assert_ne!(msg_id, 0);

        let min = if self.overflow { self.pos } else { 0 };
        let oldest = self.buffer[if min == self.buffer.len() { 0 } else { min }];
        if msg_id <= oldest {
            return false;
        }

        if self.pos == 0 {
            self.buffer[self.pos] = msg_id;
            self.pos += 1;
            return true;
        }

        let newest = self.buffer[self.pos - 1];
        if msg_id > newest {
            if self.pos == self.buffer.len() {
                self.overflow = true;
                self.pos = 0;
            }
            self.buffer[self.pos] = msg_id;
            self.pos += 1;
            true
        } else if msg_id == newest {
            false
        } else {
            // Non-incremental id: either a replay from inside the window or
            // an out-of-order delivery the protocol tolerates.
            if self.buffer.contains(&msg_id) {
                return false;
            }
            log::debug!("accepted non-incremental inbound msg_id {msg_id:#x}");
            true
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

fn now_parts() -> (i64, i64) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_secs() as i64, now.subsec_millis() as i64)
}

fn random_i64() -> i64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    i64::from_le_bytes(b)
}

/// Everything a single encrypted session with one datacenter tracks.
///
/// Owned exclusively by that session's engine task; no internal locking.
pub struct Session {
    auth_key: AuthKey,
    session_id: i64,
    old_session_id: i64,
    time_offset: i32,
    last_msg_id: i64,
    seq_no: i32,
    server_salt: i64,
    unauthorized: bool,
    inbound_ids: MessageIdRegister,
}

impl Session {
    /// Start a session over an existing key (freshly negotiated or loaded
    /// from the store). A random session id is chosen.
    pub fn new(auth_key: AuthKey, server_salt: i64, time_offset: i32) -> Self {
        Self {
            auth_key,
            session_id: random_i64(),
            old_session_id: 0,
            time_offset,
            last_msg_id: 0,
            seq_no: 0,
            server_salt,
            unauthorized: false,
            inbound_ids: MessageIdRegister::new(INBOUND_REGISTER_SIZE),
        }
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn server_salt(&self) -> i64 {
        self.server_salt
    }

    pub fn set_server_salt(&mut self, salt: i64) {
        self.server_salt = salt;
    }

    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    pub fn unauthorized(&self) -> bool {
        self.unauthorized
    }

    pub fn set_unauthorized(&mut self, state: bool) {
        self.unauthorized = state;
    }

    /// Allocate the next outbound message id.
    ///
    /// Layout: 32 bits of corrected server time, 10 bits of milliseconds,
    /// a random field, and two zero low bits. Strictly increasing; a stale
    /// clock falls back to `last + 4`.
    pub fn next_msg_id(&mut self) -> i64 {
        let (secs, millis) = now_parts();
        let mut rnd = [0u8; 4];
        getrandom::getrandom(&mut rnd).expect("getrandom");
        let random = (u32::from_le_bytes(rnd) & 0x1f_ffff) as i64;

        let mut id = (secs + self.time_offset as i64) << 32 | millis << 20 | random << 2;
        if id <= self.last_msg_id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        id
    }

    /// Allocate the next sequence number. Content-related messages advance
    /// the counter and get odd values; service messages get the current even
    /// value without advancing.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let seq = self.seq_no * 2 + 1;
            self.seq_no += 1;
            seq
        } else {
            self.seq_no * 2
        }
    }

    /// Reset the content-message counter (server reported a bad `seq_no`).
    pub fn reset_seq_no(&mut self) {
        self.seq_no = 0;
    }

    /// Adopt the server clock. Resets `last_msg_id` when the correction is
    /// larger than the allocation formula absorbs naturally.
    pub fn update_time_offset(&mut self, server_time: i32) {
        let (now, _) = now_parts();
        let updated = server_time - now as i32;
        if (self.time_offset - updated).abs() > 3 {
            self.last_msg_id = 0;
            self.time_offset = updated;
        }
    }

    /// Retire the current session id and start a fresh one (never reusing
    /// the retired value). Resets the sequence counter.
    pub fn reset_session_id(&mut self) {
        self.seq_no = 0;
        self.old_session_id = self.session_id;
        loop {
            self.session_id = random_i64();
            if self.session_id != self.old_session_id {
                break;
            }
        }
    }

    /// Validate an inbound message id per the protocol rules. `None` means
    /// accept (the id is now registered).
    pub fn is_valid_inbound_msg_id(&mut self, msg_id: i64) -> Option<InvalidInboundMsgId> {
        if msg_id & 1 == 0 {
            return Some(InvalidInboundMsgId::Even);
        }
        let (now, _) = now_parts();
        let server_time = now + self.time_offset as i64;
        let id_time = (msg_id as u64 >> 32) as i64;
        if !(server_time - 300 < id_time && id_time < server_time + 30) {
            return Some(InvalidInboundMsgId::InvalidTime);
        }
        if !self.inbound_ids.check(msg_id) {
            return Some(InvalidInboundMsgId::Duplicate);
        }
        None
    }

    /// Encrypt one message with a pre-allocated id and sequence number.
    ///
    /// Plaintext layout before encryption:
    /// ```text
    /// salt ∥ session_id ∥ msg_id ∥ seq_no ∥ body_len ∥ body
    /// ```
    pub fn pack(&self, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend_from_slice(&self.server_salt.to_le_bytes());
        plain.extend_from_slice(&self.session_id.to_le_bytes());
        plain.extend_from_slice(&msg_id.to_le_bytes());
        plain.extend_from_slice(&seq_no.to_le_bytes());
        plain.extend_from_slice(&(body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);
        encrypt_data_v2(&plain, &self.auth_key, Side::Client)
    }

    /// Decrypt a server frame and split the inner header from the body.
    pub fn unpack(&self, frame: &[u8]) -> Result<DecryptedMessage, UnpackError> {
        let plain = decrypt_data_v2(frame, &self.auth_key, Side::Server)
            .map_err(UnpackError::Decrypt)?;
        if plain.len() < 32 {
            return Err(UnpackError::TooShort);
        }

        let salt = i64::from_le_bytes(plain[..8].try_into().unwrap());
        let session_id = i64::from_le_bytes(plain[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plain[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;

        if session_id != self.session_id {
            if session_id == self.old_session_id && self.old_session_id != 0 {
                return Err(UnpackError::RetiredSession);
            }
            return Err(UnpackError::SessionMismatch { got: session_id });
        }
        if body_len > plain.len() - 32 {
            return Err(UnpackError::BadLength);
        }

        Ok(DecryptedMessage {
            salt,
            session_id,
            msg_id,
            seq_no,
            body: plain[32..32 + body_len].to_vec(),
        })
    }
}
