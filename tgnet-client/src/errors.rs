//! Error types for tgnet-client.

use std::{fmt, io};

use tgnet_mtproto::authentication;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric suffixes are stripped from the name and surfaced in
/// [`RpcError::value`]: `FLOOD_WAIT_30` becomes
/// `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: message[..idx].to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with an optional `'*'` prefix/suffix wildcard.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// The flood-wait duration, if this is a `FLOOD_WAIT_N` error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(u64::from)
        } else {
            None
        }
    }

    /// The target DC, if this is one of the `*_MIGRATE_N` redirections.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.code != 303 {
            return None;
        }
        let base = self.name.strip_suffix("_MIGRATE")?;
        if matches!(base, "USER" | "PHONE" | "NETWORK" | "FILE") {
            self.value.map(|v| v as i32)
        } else {
            None
        }
    }
}

// ─── TransportError ───────────────────────────────────────────────────────────

/// A failure below the message layer.
#[derive(Debug)]
pub enum TransportError {
    /// Socket-level failure.
    Io(io::Error),
    /// The server answered with a bare negative code instead of a frame.
    Code(i32),
}

impl TransportError {
    /// `-404`: the server no longer recognizes our auth key.
    pub fn is_auth_key_invalid(&self) -> bool {
        matches!(self, Self::Code(-404))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O error: {e}"),
            Self::Code(-404) => write!(f, "transport error -404 (auth key invalid)"),
            Self::Code(-429) => write!(f, "transport error -429 (transport flood)"),
            Self::Code(c) => write!(f, "transport error {c}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type every request-submitting call can return.
///
/// Callers only ever observe [`Rpc`](Self::Rpc),
/// [`SessionClosed`](Self::SessionClosed), [`Cancelled`](Self::Cancelled) or
/// a response deserialization failure; the remaining kinds are consumed by
/// the internal retry and reconnect loops.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Connection-level failure.
    Transport(TransportError),
    /// Auth-key negotiation failed beyond its retry budget.
    Auth(authentication::Error),
    /// The peer violated the protocol; the connection was dropped.
    Protocol(String),
    /// Response deserialization failed.
    Deserialize(String),
    /// The session reached `Closed`; all of its requests fail this way.
    SessionClosed,
    /// The request was dropped before a response was delivered.
    Cancelled,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Auth(e) => write!(f, "auth handshake error: {e}"),
            Self::Protocol(s) => write!(f, "protocol violation: {s}"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<authentication::Error> for InvocationError {
    fn from(e: authentication::Error) -> Self {
        Self::Auth(e)
    }
}

impl From<tgnet_tl::deserialize::Error> for InvocationError {
    fn from(e: tgnet_tl::deserialize::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

impl InvocationError {
    /// Whether this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_suffixes() {
        let e = RpcError::from_telegram(420, "FLOOD_WAIT_30");
        assert_eq!(e.name, "FLOOD_WAIT");
        assert_eq!(e.value, Some(30));
        assert_eq!(e.flood_wait_seconds(), Some(30));
    }

    #[test]
    fn keeps_plain_names_intact() {
        let e = RpcError::from_telegram(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(e.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(e.value, None);
    }

    #[test]
    fn wildcard_matching() {
        let e = RpcError::from_telegram(400, "PHONE_CODE_INVALID");
        assert!(e.is("PHONE_CODE_INVALID"));
        assert!(e.is("PHONE_CODE_*"));
        assert!(e.is("*_INVALID"));
        assert!(!e.is("FLOOD_WAIT"));
    }

    #[test]
    fn migration_errors_carry_the_target_dc() {
        let e = RpcError::from_telegram(303, "USER_MIGRATE_5");
        assert_eq!(e.migrate_dc(), Some(5));
        assert_eq!(RpcError::from_telegram(303, "PHONE_MIGRATE_4").migrate_dc(), Some(4));
        // Wrong code or wrong prefix must not migrate.
        assert_eq!(RpcError::from_telegram(400, "USER_MIGRATE_5").migrate_dc(), None);
        assert_eq!(RpcError::from_telegram(303, "STATS_MIGRATE_3").migrate_dc(), None);
    }
}
