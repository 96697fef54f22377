//! Sans-IO MTProto protocol state.
//!
//! This crate owns the protocol rules but performs no IO:
//! * [`authentication`] — the four-step auth-key handshake as pure state
//!   transitions (send the returned request, feed the response back in)
//! * [`session`] — per-DC session bookkeeping: message-id allocation,
//!   sequence numbers, inbound-id validation, encryption of the message
//!   envelope
//! * [`plain`] — the unencrypted framing used before a key exists
//! * [`dh`] — validation of server-chosen DH primes
//!
//! The async session engine in `tgnet-client` drives these over a transport.

#![deny(unsafe_code)]

pub mod authentication;
pub mod dh;
pub mod plain;
pub mod session;

pub use dh::{CachingPrimeChecker, DhPrimeChecker};
pub use session::{DecryptedMessage, InvalidInboundMsgId, Session, UnpackError};
