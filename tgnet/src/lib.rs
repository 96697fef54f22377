//! # tgnet — Telegram MTProto core
//!
//! A modular implementation of the MTProto v2 transport, session and
//! authorization layers, wired together here for convenience:
//!
//! | Sub-crate       | Role                                               |
//! |-----------------|----------------------------------------------------|
//! | `tgnet-crypto`  | AES-IGE/CTR, RSA-PAD, factorization, `AuthKey`     |
//! | `tgnet-tl`      | TL runtime + the MTProto service schema            |
//! | `tgnet-mtproto` | Sans-IO handshake and session state                |
//! | `tgnet-client`  | Async session engine, DC router, persistence       |
//!
//! The generated full API schema and the entity layer live outside this
//! workspace; they plug in through [`tl::RemoteCall`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`tgnet_tl`] — TL runtime traits and service constructors.
pub use tgnet_tl as tl;

/// Re-export of [`tgnet_mtproto`] — handshake and session state.
pub use tgnet_mtproto as mtproto;

/// Re-export of [`tgnet_crypto`] — the cryptographic primitives.
pub use tgnet_crypto as crypto;

/// Re-export of [`tgnet_client`] — the async client layer.
pub use tgnet_client as client;

pub use tgnet_client::{ClientGroup, Config, InvocationError, RpcError, SessionHandle};
pub use tgnet_crypto::AuthKey;
pub use tgnet_mtproto::authentication::{self, finish, step1, step2, step3, Finished};
pub use tgnet_tl::{Deserializable, Identifiable, RemoteCall, Serializable};
