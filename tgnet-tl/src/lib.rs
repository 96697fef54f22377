//! TL runtime for the tgnet MTProto core.
//!
//! The full Telegram API schema is generated elsewhere and out of scope here;
//! this crate carries the pieces the transport core itself must speak:
//!
//! | Module          | Contents                                               |
//! |-----------------|--------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] + primitive impls                     |
//! | [`deserialize`] | [`Deserializable`], [`Cursor`] + primitive impls       |
//! | [`mtproto`]     | Hand-written handshake and service-message constructors |
//!
//! Higher layers plug their generated schema in through the same three
//! traits ([`Identifiable`], [`Serializable`], [`Deserializable`]) plus
//! [`RemoteCall`] for functions.

#![deny(unsafe_code)]

pub mod deserialize;
pub mod mtproto;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// The API layer the client announces in `invokeWithLayer`.
pub const LAYER: i32 = 158;

/// Bare `vector` — a length-prefixed list without the boxed `Vector`
/// constructor header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Every TL constructor has a unique 32-bit id.
pub trait Identifiable {
    /// The constructor id as declared in the schema.
    const CONSTRUCTOR_ID: u32;
}

/// A function that can be sent to the server as an RPC call.
///
/// `Return` is the type the server responds with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
