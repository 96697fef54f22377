//! # tgnet-client
//!
//! The async half of tgnet: transport framing, the per-DC session engine
//! and the multi-DC client group.
//!
//! ## Layering
//!
//! | Module         | Role                                                    |
//! |----------------|---------------------------------------------------------|
//! | [`transport`]  | Intermediate / abridged / obfuscated framing over any async byte stream |
//! | [`sender`]     | One task per DC: msg-id bookkeeping, acks, containers, pings, reconnects |
//! | [`group`]      | Session pool, DC migration, flood-wait retries, the merged update stream |
//! | [`store`]      | Auth-key and DC-table persistence                        |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tgnet_client::{ClientGroup, Config, MemoryStore, TcpConnector};
//! use tgnet_tl::mtproto::GetConfig;
//!
//! # async fn run() -> Result<(), tgnet_client::InvocationError> {
//! let group = ClientGroup::new(
//!     TcpConnector,
//!     Arc::new(MemoryStore::new()),
//!     Config { api_id: 12345, api_hash: "hash".into(), ..Config::default() },
//! );
//! group.init_connection().await?;
//! let config = group.invoke(&GetConfig {}).await?;
//! println!("connected to dc {}", config.this_dc);
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod datacenter;
mod errors;
mod retry;

pub mod group;
pub mod sender;
pub mod store;
pub mod transport;

pub use datacenter::{DataCenter, DcOptions, DcType};
pub use errors::{InvocationError, RpcError, TransportError};
pub use group::{ClientGroup, Config, InitParams, UpdateStream};
pub use retry::BackoffSpec;
pub use sender::{
    spawn_session, ConnectionState, SenderConfig, SessionEvent, SessionHandle,
};
pub use store::{FileStore, MemoryStore, StoreLayout, StoredKey};
pub use transport::{Connector, Framed, TcpConnector, TransportKind};
