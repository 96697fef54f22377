//! Scripted-server plumbing shared by the integration tests.
//!
//! Sessions connect through [`ScriptConnector`], which hands out
//! pre-arranged in-memory duplex pipes; [`ServerConn`] speaks the server
//! half of the protocol (intermediate framing + MTProto v2 with the
//! server-side key schedule).

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use tgnet_client::{
    Connector, DataCenter, MemoryStore, SenderConfig, StoreLayout, StoredKey, TransportKind,
};
use tgnet_crypto::{decrypt_data_v2, encrypt_data_v2, AuthKey, Side};
use tgnet_tl::mtproto as tl;
use tgnet_tl::{Identifiable, Serializable};

pub const TEST_KEY_BYTES: [u8; 256] = [0x5a; 256];
pub const TEST_SALT: i64 = 0x11223344;

pub fn test_auth_key() -> AuthKey {
    AuthKey::from_bytes(TEST_KEY_BYTES)
}

/// A store pre-seeded with the shared test key for the given DCs, so
/// sessions skip the handshake.
pub fn seeded_store(dc_ids: &[i32]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for &dc_id in dc_ids {
        store
            .save_auth_key(
                dc_id,
                false,
                &StoredKey { auth_key: TEST_KEY_BYTES, server_salt: TEST_SALT, time_offset: 0 },
            )
            .unwrap();
    }
    store
}

/// Sender config with the keepalive pushed out of the way so scripted
/// exchanges never see a surprise ping.
pub fn quiet_config() -> SenderConfig {
    SenderConfig {
        transport: TransportKind::Intermediate,
        ping_interval: std::time::Duration::from_secs(3600),
        ..SenderConfig::default()
    }
}

pub fn dc(id: i32) -> DataCenter {
    DataCenter::production(id, &format!("10.0.0.{id}:443"))
}

// ─── ScriptConnector ─────────────────────────────────────────────────────────

/// Hands out pre-arranged streams per DC id; a connect with no stream left
/// is refused.
#[derive(Default)]
pub struct ScriptConnector {
    streams: Mutex<HashMap<i32, VecDeque<DuplexStream>>>,
}

impl ScriptConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the client half of a pipe for the next connection to `dc_id`.
    pub fn add(&self, dc_id: i32, stream: DuplexStream) {
        self.streams.lock().unwrap().entry(dc_id).or_default().push_back(stream);
    }
}

impl Connector for ScriptConnector {
    type Stream = DuplexStream;

    fn connect(
        &self,
        dc: &DataCenter,
    ) -> impl std::future::Future<Output = io::Result<Self::Stream>> + Send {
        let stream = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&dc.id)
            .and_then(|queue| queue.pop_front());
        async move {
            stream.ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted stream left")
            })
        }
    }
}

// ─── ServerConn ──────────────────────────────────────────────────────────────

/// One decrypted client message (containers and gzip already unwrapped).
#[derive(Debug)]
pub struct ClientMsg {
    pub msg_id: i64,
    pub seqno: i32,
    pub body: Vec<u8>,
    /// The body arrived inside a `gzip_packed` wrapper.
    pub gzipped: bool,
}

impl ClientMsg {
    pub fn constructor_id(&self) -> u32 {
        u32::from_le_bytes(self.body[..4].try_into().unwrap())
    }
}

/// The server half of a scripted connection.
pub struct ServerConn {
    io: DuplexStream,
    key: AuthKey,
    pub session_id: i64,
    salt: i64,
    msg_counter: u32,
    seq: i32,
    init_consumed: bool,
}

impl ServerConn {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            key: test_auth_key(),
            session_id: 0,
            salt: TEST_SALT,
            msg_counter: 0,
            seq: 0,
            init_consumed: false,
        }
    }

    async fn recv_raw(&mut self) -> Vec<u8> {
        if !self.init_consumed {
            let mut init = [0u8; 4];
            self.io.read_exact(&mut init).await.unwrap();
            assert_eq!(init, [0xee; 4], "client must announce intermediate transport");
            self.init_consumed = true;
        }
        let mut len = [0u8; 4];
        self.io.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        self.io.read_exact(&mut payload).await.unwrap();
        payload
    }

    /// Receive one frame and return its messages, with `msg_container` and
    /// `gzip_packed` transparently unwrapped.
    pub async fn recv_messages(&mut self) -> Vec<ClientMsg> {
        let frame = self.recv_raw().await;
        let plain = decrypt_data_v2(&frame, &self.key, Side::Client).expect("client frame");

        // Envelope salt must match what the client believes.
        let salt = i64::from_le_bytes(plain[..8].try_into().unwrap());
        assert_eq!(salt, self.salt, "client sent a stale salt");
        self.session_id = i64::from_le_bytes(plain[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
        let seqno = i32::from_le_bytes(plain[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        let body = plain[32..32 + body_len].to_vec();

        let mut out = Vec::new();
        flatten(msg_id, seqno, body, false, &mut out);
        out
    }

    /// Like [`ServerConn::recv_messages`] but drops `msgs_ack` entries.
    pub async fn recv_requests(&mut self) -> Vec<ClientMsg> {
        self.recv_messages()
            .await
            .into_iter()
            .filter(|m| m.constructor_id() != tl::MsgsAck::CONSTRUCTOR_ID)
            .collect()
    }

    /// Change the salt future client messages must carry.
    pub fn expect_salt(&mut self, salt: i64) {
        self.salt = salt;
    }

    fn next_msg_id_at(&mut self, server_secs: i64) -> i64 {
        self.msg_counter += 1;
        (server_secs << 32) | ((self.msg_counter as i64) << 2) | 1
    }

    /// Encrypt and send one server message; returns its msg id.
    pub async fn send_body_at(&mut self, server_secs: i64, body: &[u8], content: bool) -> i64 {
        assert_ne!(self.session_id, 0, "server learns the session id from the client");
        let msg_id = self.next_msg_id_at(server_secs);
        let seqno = if content {
            let s = self.seq * 2 + 1;
            self.seq += 1;
            s
        } else {
            self.seq * 2
        };

        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend_from_slice(&self.salt.to_le_bytes());
        plain.extend_from_slice(&self.session_id.to_le_bytes());
        plain.extend_from_slice(&msg_id.to_le_bytes());
        plain.extend_from_slice(&seqno.to_le_bytes());
        plain.extend_from_slice(&(body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);

        let wire = encrypt_data_v2(&plain, &self.key, Side::Server);
        self.io.write_all(&(wire.len() as u32).to_le_bytes()).await.unwrap();
        self.io.write_all(&wire).await.unwrap();
        msg_id
    }

    pub async fn send_body(&mut self, body: &[u8], content: bool) -> i64 {
        self.send_body_at(now_secs(), body, content).await
    }

    pub async fn send_rpc_result(&mut self, req_msg_id: i64, result: &[u8]) -> i64 {
        let body = tl::RpcResult { req_msg_id, result: result.to_vec() }.to_bytes();
        self.send_body(&body, true).await
    }

    pub async fn send_rpc_error(&mut self, req_msg_id: i64, code: i32, message: &str) -> i64 {
        let error =
            tl::RpcError { error_code: code, error_message: message.to_string() }.to_bytes();
        self.send_rpc_result(req_msg_id, &error).await
    }
}

fn flatten(msg_id: i64, seqno: i32, body: Vec<u8>, gzipped: bool, out: &mut Vec<ClientMsg>) {
    let cid = u32::from_le_bytes(body[..4].try_into().unwrap());
    if cid == tl::MsgContainer::CONSTRUCTOR_ID {
        let container = <tl::MsgContainer as tgnet_tl::Deserializable>::from_bytes(&body).unwrap();
        for inner in container.messages {
            flatten(inner.msg_id, inner.seqno, inner.body, gzipped, out);
        }
    } else if cid == tl::GzipPacked::CONSTRUCTOR_ID {
        let packed = <tl::GzipPacked as tgnet_tl::Deserializable>::from_bytes(&body).unwrap();
        let mut inflated = Vec::new();
        use std::io::Read;
        flate2::read::GzDecoder::new(packed.packed_data.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        flatten(msg_id, seqno, inflated, true, out);
    } else {
        out.push(ClientMsg { msg_id, seqno, body, gzipped });
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// A config answer naming the given regular DCs.
pub fn config_with_dcs(ids: &[i32]) -> Vec<u8> {
    tl::Config {
        test_mode: false,
        this_dc: 2,
        dc_options: ids
            .iter()
            .map(|&id| tl::DcOption {
                flags: 0,
                id,
                ip_address: format!("10.0.0.{id}"),
                port: 443,
            })
            .collect(),
    }
    .to_bytes()
}

/// A config answer naming DCs 2 and 5.
pub fn sample_config() -> Vec<u8> {
    config_with_dcs(&[2, 5])
}
