//! Hand-written MTProto service schema.
//!
//! These are the constructors the transport core itself exchanges with a
//! datacenter: the auth-key handshake, the service-message envelope
//! (containers, acks, pings, bad-msg notifications, gzip) and a minimal
//! sketch of `help.getConfig` for the DC router. The full API schema is
//! generated elsewhere and plugs in through the same traits.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Deserializable, Identifiable, RemoteCall, Serializable};

/// Declares a plain fixed-field constructor: struct, [`Identifiable`],
/// [`Serializable`] and [`Deserializable`], plus a `deserialize_fields`
/// reader used by boxed-enum dispatch.
macro_rules! constructor {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( pub $field: $ty, )*
        }

        impl Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                Self::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )*
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                if id != Self::CONSTRUCTOR_ID {
                    return Err(Error::UnexpectedConstructor { id });
                }
                Self::deserialize_fields(buf)
            }
        }

        impl $name {
            /// Read the fields only; the constructor id was already consumed.
            pub fn deserialize_fields(buf: Buffer) -> Result<Self> {
                #[allow(unused_variables)]
                let buf = buf;
                Ok(Self {
                    $( $field: <$ty as Deserializable>::deserialize(buf)?, )*
                })
            }
        }
    };
}

// ─── Auth-key handshake ──────────────────────────────────────────────────────

constructor! {
    /// `req_pq_multi#be7e8ef1` — opens the handshake.
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] }
}

constructor! {
    /// `resPQ#05162463` — the server's factorization challenge.
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

constructor! {
    /// `p_q_inner_data_dc#a9f55f95` — RSA-encrypted proof of work.
    PQInnerDataDc = 0xa9f55f95 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
    }
}

constructor! {
    /// `req_DH_params#d712e4be`.
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
}

constructor! {
    /// `server_DH_params_ok#d0e8075c`.
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

constructor! {
    /// `server_DH_params_fail#79cb045d`.
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

/// Boxed `Server_DH_Params`.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerDhParams {
    Ok(ServerDhParamsOk),
    Fail(ServerDhParamsFail),
}

impl Serializable for ServerDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::Ok(x) => x.serialize(buf),
            Self::Fail(x) => x.serialize(buf),
        }
    }
}

impl Deserializable for ServerDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id == ServerDhParamsOk::CONSTRUCTOR_ID {
            Ok(Self::Ok(ServerDhParamsOk::deserialize_fields(buf)?))
        } else if id == ServerDhParamsFail::CONSTRUCTOR_ID {
            Ok(Self::Fail(ServerDhParamsFail::deserialize_fields(buf)?))
        } else {
            Err(Error::UnexpectedConstructor { id })
        }
    }
}

constructor! {
    /// `server_DH_inner_data#b5890dba` — decrypted from `encrypted_answer`.
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

constructor! {
    /// `client_DH_inner_data#6643b654`.
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

constructor! {
    /// `set_client_DH_params#f5045f1f`.
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
}

constructor! {
    /// `dh_gen_ok#3bcbf734`.
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

constructor! {
    /// `dh_gen_retry#46dc1fb9`.
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

constructor! {
    /// `dh_gen_fail#a69dae02`.
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

/// Boxed `Set_client_DH_params_answer`.
#[derive(Clone, Debug, PartialEq)]
pub enum DhGen {
    Ok(DhGenOk),
    Retry(DhGenRetry),
    Fail(DhGenFail),
}

impl Serializable for DhGen {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::Ok(x) => x.serialize(buf),
            Self::Retry(x) => x.serialize(buf),
            Self::Fail(x) => x.serialize(buf),
        }
    }
}

impl Deserializable for DhGen {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id == DhGenOk::CONSTRUCTOR_ID {
            Ok(Self::Ok(DhGenOk::deserialize_fields(buf)?))
        } else if id == DhGenRetry::CONSTRUCTOR_ID {
            Ok(Self::Retry(DhGenRetry::deserialize_fields(buf)?))
        } else if id == DhGenFail::CONSTRUCTOR_ID {
            Ok(Self::Fail(DhGenFail::deserialize_fields(buf)?))
        } else {
            Err(Error::UnexpectedConstructor { id })
        }
    }
}

impl RemoteCall for ReqPqMulti {
    type Return = ResPq;
}
impl RemoteCall for ReqDhParams {
    type Return = ServerDhParams;
}
impl RemoteCall for SetClientDhParams {
    type Return = DhGen;
}

// ─── Service messages ────────────────────────────────────────────────────────

constructor! {
    /// `msgs_ack#62d6b459`.
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
}

constructor! {
    /// `ping#7abe77ec`.
    Ping = 0x7abe77ec { ping_id: i64 }
}

constructor! {
    /// `ping_delay_disconnect#f3427b8c` — ping that re-arms the server's
    /// disconnect timer.
    PingDelayDisconnect = 0xf3427b8c { ping_id: i64, disconnect_delay: i32 }
}

constructor! {
    /// `pong#347773c5`.
    Pong = 0x347773c5 { msg_id: i64, ping_id: i64 }
}

constructor! {
    /// `bad_server_salt#edab447b`.
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

constructor! {
    /// `bad_msg_notification#a7eff811`.
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

constructor! {
    /// `new_session_created#9ec20908`.
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

constructor! {
    /// `msgs_state_req#da69fb52`.
    MsgsStateReq = 0xda69fb52 { msg_ids: Vec<i64> }
}

constructor! {
    /// `msg_resend_req#7d861a08`.
    MsgResendReq = 0x7d861a08 { msg_ids: Vec<i64> }
}

constructor! {
    /// `destroy_session#e7512126`.
    DestroySession = 0xe7512126 { session_id: i64 }
}

constructor! {
    /// `rpc_error#2144ca19`.
    RpcError = 0x2144ca19 { error_code: i32, error_message: String }
}

constructor! {
    /// `gzip_packed#3072cfa1`.
    GzipPacked = 0x3072cfa1 { packed_data: Vec<u8> }
}

impl RemoteCall for Ping {
    type Return = Pong;
}
impl RemoteCall for PingDelayDisconnect {
    type Return = Pong;
}

// ─── rpc_result / containers (raw-tail constructors) ─────────────────────────

/// `rpc_result#f35c6d01` — the result bytes are whatever follows the
/// request id, with no length prefix of their own.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult {
    pub req_msg_id: i64,
    pub result: Vec<u8>,
}

impl Identifiable for RpcResult {
    const CONSTRUCTOR_ID: u32 = 0xf35c6d01;
}

impl Serializable for RpcResult {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
        buf.extend(self.result.iter().copied());
    }
}

impl Deserializable for RpcResult {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        Self::deserialize_fields(buf)
    }
}

impl RpcResult {
    pub fn deserialize_fields(buf: Buffer) -> Result<Self> {
        let req_msg_id = i64::deserialize(buf)?;
        let mut result = Vec::with_capacity(buf.remaining());
        buf.read_to_end(&mut result);
        Ok(Self { req_msg_id, result })
    }
}

/// One entry of a container: a full message header plus its raw body.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerMessage {
    pub msg_id: i64,
    pub seqno: i32,
    pub body: Vec<u8>,
}

impl Serializable for ContainerMessage {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.msg_id.serialize(buf);
        self.seqno.serialize(buf);
        (self.body.len() as i32).serialize(buf);
        buf.extend(self.body.iter().copied());
    }
}

impl Deserializable for ContainerMessage {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let msg_id = i64::deserialize(buf)?;
        let seqno = i32::deserialize(buf)?;
        let len = i32::deserialize(buf)? as usize;
        let mut body = vec![0u8; len];
        buf.read_exact(&mut body)?;
        Ok(Self { msg_id, seqno, body })
    }
}

/// `msg_container#73f1f8dc` — a batch of messages sharing one envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgContainer {
    pub messages: Vec<ContainerMessage>,
}

impl Identifiable for MsgContainer {
    const CONSTRUCTOR_ID: u32 = 0x73f1f8dc;
}

impl Serializable for MsgContainer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        (self.messages.len() as i32).serialize(buf);
        for m in &self.messages {
            m.serialize(buf);
        }
    }
}

impl Deserializable for MsgContainer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        Self::deserialize_fields(buf)
    }
}

impl MsgContainer {
    pub fn deserialize_fields(buf: Buffer) -> Result<Self> {
        let count = i32::deserialize(buf)? as usize;
        let messages = (0..count)
            .map(|_| ContainerMessage::deserialize(buf))
            .collect::<Result<_>>()?;
        Ok(Self { messages })
    }
}

/// `msg_copy#e06046b2` — a forwarded copy of a complete message.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgCopy {
    pub orig_message: ContainerMessage,
}

impl Identifiable for MsgCopy {
    const CONSTRUCTOR_ID: u32 = 0xe06046b2;
}

impl Serializable for MsgCopy {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.orig_message.serialize(buf);
    }
}

impl Deserializable for MsgCopy {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        Ok(Self { orig_message: ContainerMessage::deserialize(buf)? })
    }
}

// ─── help.getConfig sketch ───────────────────────────────────────────────────

constructor! {
    /// `dcOption#18b7a10d` — the subset of flags the router inspects.
    DcOption = 0x18b7a10d {
        flags: u32,
        id: i32,
        ip_address: String,
        port: i32,
    }
}

impl DcOption {
    pub fn ipv6(&self) -> bool {
        self.flags & (1 << 0) != 0
    }
    pub fn media_only(&self) -> bool {
        self.flags & (1 << 1) != 0
    }
    pub fn tcpo_only(&self) -> bool {
        self.flags & (1 << 2) != 0
    }
    pub fn cdn(&self) -> bool {
        self.flags & (1 << 3) != 0
    }
}

constructor! {
    /// `config#cc1a241e` — sketch of the fields the DC router consumes.
    /// The real constructor carries many more; the generated schema owns it.
    Config = 0xcc1a241e {
        test_mode: bool,
        this_dc: i32,
        dc_options: Vec<DcOption>,
    }
}

constructor! {
    /// `help.getConfig#c4f9186b`.
    GetConfig = 0xc4f9186b {}
}

impl RemoteCall for GetConfig {
    type Return = Config;
}

// ─── Generic wrappers ────────────────────────────────────────────────────────

/// `invokeWithLayer#da9b0d0d` around an already-serialized inner query.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeWithLayer {
    pub layer: i32,
    pub query: Vec<u8>,
}

impl Identifiable for InvokeWithLayer {
    const CONSTRUCTOR_ID: u32 = 0xda9b0d0d;
}

impl Serializable for InvokeWithLayer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.layer.serialize(buf);
        buf.extend(self.query.iter().copied());
    }
}

/// `initConnection#c1cd5ea9` around an already-serialized inner query.
///
/// `proxy` and `params` are pre-serialized blobs of their respective types;
/// the flags word is derived from their presence.
#[derive(Clone, Debug, PartialEq)]
pub struct InitConnection {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    pub proxy: Option<Vec<u8>>,
    pub params: Option<Vec<u8>>,
    pub query: Vec<u8>,
}

impl Identifiable for InitConnection {
    const CONSTRUCTOR_ID: u32 = 0xc1cd5ea9;
}

impl Serializable for InitConnection {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        let mut flags = 0u32;
        if self.proxy.is_some() {
            flags |= 1 << 0;
        }
        if self.params.is_some() {
            flags |= 1 << 1;
        }
        flags.serialize(buf);
        self.api_id.serialize(buf);
        self.device_model.serialize(buf);
        self.system_version.serialize(buf);
        self.app_version.serialize(buf);
        self.system_lang_code.serialize(buf);
        self.lang_pack.serialize(buf);
        self.lang_code.serialize(buf);
        if let Some(proxy) = &self.proxy {
            buf.extend(proxy.iter().copied());
        }
        if let Some(params) = &self.params {
            buf.extend(params.iter().copied());
        }
        buf.extend(self.query.iter().copied());
    }
}
