//! The per-DC session engine.
//!
//! Each session is one task owning the framed connection and all session
//! state; submissions arrive over a command channel and complete through
//! per-request oneshots. There is no shared mutable state between sessions.
//!
//! The task multiplexes four things: inbound frames, outbound submissions,
//! the keepalive timer, and the pong deadline. Reconnection (with pending
//! requests carried over) happens inside the task under the configured
//! backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use tgnet_crypto::rsa::RsaKeyRegister;
use tgnet_crypto::AuthKey;
use tgnet_mtproto::authentication as auth;
use tgnet_mtproto::dh::DhPrimeChecker;
use tgnet_mtproto::plain::{self, PlainSession};
use tgnet_mtproto::session::{InvalidInboundMsgId, Session, UnpackError};
use tgnet_tl::mtproto as tl;
use tgnet_tl::{Deserializable, Serializable};

use crate::datacenter::DataCenter;
use crate::errors::{InvocationError, RpcError, TransportError};
use crate::retry::BackoffSpec;
use crate::store::{StoreLayout, StoredKey};
use crate::transport::{Connector, Framed, TransportKind};

// ─── MTProto envelope constructor ids ────────────────────────────────────────

const ID_MSG_CONTAINER: u32 = 0x73f1f8dc;
const ID_MSG_COPY: u32 = 0xe06046b2;
const ID_GZIP_PACKED: u32 = 0x3072cfa1;
const ID_RPC_RESULT: u32 = 0xf35c6d01;
const ID_RPC_ERROR: u32 = 0x2144ca19;
const ID_BAD_SERVER_SALT: u32 = 0xedab447b;
const ID_BAD_MSG_NOTIFY: u32 = 0xa7eff811;
const ID_NEW_SESSION: u32 = 0x9ec20908;
const ID_MSGS_ACK: u32 = 0x62d6b459;
const ID_PONG: u32 = 0x347773c5;
const ID_PING: u32 = 0x7abe77ec;
const ID_PING_DELAY_DISCONNECT: u32 = 0xf3427b8c;
const ID_MSGS_STATE_REQ: u32 = 0xda69fb52;
const ID_MSG_RESEND_REQ: u32 = 0x7d861a08;

// ─── Public surface ──────────────────────────────────────────────────────────

/// Where a session currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authorized,
    Unauthorized,
    Closed,
}

/// Non-RPC traffic surfaced to higher layers.
#[derive(Debug)]
pub enum SessionEvent {
    /// A content-related message that is not a reply to anything we sent
    /// (updates, in the full client). Raw TL bytes.
    Update(Vec<u8>),
    /// The server opened a new session; higher layers may have missed
    /// messages and should resynchronize.
    Reset,
}

/// Tuning knobs for the session engine.
#[derive(Clone)]
pub struct SenderConfig {
    pub transport: TransportKind,
    /// Bodies above this many bytes are wrapped in `gzip_packed`.
    pub gzip_threshold: usize,
    pub connection_retry: BackoffSpec,
    pub auth_retry: BackoffSpec,
    /// Outbound idleness before a keepalive ping goes out.
    pub ping_interval: Duration,
    /// `disconnect_delay` carried by the keepalive ping, in seconds.
    pub ping_disconnect_delay: i32,
    /// How long an unanswered keepalive may stay unanswered.
    pub pong_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            gzip_threshold: 16 * 1024,
            connection_retry: BackoffSpec::connection_default(),
            auth_retry: BackoffSpec::auth_default(),
            ping_interval: Duration::from_secs(60),
            ping_disconnect_delay: 75,
            pong_timeout: Duration::from_secs(30),
        }
    }
}

/// Correlates a caller-side future with its slot in the pending table, so a
/// cancel can find the entry even after requeues changed the msg id.
static NEXT_REQUEST_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_request_token() -> u64 {
    NEXT_REQUEST_TOKEN.fetch_add(1, Ordering::Relaxed)
}

struct Request {
    /// Caller token; 0 for internal service sends that expect no reply.
    token: u64,
    body: Vec<u8>,
    expects_reply: bool,
    tx: Option<oneshot::Sender<Result<Vec<u8>, InvocationError>>>,
}

enum Command {
    Invoke(Request),
    Cancel(u64),
    Close,
}

/// Withdraws the request if the caller's future is dropped mid-await.
struct CancelOnDrop<'a> {
    commands: &'a mpsc::Sender<Command>,
    token: Option<u64>,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            let _ = self.commands.try_send(Command::Cancel(token));
        }
    }
}

/// Cheap handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    dc: DataCenter,
}

impl SessionHandle {
    /// Submit a TL-serialized request and await its raw reply bytes.
    ///
    /// Dropping the returned future cancels the request: its pending entry
    /// is removed and any late server response is discarded.
    pub async fn invoke_raw(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        let token = next_request_token();
        let (tx, rx) = oneshot::channel();
        let request = Request { token, body, expects_reply: true, tx: Some(tx) };
        self.commands
            .send(Command::Invoke(request))
            .await
            .map_err(|_| InvocationError::SessionClosed)?;

        let mut guard = CancelOnDrop { commands: &self.commands, token: Some(token) };
        let outcome = rx.await;
        guard.token = None;
        outcome.map_err(|_| InvocationError::Cancelled)?
    }

    /// Ask the session to shut down. Pending requests fail with
    /// `SessionClosed`; observe [`SessionHandle::state`] for completion.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    /// Watch the session lifecycle.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn dc(&self) -> &DataCenter {
        &self.dc
    }
}

/// Spawn the session task for `dc` and return its handle.
pub fn spawn_session<C: Connector>(
    connector: Arc<C>,
    dc: DataCenter,
    store: Arc<dyn StoreLayout>,
    keys: Arc<RsaKeyRegister>,
    checker: Arc<dyn DhPrimeChecker>,
    updates: mpsc::Sender<SessionEvent>,
    config: SenderConfig,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let sender = Sender {
        connector,
        dc: dc.clone(),
        store,
        keys,
        checker,
        commands: cmd_rx,
        updates,
        state: state_tx,
        config,
        pending: HashMap::new(),
    };
    tokio::spawn(sender.run());

    SessionHandle { commands: cmd_tx, state: state_rx, dc }
}

// ─── Engine internals ────────────────────────────────────────────────────────

struct Pending {
    token: u64,
    body: Vec<u8>,
    tx: Option<oneshot::Sender<Result<Vec<u8>, InvocationError>>>,
    /// Server confirmed receipt via `msgs_ack` (not yet answered).
    acked: bool,
}

/// Why the drive loop stopped using the current connection.
enum Exit {
    Closed,
    Reconnect,
    AuthKeyInvalid,
}

/// Per-connection state; rebuilt on every reconnect.
struct Conn<S> {
    framed: Framed<S>,
    session: Session,
    ack_buffer: Vec<i64>,
    /// Outbound container id → reply-expecting children, so a server
    /// complaint about the container requeues the actual requests.
    container_children: HashMap<i64, Vec<i64>>,
    /// Outstanding keepalive ping ids.
    ping_ids: Vec<i64>,
    ping_deadline: Option<Instant>,
    last_send: Instant,
}

/// Side effects collected while walking one inbound message tree.
#[derive(Default)]
struct Effects {
    replies: Vec<Vec<u8>>,
    requeues: Vec<i64>,
    events: Vec<SessionEvent>,
    violation: Option<String>,
    auth_invalid: bool,
}

struct Sender<C: Connector> {
    connector: Arc<C>,
    dc: DataCenter,
    store: Arc<dyn StoreLayout>,
    keys: Arc<RsaKeyRegister>,
    checker: Arc<dyn DhPrimeChecker>,
    commands: mpsc::Receiver<Command>,
    updates: mpsc::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    config: SenderConfig,
    pending: HashMap<i64, Pending>,
}

impl<C: Connector> Sender<C> {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            match self.connect().await {
                Ok(mut conn) => {
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Authorized);
                    match self.drive(&mut conn).await {
                        Exit::Closed => {
                            self.shutdown();
                            return;
                        }
                        Exit::Reconnect => {
                            log::info!("[dc {}] reconnecting", self.dc.id);
                        }
                        Exit::AuthKeyInvalid => {
                            log::warn!(
                                "[dc {}] auth key rejected; renegotiating",
                                self.dc.id
                            );
                            self.state.send_replace(ConnectionState::Unauthorized);
                            let _ = self.store.delete_auth_key(self.dc.id, self.dc.test);
                        }
                    }
                }
                Err(e) => {
                    if matches!(e, InvocationError::Auth(_)) {
                        log::warn!("[dc {}] handshake failed for good: {e}", self.dc.id);
                        self.shutdown();
                        return;
                    }
                    log::warn!("[dc {}] connect failed: {e}", self.dc.id);
                    attempt += 1;
                    match self.config.connection_retry.next(attempt) {
                        Some(delay) => {
                            if self.sleep_or_close(delay).await {
                                self.shutdown();
                                return;
                            }
                        }
                        None => {
                            self.shutdown();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleep for `delay`, returning `true` if a close arrived meanwhile.
    async fn sleep_or_close(&mut self, delay: Duration) -> bool {
        tokio::select! {
            cmd = self.commands.recv() => match cmd {
                None | Some(Command::Close) => true,
                Some(Command::Invoke(req)) => {
                    // Park it; the reconnect loop resubmits pending requests.
                    if req.expects_reply {
                        // A placeholder id below any real msg id.
                        let key = -(self.pending.len() as i64) - 1;
                        self.pending.insert(
                            key,
                            Pending { token: req.token, body: req.body, tx: req.tx, acked: false },
                        );
                    }
                    false
                }
                Some(Command::Cancel(token)) => {
                    self.cancel_request(token);
                    false
                }
            },
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Drop the pending entry the caller abandoned; nothing is sent to the
    /// server, a response that still arrives is discarded as unknown.
    fn cancel_request(&mut self, token: u64) {
        let id = self
            .pending
            .iter()
            .find_map(|(id, p)| (p.token == token).then_some(*id));
        if let Some(id) = id {
            self.pending.remove(&id);
            log::debug!("[dc {}] request cancelled (msg {id})", self.dc.id);
        }
    }

    fn shutdown(&mut self) {
        for (_, mut p) in self.pending.drain() {
            if let Some(tx) = p.tx.take() {
                let _ = tx.send(Err(InvocationError::SessionClosed));
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    // ── Connection setup ───────────────────────────────────────────────────

    async fn connect(&mut self) -> Result<Conn<C::Stream>, InvocationError> {
        let stream = self.connector.connect(&self.dc).await?;
        let mut framed = Framed::new(stream, &self.config.transport);

        let session = match self.store.auth_key(self.dc.id, self.dc.test)? {
            Some(stored) => {
                log::debug!("[dc {}] reusing stored auth key", self.dc.id);
                Session::new(
                    AuthKey::from_bytes(stored.auth_key),
                    stored.server_salt,
                    stored.time_offset,
                )
            }
            None => {
                self.state.send_replace(ConnectionState::Handshaking);
                let done = self.negotiate(&mut framed).await?;
                self.store.save_auth_key(
                    self.dc.id,
                    self.dc.test,
                    &StoredKey {
                        auth_key: done.auth_key,
                        server_salt: done.first_salt,
                        time_offset: done.time_offset,
                    },
                )?;
                Session::new(AuthKey::from_bytes(done.auth_key), done.first_salt, done.time_offset)
            }
        };

        Ok(Conn {
            framed,
            session,
            ack_buffer: Vec::new(),
            container_children: HashMap::new(),
            ping_ids: Vec::new(),
            ping_deadline: None,
            last_send: Instant::now(),
        })
    }

    /// Run the handshake under the auth retry budget. Nonce mismatches are
    /// never retried.
    async fn negotiate(
        &self,
        framed: &mut Framed<C::Stream>,
    ) -> Result<auth::Finished, InvocationError> {
        let mut attempt = 0u32;
        loop {
            match self.handshake_once(framed).await {
                Ok(done) => return Ok(done),
                Err(e) => {
                    let retryable = matches!(
                        &e,
                        InvocationError::Auth(err) if !matches!(
                            err,
                            auth::Error::InvalidNonce { .. }
                                | auth::Error::InvalidServerNonce { .. }
                                | auth::Error::InvalidNewNonceHash
                        )
                    );
                    if !retryable {
                        return Err(e);
                    }
                    attempt += 1;
                    match self.config.auth_retry.next(attempt) {
                        Some(delay) => {
                            log::warn!("[dc {}] handshake attempt failed: {e}", self.dc.id);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }

    async fn handshake_once(
        &self,
        framed: &mut Framed<C::Stream>,
    ) -> Result<auth::Finished, InvocationError> {
        let mut plain_session = PlainSession::new();

        let (req1, s1) = auth::step1();
        framed.send(&plain_session.pack(&req1.to_bytes())).await?;
        let frame = framed.recv().await?;
        let res_pq = tl::ResPq::from_bytes(unpack_plain(&frame)?)?;

        // Test datacenters are addressed as 10000 + id in the inner data.
        let dc_id = if self.dc.test { self.dc.id + 10_000 } else { self.dc.id };
        let (req2, s2) = auth::step2(&self.keys, s1, res_pq, dc_id)?;
        framed.send(&plain_session.pack(&req2.to_bytes())).await?;
        let frame = framed.recv().await?;
        let dh_params = tl::ServerDhParams::from_bytes(unpack_plain(&frame)?)?;

        let (req3, s3) = auth::step3(self.checker.as_ref(), s2, dh_params)?;
        framed.send(&plain_session.pack(&req3.to_bytes())).await?;
        let frame = framed.recv().await?;
        let answer = tl::DhGen::from_bytes(unpack_plain(&frame)?)?;

        let done = auth::finish(s3, answer)?;
        log::info!("[dc {}] auth key negotiated", self.dc.id);
        Ok(done)
    }

    // ── Drive loop ─────────────────────────────────────────────────────────

    async fn drive(&mut self, conn: &mut Conn<C::Stream>) -> Exit {
        // Resubmit whatever was in flight before the reconnect.
        let inflight: Vec<i64> = self.pending.keys().copied().collect();
        for id in inflight {
            if let Some(p) = self.pending.remove(&id) {
                if p.acked {
                    log::debug!("[dc {}] resubmitting acknowledged msg {id}", self.dc.id);
                }
                let req =
                    Request { token: p.token, body: p.body, expects_reply: true, tx: p.tx };
                if let Err(exit) = self.transmit(conn, req).await {
                    return exit;
                }
            }
        }

        loop {
            let ping_at = conn.last_send + self.config.ping_interval;
            let pong_deadline = conn
                .ping_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => return Exit::Closed,
                    Some(Command::Invoke(req)) => {
                        if let Err(exit) = self.transmit(conn, req).await {
                            return exit;
                        }
                    }
                    Some(Command::Cancel(token)) => self.cancel_request(token),
                },
                frame = conn.framed.recv() => match frame {
                    Ok(frame) => {
                        if let Err(exit) = self.handle_frame(conn, &frame).await {
                            return exit;
                        }
                    }
                    Err(e) if e.is_auth_key_invalid() => return Exit::AuthKeyInvalid,
                    Err(e) => {
                        log::warn!("[dc {}] transport error: {e}", self.dc.id);
                        return Exit::Reconnect;
                    }
                },
                _ = sleep_until(ping_at) => {
                    if let Err(exit) = self.send_keepalive(conn).await {
                        return exit;
                    }
                }
                _ = sleep_until(pong_deadline), if conn.ping_deadline.is_some() => {
                    if conn.ping_ids.len() >= 2 {
                        log::warn!(
                            "[dc {}] {} keepalives unanswered; dropping connection",
                            self.dc.id,
                            conn.ping_ids.len()
                        );
                        return Exit::Reconnect;
                    }
                    if let Err(exit) = self.send_keepalive(conn).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn send_keepalive(&mut self, conn: &mut Conn<C::Stream>) -> Result<(), Exit> {
        let ping_id = random_i64();
        let body = tl::PingDelayDisconnect {
            ping_id,
            disconnect_delay: self.config.ping_disconnect_delay,
        }
        .to_bytes();
        conn.ping_ids.push(ping_id);
        conn.ping_deadline = Some(Instant::now() + self.config.pong_timeout);
        self.transmit(conn, Request { token: 0, body, expects_reply: false, tx: None }).await
    }

    /// Serialize, possibly gzip, possibly wrap with pending acks, encrypt
    /// and send one request.
    async fn transmit(&mut self, conn: &mut Conn<C::Stream>, req: Request) -> Result<(), Exit> {
        let mut body = req.body.clone();
        let content_related = is_content_related(&body);
        if body.len() > self.config.gzip_threshold {
            body = tl::GzipPacked { packed_data: gzip_compress(&body) }.to_bytes();
        }

        let msg_id = conn.session.next_msg_id();
        let seq_no = conn.session.next_seq_no(content_related);

        let wire = if conn.ack_buffer.is_empty() {
            conn.session.pack(msg_id, seq_no, &body)
        } else {
            let acks = tl::MsgsAck { msg_ids: std::mem::take(&mut conn.ack_buffer) }.to_bytes();
            let ack_id = conn.session.next_msg_id();
            let ack_seq = conn.session.next_seq_no(false);
            let container = tl::MsgContainer {
                messages: vec![
                    tl::ContainerMessage { msg_id, seqno: seq_no, body },
                    tl::ContainerMessage { msg_id: ack_id, seqno: ack_seq, body: acks },
                ],
            };
            let container_id = conn.session.next_msg_id();
            let container_seq = conn.session.next_seq_no(false);
            if req.expects_reply {
                conn.container_children.insert(container_id, vec![msg_id]);
            }
            conn.session.pack(container_id, container_seq, &container.to_bytes())
        };

        if req.expects_reply {
            self.pending.insert(
                msg_id,
                Pending { token: req.token, body: req.body, tx: req.tx, acked: false },
            );
        }

        match conn.framed.send(&wire).await {
            Ok(()) => {
                conn.last_send = Instant::now();
                Ok(())
            }
            Err(e) if e.is_auth_key_invalid() => Err(Exit::AuthKeyInvalid),
            Err(e) => {
                // The pending entry stays and is resubmitted after reconnect.
                log::warn!("[dc {}] send failed: {e}", self.dc.id);
                Err(Exit::Reconnect)
            }
        }
    }

    // ── Inbound ────────────────────────────────────────────────────────────

    async fn handle_frame(
        &mut self,
        conn: &mut Conn<C::Stream>,
        frame: &[u8],
    ) -> Result<(), Exit> {
        let msg = match conn.session.unpack(frame) {
            Ok(msg) => msg,
            Err(UnpackError::RetiredSession) => return Ok(()),
            Err(e) => {
                log::warn!("[dc {}] {e}; dropping connection", self.dc.id);
                return Err(Exit::Reconnect);
            }
        };

        match conn.session.is_valid_inbound_msg_id(msg.msg_id) {
            None => {}
            Some(InvalidInboundMsgId::Duplicate) => return Ok(()),
            Some(reason) => {
                log::warn!("[dc {}] bad inbound msg id ({reason:?})", self.dc.id);
                return Err(Exit::Reconnect);
            }
        }

        if msg.seq_no & 1 == 1 {
            conn.ack_buffer.push(msg.msg_id);
        }

        let mut fx = Effects::default();
        self.process(conn, msg.msg_id, msg.salt, &msg.body, &mut fx);
        self.apply(conn, fx).await
    }

    /// Walk one message tree, collecting side effects. Pure parsing plus
    /// synchronous state updates; all IO happens afterwards in [`apply`].
    fn process(
        &mut self,
        conn: &mut Conn<C::Stream>,
        msg_id: i64,
        envelope_salt: i64,
        body: &[u8],
        fx: &mut Effects,
    ) {
        if body.len() < 4 {
            fx.violation = Some("message body shorter than a constructor id".into());
            return;
        }
        let cid = u32::from_le_bytes(body[..4].try_into().unwrap());

        match cid {
            ID_MSG_CONTAINER => match tl::MsgContainer::from_bytes(body) {
                Ok(container) => {
                    for inner in container.messages {
                        match conn.session.is_valid_inbound_msg_id(inner.msg_id) {
                            None => {}
                            Some(InvalidInboundMsgId::Duplicate) => continue,
                            Some(reason) => {
                                fx.violation = Some(format!("container child id {reason:?}"));
                                return;
                            }
                        }
                        if inner.seqno & 1 == 1 {
                            conn.ack_buffer.push(inner.msg_id);
                        }
                        self.process(conn, inner.msg_id, envelope_salt, &inner.body, fx);
                    }
                }
                Err(e) => fx.violation = Some(format!("bad container: {e}")),
            },

            ID_GZIP_PACKED => match tl::GzipPacked::from_bytes(body) {
                Ok(packed) => match gzip_decompress(&packed.packed_data) {
                    Ok(inner) => self.process(conn, msg_id, envelope_salt, &inner, fx),
                    Err(e) => fx.violation = Some(e),
                },
                Err(e) => fx.violation = Some(format!("bad gzip_packed: {e}")),
            },

            ID_MSG_COPY => match tl::MsgCopy::from_bytes(body) {
                Ok(copy) => {
                    let inner = copy.orig_message;
                    self.process(conn, inner.msg_id, envelope_salt, &inner.body, fx);
                }
                Err(e) => fx.violation = Some(format!("bad msg_copy: {e}")),
            },

            ID_RPC_RESULT => match tl::RpcResult::from_bytes(body) {
                Ok(result) => self.complete_rpc(result, fx),
                Err(e) => fx.violation = Some(format!("bad rpc_result: {e}")),
            },

            ID_BAD_SERVER_SALT => match tl::BadServerSalt::from_bytes(body) {
                Ok(bad) => {
                    log::info!(
                        "[dc {}] server salt rotated (msg {})",
                        self.dc.id,
                        bad.bad_msg_id
                    );
                    conn.session.set_server_salt(bad.new_server_salt);
                    fx.requeues.push(bad.bad_msg_id);
                }
                Err(e) => fx.violation = Some(format!("bad bad_server_salt: {e}")),
            },

            ID_BAD_MSG_NOTIFY => {
                match tl::BadMsgNotification::from_bytes(body) {
                    Ok(bad) => self.handle_bad_msg(conn, msg_id, envelope_salt, bad, fx),
                    Err(e) => fx.violation = Some(format!("bad bad_msg_notification: {e}")),
                }
            }

            ID_NEW_SESSION => {
                match tl::NewSessionCreated::from_bytes(body) {
                    Ok(created) => {
                        log::debug!("[dc {}] server opened a new session", self.dc.id);
                        conn.session.set_server_salt(created.server_salt);
                        conn.ack_buffer.clear();
                        conn.ack_buffer.push(msg_id);
                        fx.events.push(SessionEvent::Reset);
                    }
                    Err(e) => fx.violation = Some(format!("bad new_session_created: {e}")),
                }
            }

            ID_MSGS_ACK => match tl::MsgsAck::from_bytes(body) {
                Ok(acks) => {
                    for id in acks.msg_ids {
                        if let Some(p) = self.pending.get_mut(&id) {
                            p.acked = true;
                        }
                    }
                }
                Err(e) => fx.violation = Some(format!("bad msgs_ack: {e}")),
            },

            ID_PONG => match tl::Pong::from_bytes(body) {
                Ok(pong) => {
                    if conn.ping_ids.contains(&pong.ping_id) {
                        conn.ping_ids.clear();
                        conn.ping_deadline = None;
                    }
                    if let Some(mut p) = self.pending.remove(&pong.msg_id) {
                        if let Some(tx) = p.tx.take() {
                            let _ = tx.send(Ok(body.to_vec()));
                        }
                    }
                }
                Err(e) => fx.violation = Some(format!("bad pong: {e}")),
            },

            // Server-initiated ping: answer with a pong referencing it.
            ID_PING => match tl::Ping::from_bytes(body) {
                Ok(ping) => {
                    fx.replies.push(tl::Pong { msg_id, ping_id: ping.ping_id }.to_bytes());
                }
                Err(e) => fx.violation = Some(format!("bad ping: {e}")),
            },

            ID_MSGS_STATE_REQ | ID_MSG_RESEND_REQ => {
                log::debug!("[dc {}] ignoring state/resend request {cid:#010x}", self.dc.id);
            }

            _ => fx.events.push(SessionEvent::Update(body.to_vec())),
        }
    }

    fn handle_bad_msg(
        &mut self,
        conn: &mut Conn<C::Stream>,
        notification_msg_id: i64,
        envelope_salt: i64,
        bad: tl::BadMsgNotification,
        fx: &mut Effects,
    ) {
        log::info!(
            "[dc {}] bad_msg_notification code {} for msg {}",
            self.dc.id,
            bad.error_code,
            bad.bad_msg_id
        );
        match bad.error_code {
            // msg_id too low / too high: adopt the server clock (carried in
            // the notification's own id) and resend.
            16 | 17 => {
                conn.session.update_time_offset((notification_msg_id >> 32) as i32);
                fx.requeues.push(bad.bad_msg_id);
            }
            // seq_no too low / too high.
            32 | 33 => {
                conn.session.reset_seq_no();
                fx.requeues.push(bad.bad_msg_id);
            }
            // Bad server salt; the envelope already carries the valid one.
            48 => {
                conn.session.set_server_salt(envelope_salt);
                fx.requeues.push(bad.bad_msg_id);
            }
            code => {
                let targets = resolve_children(conn, bad.bad_msg_id);
                for target in targets {
                    if let Some(mut p) = self.pending.remove(&target) {
                        if let Some(tx) = p.tx.take() {
                            let _ = tx.send(Err(InvocationError::Protocol(format!(
                                "bad_msg_notification code {code}"
                            ))));
                        }
                    }
                }
            }
        }
    }

    fn complete_rpc(&mut self, result: tl::RpcResult, fx: &mut Effects) {
        let Some(mut p) = self.pending.remove(&result.req_msg_id) else {
            log::debug!("rpc_result for unknown req_msg_id {}", result.req_msg_id);
            return;
        };

        let payload = result.result;
        let outcome = if payload.len() >= 4 {
            match u32::from_le_bytes(payload[..4].try_into().unwrap()) {
                ID_RPC_ERROR => match tl::RpcError::from_bytes(&payload) {
                    Ok(err) => {
                        let rpc = RpcError::from_telegram(err.error_code, &err.error_message);
                        if rpc.is("AUTH_KEY_UNREGISTERED") {
                            fx.auth_invalid = true;
                        }
                        Err(InvocationError::Rpc(rpc))
                    }
                    Err(e) => Err(InvocationError::Deserialize(e.to_string())),
                },
                ID_GZIP_PACKED => tl::GzipPacked::from_bytes(&payload)
                    .map_err(|e| InvocationError::Deserialize(e.to_string()))
                    .and_then(|packed| {
                        gzip_decompress(&packed.packed_data).map_err(InvocationError::Deserialize)
                    }),
                _ => Ok(payload),
            }
        } else {
            Ok(payload)
        };

        if let Some(tx) = p.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Carry out the side effects of one inbound frame.
    async fn apply(&mut self, conn: &mut Conn<C::Stream>, fx: Effects) -> Result<(), Exit> {
        if let Some(violation) = fx.violation {
            log::warn!("[dc {}] protocol violation: {violation}", self.dc.id);
            return Err(Exit::Reconnect);
        }

        for body in fx.replies {
            self.transmit(conn, Request { token: 0, body, expects_reply: false, tx: None })
                .await?;
        }

        for id in fx.requeues {
            let targets = resolve_children(conn, id);
            for target in targets {
                if let Some(p) = self.pending.remove(&target) {
                    let req =
                        Request { token: p.token, body: p.body, expects_reply: true, tx: p.tx };
                    self.transmit(conn, req).await?;
                }
            }
        }

        for event in fx.events {
            if self.updates.send(event).await.is_err() {
                log::debug!("updates receiver dropped");
            }
        }

        if fx.auth_invalid {
            conn.session.set_unauthorized(true);
            return Err(Exit::AuthKeyInvalid);
        }
        Ok(())
    }
}

/// Requests a server complaint may reference through a container id.
fn resolve_children<S>(conn: &Conn<S>, id: i64) -> Vec<i64> {
    match conn.container_children.get(&id) {
        Some(children) => children.clone(),
        None => vec![id],
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn unpack_plain(frame: &[u8]) -> Result<&[u8], InvocationError> {
    plain::unpack(frame).map_err(|e| InvocationError::Protocol(e.to_string()))
}

/// Service messages never count as content; everything else does.
fn is_content_related(body: &[u8]) -> bool {
    if body.len() < 4 {
        return true;
    }
    !matches!(
        u32::from_le_bytes(body[..4].try_into().unwrap()),
        ID_MSGS_ACK
            | ID_PING
            | ID_PING_DELAY_DISCONNECT
            | ID_MSG_CONTAINER
            | ID_MSGS_STATE_REQ
            | ID_MSG_RESEND_REQ
    )
}

fn random_i64() -> i64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    i64::from_le_bytes(b)
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("in-memory write");
    encoder.finish().expect("in-memory finish")
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, String> {
    use std::io::Read;
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| "decompression failed".to_string())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_relatedness_follows_the_constructor() {
        assert!(!is_content_related(&tl::Ping { ping_id: 1 }.to_bytes()));
        assert!(!is_content_related(&tl::MsgsAck { msg_ids: vec![] }.to_bytes()));
        assert!(!is_content_related(
            &tl::PingDelayDisconnect { ping_id: 1, disconnect_delay: 75 }.to_bytes()
        ));
        assert!(is_content_related(&tl::GetConfig {}.to_bytes()));
        assert!(is_content_related(&tl::Pong { msg_id: 1, ping_id: 1 }.to_bytes()));
    }

    #[test]
    fn gzip_roundtrip() {
        let data = vec![7u8; 40_000];
        let packed = gzip_compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(gzip_decompress(&packed).unwrap(), data);
    }
}
