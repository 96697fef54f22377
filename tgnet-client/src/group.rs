//! The client group: one session per datacenter and the routing policy
//! between them.
//!
//! Owns the DC table, lazily opens sessions, follows `*_MIGRATE_*`
//! redirections, retries `FLOOD_WAIT` and renegotiates after
//! `AUTH_KEY_UNREGISTERED`. All sessions feed one merged update stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use tgnet_crypto::rsa::RsaKeyRegister;
use tgnet_mtproto::dh::{CachingPrimeChecker, DhPrimeChecker};
use tgnet_tl::mtproto as tl;
use tgnet_tl::{Cursor, Deserializable, RemoteCall, Serializable};

use crate::datacenter::{DataCenter, DcOptions, DcType};
use crate::errors::InvocationError;
use crate::sender::{
    spawn_session, ConnectionState, SenderConfig, SessionEvent, SessionHandle,
};
use crate::store::StoreLayout;
use crate::transport::Connector;

// ─── Config ──────────────────────────────────────────────────────────────────

/// The `initConnection` identity announced after authorization.
#[derive(Clone)]
pub struct InitParams {
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    /// Pre-serialized `InputClientProxy`, if any.
    pub proxy: Option<Vec<u8>>,
    /// Pre-serialized `JSONValue` of extra parameters, if any.
    pub params: Option<Vec<u8>>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            device_model: "Unknown".into(),
            system_version: "1.0".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            system_lang_code: "en".into(),
            lang_pack: String::new(),
            lang_code: "en".into(),
            proxy: None,
            params: None,
        }
    }
}

/// Configuration for [`ClientGroup`].
#[derive(Clone)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub init_params: InitParams,
    pub main_dc: DataCenter,
    pub sender: SenderConfig,
    /// `FLOOD_WAIT` waits longer than this surface as errors.
    pub flood_wait_max: Duration,
    /// Capacity of the merged update stream; when full, sessions stall
    /// rather than drop.
    pub update_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            init_params: InitParams::default(),
            main_dc: DataCenter::default_main(),
            sender: SenderConfig::default(),
            flood_wait_max: Duration::from_secs(60),
            update_buffer: 256,
        }
    }
}

// ─── UpdateStream ────────────────────────────────────────────────────────────

/// The merged stream of non-RPC traffic from every session.
pub struct UpdateStream {
    rx: mpsc::Receiver<SessionEvent>,
}

impl UpdateStream {
    /// The next event, or `None` once every session has closed.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

// ─── ClientGroup ─────────────────────────────────────────────────────────────

struct GroupInner<C: Connector> {
    connector: Arc<C>,
    store: Arc<dyn StoreLayout>,
    keys: Arc<RsaKeyRegister>,
    checker: Arc<dyn DhPrimeChecker>,
    config: Config,
    sessions: Mutex<HashMap<i32, SessionHandle>>,
    main_dc: Mutex<DataCenter>,
    dc_options: Mutex<DcOptions>,
    updates_tx: mpsc::Sender<SessionEvent>,
    updates_rx: std::sync::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    closed: AtomicBool,
}

/// One authorized session per datacenter, with request routing between them.
/// Cheap to clone.
pub struct ClientGroup<C: Connector> {
    inner: Arc<GroupInner<C>>,
}

impl<C: Connector> Clone for ClientGroup<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Connector> ClientGroup<C> {
    /// Build a group over `connector` and `store`. No connection is opened
    /// until the first request (or [`ClientGroup::init_connection`]).
    pub fn new(connector: C, store: Arc<dyn StoreLayout>, config: Config) -> Self {
        let dc_options = store
            .dc_options()
            .ok()
            .flatten()
            .filter(|options| !options.is_empty())
            .unwrap_or_else(DcOptions::bootstrap);
        let (updates_tx, updates_rx) = mpsc::channel(config.update_buffer.max(1));

        Self {
            inner: Arc::new(GroupInner {
                connector: Arc::new(connector),
                store,
                keys: Arc::new(RsaKeyRegister::default()),
                checker: Arc::new(CachingPrimeChecker::new()),
                config: config.clone(),
                sessions: Mutex::new(HashMap::new()),
                main_dc: Mutex::new(config.main_dc),
                dc_options: Mutex::new(dc_options),
                updates_tx,
                updates_rx: std::sync::Mutex::new(Some(updates_rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the trusted server keys (e.g. for self-hosted test servers).
    pub fn with_rsa_keys(mut self, keys: RsaKeyRegister) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_rsa_keys must be called before the group is shared")
            .keys = Arc::new(keys);
        self
    }

    /// The current main DC id.
    pub async fn main_dc_id(&self) -> i32 {
        self.inner.main_dc.lock().await.id
    }

    /// Take the merged update stream. Panics if taken twice.
    pub fn updates(&self) -> UpdateStream {
        let rx = self
            .inner
            .updates_rx
            .lock()
            .unwrap()
            .take()
            .expect("updates stream already taken");
        UpdateStream { rx }
    }

    // ── Sessions ───────────────────────────────────────────────────────────

    /// The session for `dc`, opening (and if necessary authorizing) it on
    /// first use.
    async fn session_for(&self, dc: &DataCenter) -> SessionHandle {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(handle) = sessions.get(&dc.id) {
            return handle.clone();
        }
        log::info!("opening session for dc {}", dc.id);
        let handle = spawn_session(
            Arc::clone(&self.inner.connector),
            dc.clone(),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.keys),
            Arc::clone(&self.inner.checker),
            self.inner.updates_tx.clone(),
            self.inner.config.sender.clone(),
        );
        sessions.insert(dc.id, handle.clone());
        handle
    }

    async fn lookup_dc(&self, id: i32) -> Option<DataCenter> {
        self.inner.dc_options.lock().await.find(DcType::Regular, id).cloned()
    }

    /// Make `dc` the main datacenter, opening its session if needed. The
    /// previous main stays in the pool until [`ClientGroup::close`].
    pub async fn set_main(&self, dc: DataCenter) -> SessionHandle {
        let handle = self.session_for(&dc).await;
        *self.inner.main_dc.lock().await = dc;
        handle
    }

    /// Close every session and wait for them to finish. The group rejects
    /// further requests afterwards.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let handles: Vec<SessionHandle> = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().cloned().collect()
        };
        for handle in &handles {
            handle.close().await;
        }
        for handle in handles {
            let mut state = handle.state();
            let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        }
    }

    // ── Requests ───────────────────────────────────────────────────────────

    /// Invoke a typed request on the main DC.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let dc = self.inner.main_dc.lock().await.clone();
        let body = self.send(dc.id, request.to_bytes()).await?;
        let mut cursor = Cursor::from_slice(&body);
        R::Return::deserialize(&mut cursor).map_err(Into::into)
    }

    /// Invoke a typed request on a specific DC.
    pub async fn invoke_on_dc<R: RemoteCall>(
        &self,
        dc_id: i32,
        request: &R,
    ) -> Result<R::Return, InvocationError> {
        let body = self.send(dc_id, request.to_bytes()).await?;
        let mut cursor = Cursor::from_slice(&body);
        R::Return::deserialize(&mut cursor).map_err(Into::into)
    }

    /// Send raw request bytes to `dc_id`, applying the migration, flood-wait
    /// and auth-key policies. Returns the raw reply bytes.
    pub async fn send(&self, dc_id: i32, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(InvocationError::SessionClosed);
        }
        let dc = self
            .lookup_dc(dc_id)
            .await
            .ok_or_else(|| InvocationError::Protocol(format!("unknown dc {dc_id}")))?;
        let mut handle = self.session_for(&dc).await;
        let mut auth_retried = false;
        let mut reopened = false;

        loop {
            match handle.invoke_raw(body.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(InvocationError::Rpc(e)) => {
                    if let Some(target) = e.migrate_dc() {
                        log::info!("{} redirects to dc {target}", e.name);
                        let target_dc = match self.lookup_dc(target).await {
                            Some(dc) => dc,
                            None => {
                                self.refresh_dc_options(&handle).await?;
                                self.lookup_dc(target).await.ok_or_else(|| {
                                    InvocationError::Protocol(format!(
                                        "server redirected to unknown dc {target}"
                                    ))
                                })?
                            }
                        };
                        let next = self.session_for(&target_dc).await;
                        let reply = next.invoke_raw(body.clone()).await?;
                        if e.is("USER_MIGRATE") {
                            // Promote only after the retried request succeeds.
                            *self.inner.main_dc.lock().await = target_dc;
                            log::info!("main dc is now {target}");
                        }
                        return Ok(reply);
                    }

                    if let Some(secs) = e.flood_wait_seconds() {
                        let wait = Duration::from_secs(secs);
                        if wait > self.inner.config.flood_wait_max {
                            return Err(InvocationError::Rpc(e));
                        }
                        log::info!("FLOOD_WAIT_{secs}; sleeping before retry");
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    if e.is("AUTH_KEY_UNREGISTERED") && !auth_retried {
                        // The sender already dropped the key and is
                        // renegotiating; resubmit once on the same session.
                        auth_retried = true;
                        continue;
                    }

                    return Err(InvocationError::Rpc(e));
                }
                Err(InvocationError::SessionClosed) => {
                    // A closed session stays closed; open a fresh one, once.
                    if reopened || self.inner.closed.load(Ordering::SeqCst) {
                        return Err(InvocationError::SessionClosed);
                    }
                    let mut sessions = self.inner.sessions.lock().await;
                    let stale = matches!(
                        sessions.get(&dc.id),
                        Some(existing) if *existing.state().borrow() == ConnectionState::Closed
                    );
                    if stale {
                        sessions.remove(&dc.id);
                        drop(sessions);
                        handle = self.session_for(&dc).await;
                        reopened = true;
                        continue;
                    }
                    return Err(InvocationError::SessionClosed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── initConnection ─────────────────────────────────────────────────────

    /// Announce the client identity and refresh the DC table. Run this once
    /// after building the group (and again after a login migration).
    pub async fn init_connection(&self) -> Result<tl::Config, InvocationError> {
        let params = &self.inner.config.init_params;
        let init = tl::InitConnection {
            api_id: self.inner.config.api_id,
            device_model: params.device_model.clone(),
            system_version: params.system_version.clone(),
            app_version: params.app_version.clone(),
            system_lang_code: params.system_lang_code.clone(),
            lang_pack: params.lang_pack.clone(),
            lang_code: params.lang_code.clone(),
            proxy: params.proxy.clone(),
            params: params.params.clone(),
            query: tl::GetConfig {}.to_bytes(),
        };
        let wrapped = tl::InvokeWithLayer { layer: tgnet_tl::LAYER, query: init.to_bytes() };

        let dc = self.inner.main_dc.lock().await.clone();
        let body = self.send(dc.id, wrapped.to_bytes()).await?;
        let config = tl::Config::from_bytes(&body)?;
        self.adopt_config(&config).await?;
        Ok(config)
    }

    async fn refresh_dc_options(&self, via: &SessionHandle) -> Result<(), InvocationError> {
        let body = via.invoke_raw(tl::GetConfig {}.to_bytes()).await?;
        let config = tl::Config::from_bytes(&body)?;
        self.adopt_config(&config).await
    }

    async fn adopt_config(&self, config: &tl::Config) -> Result<(), InvocationError> {
        let mut options = self.inner.dc_options.lock().await;
        options.apply_config(&config.dc_options, config.test_mode);
        self.inner.store.update_dc_options(&options)?;
        log::info!("dc table refreshed ({} entries)", config.dc_options.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_production_dc2() {
        let config = Config::default();
        assert_eq!(config.main_dc, DataCenter::default_main());
        assert_eq!(config.flood_wait_max, Duration::from_secs(60));
        assert_eq!(config.sender.gzip_threshold, 16 * 1024);
    }
}
