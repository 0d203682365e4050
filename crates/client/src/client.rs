//! The client handle and the state every connection task shares.

use std::sync::Arc;
use std::time::Duration;

use courier_crypto::cipher::SessionCipher;
use courier_crypto::identity;
use courier_crypto::storage::{IdentityKeyStore, MemoryStore, ProtocolStore, SqliteStore, SyncKey};
use courier_shared::codec::{JsonCodec, NodeCodec};
use courier_shared::ids::{DeviceAddress, Jid};
use courier_shared::node::Node;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::appstate::{self, KeyRequestTracker, PatchMutation};
use crate::config::ClientConfig;
use crate::connection;
use crate::devices::DeviceCache;
use crate::error::ClientError;
use crate::events::{Event, EventBus};
use crate::msgcache::{BoundedMap, MessageLookup, RecentMessages};
use crate::payload::MessagePayload;
use crate::request::{check_iq_error, wait_response, PendingRequests};
use crate::retry::{RecreateTracker, RetryCounters};
use crate::send::{self, GroupDistribution, SendResult};
use crate::transport::Transport;

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn NodeCodec>,
    pub(crate) cipher: SessionCipher,
    pub(crate) own: DeviceAddress,
    pub(crate) events: EventBus,
    pub(crate) pending: PendingRequests,
    outbound: RwLock<Option<mpsc::Sender<Node>>>,
    /// Held by every outbound message send, retry re-sends included.
    pub(crate) send_lock: Mutex<()>,
    pub(crate) devices: DeviceCache,
    pub(crate) distribution: GroupDistribution,
    /// Participant hash we attached to each group message awaiting its ack.
    pub(crate) sent_phash: BoundedMap<String, (Jid, String)>,
    pub(crate) recent: RecentMessages,
    pub(crate) lookup: Option<Arc<dyn MessageLookup>>,
    pub(crate) retries: RetryCounters,
    pub(crate) recreates: RecreateTracker,
    pub(crate) key_requests: KeyRequestTracker,
    pub(crate) app_state_locks: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl ClientInner {
    pub(crate) fn store(&self) -> &Arc<dyn ProtocolStore> {
        self.cipher.store()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.emit(&event);
    }

    pub(crate) async fn set_outbound(&self, sender: Option<mpsc::Sender<Node>>) {
        *self.outbound.write().await = sender;
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.outbound.read().await.is_some()
    }

    /// Queue a node for the writer task.
    pub(crate) async fn send_node(&self, node: Node) -> Result<(), ClientError> {
        let sender = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        sender
            .send(node)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub(crate) async fn send_iq(&self, node: Node) -> Result<Node, ClientError> {
        self.send_iq_with_timeout(node, self.config.request_timeout())
            .await
    }

    /// Send an IQ and wait for the matching result. `type="error"` answers
    /// become `ClientError::Iq`.
    pub(crate) async fn send_iq_with_timeout(
        &self,
        mut node: Node,
        timeout: Duration,
    ) -> Result<Node, ClientError> {
        let id = match node.get_str("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.pending.next_id();
                node = node.attr("id", id.as_str());
                id
            }
        };
        let (_guard, rx) = self.pending.register(id);
        self.send_node(node).await?;
        let mut shutdown = self.shutdown.subscribe();
        let response = wait_response(rx, timeout, &mut shutdown).await?;
        check_iq_error(response)
    }

    pub(crate) fn app_state_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.app_state_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

/// Builder for [`Client`]. A store without an identity gets one generated.
pub struct ClientBuilder {
    address: DeviceAddress,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    store: Option<Arc<dyn ProtocolStore>>,
    codec: Arc<dyn NodeCodec>,
    lookup: Option<Arc<dyn MessageLookup>>,
}

impl ClientBuilder {
    pub fn new(address: DeviceAddress, transport: Arc<dyn Transport>) -> Self {
        Self {
            address,
            transport,
            config: ClientConfig::default(),
            store: None,
            codec: Arc::new(JsonCodec),
            lookup: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ProtocolStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn NodeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn message_lookup(mut self, lookup: Arc<dyn MessageLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub async fn build(self) -> Result<Client, ClientError> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn ProtocolStore> = match (self.store, &config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        if store.get_identity_key_pair().await?.is_none() {
            identity::generate_identity(&*store).await?;
            tracing::info!(address = %self.address, "generated new device identity");
        }

        let cipher = SessionCipher::new(store).with_auto_trust_identity(config.auto_trust_identity);
        if config.auto_trust_identity {
            tracing::warn!("auto_trust_identity is enabled: changed peer identities will be accepted");
        }

        let (shutdown, _) = watch::channel(false);
        let inner = ClientInner {
            transport: self.transport,
            codec: self.codec,
            cipher,
            own: self.address,
            events: EventBus::new(),
            pending: PendingRequests::new(),
            outbound: RwLock::new(None),
            send_lock: Mutex::new(()),
            devices: DeviceCache::new(),
            distribution: GroupDistribution::new(),
            sent_phash: BoundedMap::new(config.recent_message_cache_size),
            recent: RecentMessages::new(config.recent_message_cache_size),
            lookup: self.lookup,
            retries: RetryCounters::new(config.max_retry_count, config.recent_message_cache_size),
            recreates: RecreateTracker::new(
                config.session_recreate_min_retry,
                config.session_recreate_cooldown(),
            ),
            key_requests: KeyRequestTracker::new(config.app_state_key_request_cooldown()),
            app_state_locks: DashMap::new(),
            shutdown,
            config,
        };
        Ok(Client {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to one device's session with the relay. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(address: DeviceAddress, transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(address, transport)
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.own
    }

    pub fn store(&self) -> &Arc<dyn ProtocolStore> {
        self.inner.store()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.add_handler(handler);
    }

    /// Connect and keep reconnecting until [`Client::disconnect`] or a
    /// logout. Returns `Err(LoggedOut)` when the relay revoked the session.
    pub async fn run(&self) -> Result<(), ClientError> {
        connection::run(&self.inner).await
    }

    /// Stop `run`, cancelling every pending request.
    pub fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub async fn send_text(&self, chat: Jid, body: &str) -> Result<SendResult, ClientError> {
        self.send_message(chat, MessagePayload::text(body)).await
    }

    pub async fn send_message(
        &self,
        chat: Jid,
        payload: MessagePayload,
    ) -> Result<SendResult, ClientError> {
        send::send_message(&self.inner, chat, payload).await
    }

    /// Send a raw IQ and wait for its result.
    pub async fn send_iq(&self, node: Node) -> Result<Node, ClientError> {
        self.inner.send_iq(node).await
    }

    /// Bring one app-state category up to date. Returns the new version.
    pub async fn fetch_app_state(&self, name: &str, full: bool) -> Result<u64, ClientError> {
        appstate::fetch_app_state(&self.inner, name, full).await
    }

    /// Encrypt and publish local app-state changes. Returns the new version.
    pub async fn send_app_state_patch(
        &self,
        name: &str,
        mutations: Vec<PatchMutation>,
    ) -> Result<u64, ClientError> {
        appstate::send_app_state_patch(&self.inner, name, mutations).await
    }

    /// Generate a new app-state sync key and share it with our other
    /// devices. Patches are encrypted under the newest key.
    pub async fn create_app_state_key(&self) -> Result<SyncKey, ClientError> {
        appstate::create_sync_key(&self.inner).await
    }
}
