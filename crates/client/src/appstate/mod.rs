//! Incremental sync of named app-state categories shared between a user's
//! devices.
//!
//! A fetch is verified end to end before anything is written: every value
//! MAC, every index MAC, and the LT hash against the MAC the relay declared
//! for each snapshot and patch. A failure discards the whole fetch.

pub mod keys;
pub mod lthash;
pub mod patch;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use courier_crypto::storage::{
    AppStateCommit, AppStateVersion, MutationMac, ProtocolStore, SyncKey, SyncStore,
};
use courier_shared::ids::DeviceAddress;
use courier_shared::node::Node;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use serde_json::Value;

use self::keys::ExpandedKeys;
use self::lthash::LtHash;
use self::patch::{PatchWire, SnapshotWire, SyncAction, SyncRecord};
use crate::client::ClientInner;
use crate::devices;
use crate::error::ClientError;
use crate::events::{AppStateMutation, Event, MutationOperation};
use crate::payload::{AppStateKeyRequest, AppStateKeyShare, MessagePayload};
use crate::send;

const SYNC_XMLNS: &str = "w:sync:app:state";

/// One local change to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchMutation {
    pub operation: MutationOperation,
    pub index: Vec<String>,
    pub value: Value,
}

impl PatchMutation {
    pub fn set(index: Vec<String>, value: Value) -> Self {
        Self {
            operation: MutationOperation::Set,
            index,
            value,
        }
    }

    pub fn remove(index: Vec<String>) -> Self {
        Self {
            operation: MutationOperation::Remove,
            index,
            value: Value::Null,
        }
    }
}

/// Remembers when each missing key was last requested.
pub struct KeyRequestTracker {
    last: DashMap<Vec<u8>, Instant>,
    cooldown: Duration,
}

impl KeyRequestTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            last: DashMap::new(),
            cooldown,
        }
    }

    /// True if `key_id` may be requested now; records the request.
    pub fn should_request(&self, key_id: &[u8], now: Instant) -> bool {
        match self.last.entry(key_id.to_vec()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.cooldown {
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}

/// Working state of one fetch. Nothing here touches the store until
/// [`SyncSession::commit_record`] is persisted.
struct SyncSession {
    name: String,
    version: u64,
    hash: LtHash,
    /// Drop every stored index on commit (a snapshot was applied).
    replace_all: bool,
    /// Index MAC to value MAC changes made by this fetch; `None` removes.
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
    events: Vec<AppStateMutation>,
    keys: HashMap<Vec<u8>, ExpandedKeys>,
    missing_keys: Vec<Vec<u8>>,
}

impl SyncSession {
    fn fresh(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: 0,
            hash: LtHash::default(),
            replace_all: true,
            overlay: HashMap::new(),
            events: Vec::new(),
            keys: HashMap::new(),
            missing_keys: Vec::new(),
        }
    }

    fn resume(name: &str, stored: &AppStateVersion) -> Result<Self, ClientError> {
        let hash = LtHash::from_slice(&stored.hash).ok_or_else(|| ClientError::AppStateMismatch {
            name: name.to_string(),
            what: format!("stored hash has {} bytes", stored.hash.len()),
        })?;
        Ok(Self {
            version: stored.version,
            hash,
            replace_all: false,
            ..Self::fresh(name)
        })
    }

    fn mismatch(&self, what: impl Into<String>) -> ClientError {
        ClientError::AppStateMismatch {
            name: self.name.clone(),
            what: what.into(),
        }
    }

    async fn load_key(&mut self, store: &dyn ProtocolStore, key_id: &[u8]) -> Result<(), ClientError> {
        if self.keys.contains_key(key_id) {
            return Ok(());
        }
        match store.get_sync_key(key_id).await? {
            Some(key) => {
                self.keys
                    .insert(key_id.to_vec(), ExpandedKeys::derive(&key.key_data)?);
                Ok(())
            }
            None => {
                self.missing_keys.push(key_id.to_vec());
                Err(ClientError::MissingSyncKey {
                    key_id: STANDARD.encode(key_id),
                })
            }
        }
    }

    fn key(&self, key_id: &[u8]) -> Result<&ExpandedKeys, ClientError> {
        self.keys
            .get(key_id)
            .ok_or_else(|| ClientError::MissingSyncKey {
                key_id: STANDARD.encode(key_id),
            })
    }

    /// The value MAC an index currently has, seen through this fetch's
    /// changes.
    async fn previous(
        &self,
        store: &dyn ProtocolStore,
        index_mac: &[u8],
    ) -> Result<Option<Vec<u8>>, ClientError> {
        if let Some(entry) = self.overlay.get(index_mac) {
            return Ok(entry.clone());
        }
        if self.replace_all {
            return Ok(None);
        }
        Ok(store.get_mutation_mac(&self.name, index_mac).await?)
    }

    /// Verify and apply one mutation, returning its value MAC.
    async fn apply_mutation(
        &mut self,
        store: &dyn ProtocolStore,
        operation: MutationOperation,
        record: &SyncRecord,
        version: u64,
    ) -> Result<Vec<u8>, ClientError> {
        self.load_key(store, &record.key_id).await?;
        let decrypted = patch::decrypt_mutation(self.key(&record.key_id)?, operation, record)
            .map_err(|what| self.mismatch(format!("{what} at version {version}")))?;

        if let Some(prior) = self.previous(store, &decrypted.index_mac).await? {
            self.hash.subtract(&prior)?;
        }
        let stored = match operation {
            MutationOperation::Set => {
                self.hash.add(&decrypted.value_mac)?;
                Some(decrypted.value_mac.clone())
            }
            MutationOperation::Remove => None,
        };
        self.overlay.insert(decrypted.index_mac, stored);
        self.events.push(AppStateMutation {
            name: self.name.clone(),
            operation,
            index: decrypted.action.index,
            value: decrypted.action.value,
            version,
        });
        Ok(decrypted.value_mac)
    }

    async fn apply_snapshot(
        &mut self,
        store: &dyn ProtocolStore,
        snapshot: &SnapshotWire,
    ) -> Result<(), ClientError> {
        self.hash = LtHash::default();
        self.replace_all = true;
        self.overlay.clear();
        self.events.clear();
        for record in &snapshot.records {
            self.apply_mutation(store, MutationOperation::Set, record, snapshot.version)
                .await?;
        }

        self.load_key(store, &snapshot.key_id).await?;
        if !patch::verify_snapshot_mac(
            self.key(&snapshot.key_id)?,
            &self.hash,
            snapshot.version,
            &self.name,
            &snapshot.mac,
        ) {
            return Err(self.mismatch(format!("snapshot mac at version {}", snapshot.version)));
        }
        self.version = snapshot.version;
        Ok(())
    }

    async fn apply_patch(
        &mut self,
        store: &dyn ProtocolStore,
        patch: &PatchWire,
    ) -> Result<(), ClientError> {
        if patch.version <= self.version {
            tracing::debug!(name = %self.name, version = patch.version, "skipping already applied patch");
            return Ok(());
        }
        let mut value_macs = Vec::with_capacity(patch.mutations.len());
        for mutation in &patch.mutations {
            value_macs.push(
                self.apply_mutation(store, mutation.operation, &mutation.record, patch.version)
                    .await?,
            );
        }

        self.load_key(store, &patch.key_id).await?;
        let keys = self.key(&patch.key_id)?;
        if !patch::verify_snapshot_mac(keys, &self.hash, patch.version, &self.name, &patch.snapshot_mac) {
            return Err(self.mismatch(format!("hash after patch {}", patch.version)));
        }
        if !patch::verify_patch_mac(keys, patch, &value_macs, &self.name) {
            return Err(self.mismatch(format!("patch mac at version {}", patch.version)));
        }
        self.version = patch.version;
        Ok(())
    }

    fn commit_record(&self) -> AppStateCommit {
        AppStateCommit {
            name: self.name.clone(),
            state: AppStateVersion {
                version: self.version,
                hash: self.hash.as_bytes().to_vec(),
            },
            replace_all: self.replace_all,
            mutations: self
                .overlay
                .iter()
                .map(|(index_mac, value_mac)| MutationMac {
                    index_mac: index_mac.clone(),
                    value_mac: value_mac.clone(),
                })
                .collect(),
        }
    }
}

fn sync_request(name: &str, version: u64, return_snapshot: bool, patch: Option<Vec<u8>>) -> Node {
    let mut collection = Node::new("collection")
        .attr("name", name)
        .attr("version", version)
        .attr("return_snapshot", if return_snapshot { "true" } else { "false" });
    if let Some(patch) = patch {
        collection.push_child(Node::new("patch").with_bytes(patch));
    }
    Node::new("iq")
        .attr("type", "set")
        .attr("xmlns", SYNC_XMLNS)
        .with_children(vec![Node::new("sync").with_children(vec![collection])])
}

async fn sync_loop(
    inner: &ClientInner,
    session: &mut SyncSession,
    full: bool,
) -> Result<(), ClientError> {
    let store = &**inner.store();
    let mut want_snapshot = full;
    loop {
        let response = inner
            .send_iq(sync_request(&session.name, session.version, want_snapshot, None))
            .await?;
        let collection = response.require_child("sync")?.require_child("collection")?;

        if let Some(node) = collection.child("snapshot") {
            let snapshot: SnapshotWire = serde_json::from_slice(node.require_bytes()?)?;
            session.apply_snapshot(store, &snapshot).await?;
        }
        if let Some(patches) = collection.child("patches") {
            for node in patches.children_by_tag("patch") {
                let patch: PatchWire = serde_json::from_slice(node.require_bytes()?)?;
                session.apply_patch(store, &patch).await?;
            }
        }

        if collection.get_str("has_more_patches") != Some("true") {
            return Ok(());
        }
        want_snapshot = false;
    }
}

/// Fetch with the category lock already held.
async fn fetch_locked(inner: &ClientInner, name: &str, full: bool) -> Result<u64, ClientError> {
    let store = inner.store();
    let stored = store.get_app_state_version(name).await?;
    let full = full || stored.as_ref().map_or(true, |s| s.version == 0);
    let mut session = match (&stored, full) {
        (Some(stored), false) => SyncSession::resume(name, stored)?,
        _ => SyncSession::fresh(name),
    };
    let start = session.version;

    if let Err(e) = sync_loop(inner, &mut session, full).await {
        tracing::warn!(name, version = start, error = %e, "app-state fetch discarded");
        if matches!(e, ClientError::MissingSyncKey { .. }) {
            let missing = std::mem::take(&mut session.missing_keys);
            if let Err(request_error) = request_missing_keys(inner, missing).await {
                tracing::warn!(name, error = %request_error, "could not request app-state keys");
            }
        }
        return Err(e);
    }

    if session.version != start || session.replace_all {
        store.commit_app_state(&session.commit_record()).await?;
    }
    tracing::info!(
        name,
        from = start,
        to = session.version,
        mutations = session.events.len(),
        full,
        "app-state synced"
    );

    if !full || inner.config.emit_app_state_events_on_full_sync {
        for mutation in session.events.drain(..) {
            inner.emit(Event::AppStateMutation(mutation));
        }
    }
    inner.emit(Event::AppStateSynced {
        name: name.to_string(),
        version: session.version,
    });
    Ok(session.version)
}

/// Bring category `name` up to date. `full` discards local state and starts
/// from a snapshot.
pub(crate) async fn fetch_app_state(
    inner: &ClientInner,
    name: &str,
    full: bool,
) -> Result<u64, ClientError> {
    let lock = inner.app_state_lock(name);
    let _guard = lock.lock().await;
    fetch_locked(inner, name, full).await
}

/// Encrypt `mutations` as the next patch of `name`, publish it, and read it
/// back through the normal verified fetch.
pub(crate) async fn send_app_state_patch(
    inner: &ClientInner,
    name: &str,
    mutations: Vec<PatchMutation>,
) -> Result<u64, ClientError> {
    let lock = inner.app_state_lock(name);
    let _guard = lock.lock().await;
    fetch_locked(inner, name, false).await?;

    let store = inner.store();
    let key = match store.latest_sync_key().await? {
        Some(key) => key,
        None => create_sync_key(inner).await?,
    };
    let state = store
        .get_app_state_version(name)
        .await?
        .unwrap_or_else(|| AppStateVersion {
            version: 0,
            hash: LtHash::default().as_bytes().to_vec(),
        });
    let base = LtHash::from_slice(&state.hash).ok_or_else(|| ClientError::AppStateMismatch {
        name: name.to_string(),
        what: "stored hash length".into(),
    })?;

    let keys = ExpandedKeys::derive(&key.key_data)?;
    let mut previous = HashMap::new();
    for mutation in &mutations {
        let index_mac = patch::index_mac(&keys, &mutation.index)?;
        if let Some(value_mac) = store.get_mutation_mac(name, &index_mac).await? {
            previous.insert(index_mac.to_vec(), value_mac);
        }
    }
    let actions: Vec<(MutationOperation, SyncAction)> = mutations
        .into_iter()
        .map(|m| {
            (
                m.operation,
                SyncAction {
                    index: m.index,
                    value: m.value,
                },
            )
        })
        .collect();
    let (wire, _) = patch::build_patch(&key, name, &base, state.version + 1, &actions, &previous)?;

    inner
        .send_iq(sync_request(
            name,
            state.version,
            false,
            Some(serde_json::to_vec(&wire)?),
        ))
        .await?;
    tracing::debug!(name, version = wire.version, mutations = actions.len(), "published app-state patch");
    fetch_locked(inner, name, false).await
}

/// Generate a sync key and hand it to our other devices.
pub(crate) async fn create_sync_key(inner: &ClientInner) -> Result<SyncKey, ClientError> {
    let mut key_id = vec![0u8; 6];
    let mut key_data = [0u8; 32];
    rand::rng().fill_bytes(&mut key_id);
    rand::rng().fill_bytes(&mut key_data);
    let key = SyncKey {
        key_id,
        key_data,
        timestamp: chrono::Utc::now().timestamp(),
    };
    inner.store().store_sync_key(&key).await?;
    tracing::info!(key_id = %STANDARD.encode(&key.key_id), "created app-state sync key");

    let own = devices::resolve_devices(inner, &[inner.own.user]).await?;
    let payload = MessagePayload {
        app_state_key_share: Some(AppStateKeyShare {
            keys: vec![key.clone()],
        }),
        ..MessagePayload::default()
    };
    send::send_protocol_message(inner, &own, &payload).await?;
    Ok(key)
}

/// Ask our other devices for keys we lack, at most once per cooldown per
/// key id.
async fn request_missing_keys(inner: &ClientInner, key_ids: Vec<Vec<u8>>) -> Result<(), ClientError> {
    let now = Instant::now();
    let due: Vec<Vec<u8>> = key_ids
        .into_iter()
        .filter(|id| inner.key_requests.should_request(id, now))
        .collect();
    if due.is_empty() {
        tracing::debug!("app-state key request still cooling down");
        return Ok(());
    }

    let own = devices::resolve_devices(inner, &[inner.own.user]).await?;
    let payload = MessagePayload {
        app_state_key_request: Some(AppStateKeyRequest { key_ids: due }),
        ..MessagePayload::default()
    };
    let result = send::send_protocol_message(inner, &own, &payload).await?;
    tracing::info!(devices = result.delivered_to.len(), "requested app-state keys");
    Ok(())
}

/// Keys shared by one of our own devices.
pub(crate) async fn store_key_share(inner: &ClientInner, keys: &[SyncKey]) -> Result<(), ClientError> {
    for key in keys {
        inner.store().store_sync_key(key).await?;
    }
    tracing::info!(count = keys.len(), "stored shared app-state keys");
    Ok(())
}

/// Another of our devices asked for keys; share whichever we hold.
pub(crate) async fn answer_key_request(
    inner: &ClientInner,
    requester: DeviceAddress,
    request: &AppStateKeyRequest,
) -> Result<(), ClientError> {
    let mut keys = Vec::new();
    for key_id in &request.key_ids {
        if let Some(key) = inner.store().get_sync_key(key_id).await? {
            keys.push(key);
        }
    }
    if keys.is_empty() {
        tracing::debug!(device = %requester, "none of the requested app-state keys are known");
        return Ok(());
    }
    let payload = MessagePayload {
        app_state_key_share: Some(AppStateKeyShare { keys }),
        ..MessagePayload::default()
    };
    send::send_protocol_message(inner, &[requester], &payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_crypto::storage::MemoryStore;
    use serde_json::json;

    fn key() -> SyncKey {
        SyncKey {
            key_id: vec![4, 5, 6],
            key_data: [1; 32],
            timestamp: 0,
        }
    }

    fn action(chat: &str) -> SyncAction {
        SyncAction {
            index: vec!["pin".into(), chat.into()],
            value: json!({ "pinned": true }),
        }
    }

    #[test]
    fn key_requests_cool_down_per_key() {
        let tracker = KeyRequestTracker::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(tracker.should_request(b"k1", now));
        assert!(!tracker.should_request(b"k1", now + Duration::from_secs(30)));
        assert!(tracker.should_request(b"k2", now + Duration::from_secs(30)));
        assert!(tracker.should_request(b"k1", now + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn snapshot_then_patch_applies() {
        let store = MemoryStore::new();
        store.store_sync_key(&key()).await.unwrap();

        let snapshot = patch::build_snapshot(&key(), "regular", 3, &[action("a")]).unwrap();
        let mut session = SyncSession::fresh("regular");
        session.apply_snapshot(&store, &snapshot).await.unwrap();
        assert_eq!(session.version, 3);

        let (next, _) = patch::build_patch(
            &key(),
            "regular",
            &session.hash,
            4,
            &[(MutationOperation::Set, action("b"))],
            &HashMap::new(),
        )
        .unwrap();
        session.apply_patch(&store, &next).await.unwrap();
        assert_eq!(session.version, 4);
        assert_eq!(session.events.len(), 2);

        let commit = session.commit_record();
        assert!(commit.replace_all);
        assert_eq!(commit.mutations.len(), 2);
    }

    #[tokio::test]
    async fn overwriting_an_index_replaces_its_mac_in_the_hash() {
        let store = MemoryStore::new();
        store.store_sync_key(&key()).await.unwrap();
        let mut session = SyncSession::fresh("regular");

        let (first, hash) = patch::build_patch(
            &key(),
            "regular",
            &LtHash::default(),
            1,
            &[(MutationOperation::Set, action("a"))],
            &HashMap::new(),
        )
        .unwrap();
        session.apply_patch(&store, &first).await.unwrap();
        assert_eq!(session.hash, hash);

        let previous: HashMap<Vec<u8>, Vec<u8>> = first
            .mutations
            .iter()
            .map(|m| {
                (
                    m.record.index_mac.clone(),
                    m.record.value_mac().unwrap().to_vec(),
                )
            })
            .collect();
        let (second, _) = patch::build_patch(
            &key(),
            "regular",
            &hash,
            2,
            &[(MutationOperation::Remove, action("a"))],
            &previous,
        )
        .unwrap();
        session.apply_patch(&store, &second).await.unwrap();
        assert_eq!(session.hash, LtHash::default());
        assert!(session.overlay.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn unknown_key_is_reported_and_remembered() {
        let store = MemoryStore::new();
        let snapshot = patch::build_snapshot(&key(), "regular", 1, &[action("a")]).unwrap();
        let mut session = SyncSession::fresh("regular");

        let err = session.apply_snapshot(&store, &snapshot).await.unwrap_err();
        assert!(matches!(err, ClientError::MissingSyncKey { .. }));
        assert_eq!(session.missing_keys, vec![key().key_id]);
    }

    #[tokio::test]
    async fn tampered_snapshot_mac_is_rejected() {
        let store = MemoryStore::new();
        store.store_sync_key(&key()).await.unwrap();
        let mut snapshot = patch::build_snapshot(&key(), "regular", 1, &[action("a")]).unwrap();
        snapshot.mac[0] ^= 0xff;

        let mut session = SyncSession::fresh("regular");
        let err = session.apply_snapshot(&store, &snapshot).await.unwrap_err();
        assert!(matches!(err, ClientError::AppStateMismatch { .. }));
    }
}
