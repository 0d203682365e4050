//! An in-process relay for integration tests, plus helpers to run real
//! clients against it.
//!
//! The relay keeps everything in memory: registered devices, uploaded
//! pre-keys, group membership and app-state patches. It fans messages out
//! the way the production relay does, flattening `<participants>` into one
//! message per device.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use courier_client::events::Event;
use courier_client::msgcache::MessageLookup;
use courier_client::prekeys::{bundle_to_node, PreKeyUpload};
use courier_client::send::participant_hash;
use courier_client::socket::{self, AcceptedSocket};
use courier_client::transport::{MemoryConnection, MemoryTransport};
use courier_client::{Client, ClientConfig};
use courier_crypto::handshake::NoiseCertificate;
use courier_crypto::keys::KeyPair;
use courier_crypto::prekeys::SerializedPreKeyBundle;
use courier_shared::codec::{JsonCodec, NodeCodec};
use courier_shared::ids::{DeviceAddress, GroupId, Jid, UserId};
use courier_shared::node::Node;
use dashmap::DashMap;
use libsignal_protocol::IdentityKeyPair;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

struct RelayKeys {
    static_key: KeyPair,
    certificate: NoiseCertificate,
}

#[derive(Default)]
struct RelayState {
    online: DashMap<DeviceAddress, mpsc::UnboundedSender<Node>>,
    queued: DashMap<DeviceAddress, Vec<Node>>,
    devices: DashMap<UserId, BTreeSet<u32>>,
    keys: DashMap<DeviceAddress, PreKeyUpload>,
    bundle_fetches: DashMap<DeviceAddress, usize>,
    groups: DashMap<GroupId, Vec<UserId>>,
    app_state: DashMap<(UserId, String), Vec<Vec<u8>>>,
    forwarded: Mutex<Vec<(DeviceAddress, Node)>>,
    receipts: Mutex<Vec<(DeviceAddress, Node)>>,
    ignore_pings: AtomicBool,
}

type IqResult = Result<Vec<Node>, (u16, String)>;

fn bad_request(what: impl ToString) -> (u16, String) {
    (400, what.to_string())
}

impl RelayState {
    fn register(&self, address: DeviceAddress, tx: mpsc::UnboundedSender<Node>) {
        self.devices
            .entry(address.user)
            .or_default()
            .insert(address.device);
        self.online.insert(address, tx.clone());
        if let Some((_, pending)) = self.queued.remove(&address) {
            for node in pending {
                let _ = tx.send(node);
            }
        }
    }

    fn devices_of(&self, user: &UserId) -> Vec<DeviceAddress> {
        self.devices
            .get(user)
            .map(|set| set.iter().map(|d| DeviceAddress::new(*user, *d)).collect())
            .unwrap_or_default()
    }

    fn send_to(&self, to: DeviceAddress, node: Node) {
        if let Some(tx) = self.online.get(&to) {
            if tx.send(node.clone()).is_ok() {
                return;
            }
        }
        self.queued.entry(to).or_default().push(node);
    }

    fn forward(&self, to: DeviceAddress, node: Node) {
        if let Ok(mut log) = self.forwarded.lock() {
            log.push((to, node.clone()));
        }
        self.send_to(to, node);
    }

    fn handle(&self, from: DeviceAddress, node: Node) {
        match node.tag.as_str() {
            "iq" => self.answer_iq(from, &node),
            "message" => self.route_message(from, node),
            "receipt" => self.route_receipt(from, node),
            _ => {}
        }
    }

    fn answer_iq(&self, from: DeviceAddress, iq: &Node) {
        let Some(id) = iq.get_str("id") else {
            return;
        };
        if iq.get_str("type") == Some("result") {
            return;
        }
        let result = match iq.get_str("xmlns") {
            Some("usync") => self.usync(iq),
            Some("encrypt") => self.encrypt(from, iq),
            Some("w:g2") => self.group(iq),
            Some("w:sync:app:state") => self.app_state(from, iq),
            Some("w:p") if self.ignore_pings.load(Ordering::SeqCst) => return,
            Some("w:p") => Ok(Vec::new()),
            other => Err((501, format!("unsupported namespace {other:?}"))),
        };
        let response = match result {
            Ok(children) => Node::new("iq")
                .attr("id", id)
                .attr("type", "result")
                .with_children(children),
            Err((code, text)) => Node::new("iq")
                .attr("id", id)
                .attr("type", "error")
                .with_children(vec![Node::new("error")
                    .attr("code", u64::from(code))
                    .attr("text", text)]),
        };
        self.send_to(from, response);
    }

    fn usync(&self, iq: &Node) -> IqResult {
        let list = iq
            .child("usync")
            .and_then(|u| u.child("list"))
            .ok_or_else(|| bad_request("missing usync list"))?;
        let mut users = Vec::new();
        for entry in list.children_by_tag("user") {
            let user = entry
                .jid_attr("jid")
                .ok()
                .and_then(|jid| jid.user())
                .ok_or_else(|| bad_request("bad user jid"))?;
            let devices = self
                .devices_of(&user)
                .into_iter()
                .map(|d| Node::new("device").attr("id", d.device))
                .collect();
            users.push(
                Node::new("user")
                    .attr("jid", user)
                    .with_children(vec![Node::new("devices").with_children(devices)]),
            );
        }
        Ok(vec![
            Node::new("usync").with_children(vec![Node::new("list").with_children(users)])
        ])
    }

    fn encrypt(&self, from: DeviceAddress, iq: &Node) -> IqResult {
        if iq.get_str("type") == Some("set") {
            let upload = PreKeyUpload::from_node(iq).map_err(bad_request)?;
            match self.keys.get_mut(&from) {
                Some(mut stored) => {
                    let mut pre_keys = std::mem::take(&mut stored.pre_keys);
                    pre_keys.extend(upload.pre_keys.iter().cloned());
                    *stored = PreKeyUpload { pre_keys, ..upload };
                }
                None => {
                    self.keys.insert(from, upload);
                }
            }
            return Ok(Vec::new());
        }

        if iq.child("count").is_some() {
            let count = self.keys.get(&from).map_or(0, |k| k.pre_keys.len());
            return Ok(vec![Node::new("count").attr("value", count as u64)]);
        }

        let request = iq
            .child("key")
            .ok_or_else(|| bad_request("unknown encrypt request"))?;
        let mut users = Vec::new();
        for entry in request.children_by_tag("user") {
            let Ok(Jid::Device(address)) = entry.jid_attr("jid") else {
                return Err(bad_request("bundle request for a non-device jid"));
            };
            *self.bundle_fetches.entry(address).or_default() += 1;
            users.push(match self.take_bundle(&address) {
                Some(bundle) => bundle_to_node(&address, &bundle),
                None => Node::new("user")
                    .attr("jid", address)
                    .with_children(vec![Node::new("error").attr("text", "no keys")]),
            });
        }
        Ok(vec![Node::new("list").with_children(users)])
    }

    fn take_bundle(&self, address: &DeviceAddress) -> Option<SerializedPreKeyBundle> {
        let mut stored = self.keys.get_mut(address)?;
        let pre_key = if stored.pre_keys.is_empty() {
            None
        } else {
            Some(stored.pre_keys.remove(0))
        };
        Some(stored.bundle(pre_key))
    }

    fn group(&self, iq: &Node) -> IqResult {
        let Ok(Jid::Group(group)) = iq.jid_attr("to") else {
            return Err(bad_request("group query without a group"));
        };
        let members = self
            .groups
            .get(&group)
            .map(|m| m.clone())
            .ok_or_else(|| (404, "item-not-found".to_string()))?;
        Ok(vec![Node::new("group").with_children(
            members
                .iter()
                .map(|u| Node::new("participant").attr("jid", *u))
                .collect(),
        )])
    }

    fn app_state(&self, from: DeviceAddress, iq: &Node) -> IqResult {
        let collection = iq
            .child("sync")
            .and_then(|s| s.child("collection"))
            .ok_or_else(|| bad_request("missing collection"))?;
        let name = collection.str_attr("name").map_err(bad_request)?.to_string();
        let version = collection.u64_attr("version").map_err(bad_request)?;
        let key = (from.user, name.clone());

        if let Some(patch) = collection.child("patch") {
            let bytes = patch.require_bytes().map_err(bad_request)?.to_vec();
            let latest = {
                let mut patches = self.app_state.entry(key).or_default();
                if patches.len() as u64 != version {
                    return Err((409, "conflict".to_string()));
                }
                patches.push(bytes);
                patches.len() as u64
            };
            self.notify_sync(from, &name);
            return Ok(vec![Node::new("sync").with_children(vec![Node::new("collection")
                .attr("name", name)
                .attr("version", latest)])]);
        }

        let patches = self
            .app_state
            .get(&key)
            .map(|p| p.clone())
            .unwrap_or_default();
        let latest = patches.len() as u64;
        let newer = patches
            .into_iter()
            .skip(usize::try_from(version).unwrap_or(usize::MAX))
            .map(|bytes| Node::new("patch").with_bytes(bytes))
            .collect();
        Ok(vec![Node::new("sync").with_children(vec![Node::new("collection")
            .attr("name", name)
            .attr("version", latest)
            .with_children(vec![Node::new("patches").with_children(newer)])])])
    }

    fn notify_sync(&self, writer: DeviceAddress, name: &str) {
        for device in self.devices_of(&writer.user) {
            if device == writer {
                continue;
            }
            self.send_to(
                device,
                Node::new("notification")
                    .attr("id", uuid::Uuid::new_v4().to_string())
                    .attr("type", "server_sync")
                    .attr("from", writer.user)
                    .with_children(vec![Node::new("collection").attr("name", name)]),
            );
        }
    }

    fn route_message(&self, from: DeviceAddress, node: Node) {
        let Ok(id) = node.str_attr("id").map(str::to_owned) else {
            return;
        };
        let Ok(to) = node.jid_attr("to") else {
            return;
        };

        if let Jid::Device(target) = to {
            // A re-send addressed to exactly one device.
            let mut forwarded = node;
            forwarded.attrs.remove("to");
            self.forward(target, forwarded.attr("from", from));
            return;
        }

        let pairwise: HashMap<DeviceAddress, Node> = node
            .child("participants")
            .map(|p| {
                p.children_by_tag("to")
                    .filter_map(|entry| match entry.jid_attr("jid") {
                        Ok(Jid::Device(device)) => {
                            entry.child("enc").map(|enc| (device, enc.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let group_enc = node
            .children_by_tag("enc")
            .find(|e| e.get_str("type") == Some("skmsg"))
            .cloned();
        let identity = node.child("device-identity").cloned();

        let (recipients, phash) = match to {
            Jid::Group(group) => {
                let members = self.groups.get(&group).map(|m| m.clone()).unwrap_or_default();
                let devices: Vec<DeviceAddress> =
                    members.iter().flat_map(|u| self.devices_of(u)).collect();
                let phash = participant_hash(&devices);
                let recipients = devices.into_iter().filter(|d| *d != from).collect();
                (recipients, Some(phash))
            }
            _ => (pairwise.keys().copied().collect::<Vec<_>>(), None),
        };

        for device in recipients {
            let mut children: Vec<Node> = pairwise.get(&device).cloned().into_iter().collect();
            children.extend(group_enc.clone());
            if children.is_empty() {
                continue;
            }
            children.extend(identity.clone());
            let mut message = Node::new("message")
                .attr("id", id.as_str())
                .attr("from", from)
                .opt_attr("type", node.get_str("type"))
                .opt_attr("t", node.opt_u64_attr("t").ok().flatten());
            if to.is_group() {
                message = message.attr("chat", to);
            }
            self.forward(device, message.with_children(children));
        }

        self.send_to(
            from,
            Node::new("ack")
                .attr("class", "message")
                .attr("id", id)
                .opt_attr("phash", phash),
        );
    }

    fn route_receipt(&self, from: DeviceAddress, node: Node) {
        let Ok(Jid::Device(target)) = node.jid_attr("to") else {
            return;
        };
        let mut forwarded = node;
        forwarded.attrs.remove("to");
        let forwarded = forwarded.attr("from", from);
        if let Ok(mut log) = self.receipts.lock() {
            log.push((target, forwarded.clone()));
        }
        self.send_to(target, forwarded);
    }
}

async fn serve(state: Arc<RelayState>, keys: Arc<RelayKeys>, connection: MemoryConnection) {
    let accepted = socket::accept(
        Box::new(connection.sink),
        Box::new(connection.stream),
        &keys.static_key,
        &keys.certificate,
    )
    .await;
    let AcceptedSocket {
        mut sink,
        mut stream,
        payload,
        ..
    } = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::debug!(error = %e, "relay handshake failed");
            return;
        }
    };
    let address = payload.address;

    let (tx, mut rx) = mpsc::unbounded_channel::<Node>();
    let writer = tokio::spawn(async move {
        while let Some(node) = rx.recv().await {
            let Ok(frame) = JsonCodec.encode(&node) else {
                continue;
            };
            if sink.send(&frame).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(Node::new("success"));
    state.register(address, tx.clone());

    while let Ok(Some(frame)) = stream.next().await {
        if let Ok(node) = JsonCodec.decode(&frame) {
            state.handle(address, node);
        }
    }
    state
        .online
        .remove_if(&address, |_, current| current.same_channel(&tx));
    writer.abort();
}

/// The relay and the trust root clients are configured with.
pub struct Relay {
    state: Arc<RelayState>,
    root: IdentityKeyPair,
    transport: MemoryTransport,
    accept_task: JoinHandle<()>,
}

impl Relay {
    pub fn start() -> Self {
        let (transport, mut listener) = MemoryTransport::pair();
        let root = IdentityKeyPair::generate(&mut rand::rng());
        let static_key = KeyPair::generate();
        let certificate =
            NoiseCertificate::issue(&root, "test-relay", static_key.public_bytes(), i64::MAX)
                .unwrap();
        let keys = Arc::new(RelayKeys {
            static_key,
            certificate,
        });
        let state = Arc::new(RelayState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(connection) = listener.accept().await {
                tokio::spawn(serve(accept_state.clone(), keys.clone(), connection));
            }
        });
        Self {
            state,
            root,
            transport,
            accept_task,
        }
    }

    /// Client config trusting this relay, with short timeouts.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            trusted_root_key: Some(STANDARD.encode(self.root.identity_key().serialize())),
            request_timeout_secs: 5,
            handshake_timeout_secs: 5,
            pre_key_upload_batch: 10,
            ..ClientConfig::default()
        }
    }

    pub fn create_group(&self, members: Vec<UserId>) -> GroupId {
        let group = GroupId::new();
        self.state.groups.insert(group, members);
        group
    }

    /// Times a bundle for `device` was handed out.
    pub fn bundle_fetches(&self, device: &DeviceAddress) -> usize {
        self.state.bundle_fetches.get(device).map_or(0, |c| *c)
    }

    /// Messages delivered to `device` so far.
    pub fn delivered_to(&self, device: &DeviceAddress) -> Vec<Node> {
        self.state
            .forwarded
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == device)
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// List a device for `address.user` that never uploaded keys, so bundle
    /// fetches for it fail.
    pub fn add_device_without_keys(&self, address: DeviceAddress) {
        self.state
            .devices
            .entry(address.user)
            .or_default()
            .insert(address.device);
    }

    /// Publish a copy of `from`'s keys for `to` with the signed pre-key
    /// signature broken, so sessions with `to` cannot be started.
    pub fn add_device_with_bad_keys(&self, from: &DeviceAddress, to: DeviceAddress) {
        let mut upload = self.state.keys.get(from).unwrap().clone();
        upload.signed_pre_key_signature[0] ^= 0xFF;
        self.state.keys.insert(to, upload);
        self.add_device_without_keys(to);
    }

    /// Retry receipts routed to `device` so far.
    pub fn retry_receipts_to(&self, device: &DeviceAddress) -> Vec<Node> {
        self.state
            .receipts
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, node)| to == device && node.get_str("type") == Some("retry"))
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Stop (or resume) answering keepalive pings.
    pub fn ignore_pings(&self, ignore: bool) {
        self.state.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Push a node to a device as if the relay had produced it.
    pub fn inject(&self, to: DeviceAddress, node: Node) {
        self.state.send_to(to, node);
    }

    /// Append a patch to a user's category without any checks.
    pub fn push_app_state_patch(&self, user: UserId, name: &str, patch: Vec<u8>) {
        self.state
            .app_state
            .entry((user, name.to_string()))
            .or_default()
            .push(patch);
    }

    /// Build and connect a client for `address`, waiting until it is online
    /// with its pre-keys uploaded.
    pub async fn connect(&self, address: DeviceAddress) -> TestClient {
        self.connect_with(address, self.config()).await
    }

    pub async fn connect_with(&self, address: DeviceAddress, config: ClientConfig) -> TestClient {
        self.connect_built(address, config, None).await
    }

    /// Like [`Relay::connect`], with an application message lookup.
    pub async fn connect_with_lookup(
        &self,
        address: DeviceAddress,
        lookup: Arc<dyn MessageLookup>,
    ) -> TestClient {
        self.connect_built(address, self.config(), Some(lookup)).await
    }

    async fn connect_built(
        &self,
        address: DeviceAddress,
        config: ClientConfig,
        lookup: Option<Arc<dyn MessageLookup>>,
    ) -> TestClient {
        let mut builder =
            Client::builder(address, Arc::new(self.transport.clone())).config(config);
        if let Some(lookup) = lookup {
            builder = builder.message_lookup(lookup);
        }
        let client = builder.build().await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        client.add_event_handler(move |event| {
            let _ = tx.send(event.clone());
        });
        let runner = client.clone();
        let task = tokio::spawn(async move {
            let _ = runner.run().await;
        });
        let mut test_client = TestClient {
            client,
            events,
            task,
        };
        test_client
            .wait_for(|e| matches!(e, Event::Connected))
            .await;
        test_client
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// A running client and the events it has emitted.
pub struct TestClient {
    pub client: Client,
    events: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<()>,
}

impl TestClient {
    pub fn address(&self) -> DeviceAddress {
        self.client.address()
    }

    /// Skip events until one matches. Panics after [`WAIT`].
    pub async fn wait_for<F>(&mut self, mut matches: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    }

    pub async fn next_message(&mut self) -> courier_client::events::MessageEvent {
        match self.wait_for(|e| matches!(e, Event::Message(_))).await {
            Event::Message(message) => message,
            _ => unreachable!(),
        }
    }

    /// Events that arrive within `window`, without waiting for any in
    /// particular.
    pub async fn drain(&mut self, window: Duration) -> Vec<Event> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.disconnect();
        self.task.abort();
    }
}
