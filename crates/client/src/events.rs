//! Application-facing events and the handler registry that delivers them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use courier_shared::ids::{DeviceAddress, Jid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::MessagePayload;

/// A decrypted inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub id: String,
    pub chat: Jid,
    pub sender: DeviceAddress,
    pub timestamp: u64,
    pub payload: MessagePayload,
    /// Sent by another of our own devices (`device_sent` unwrapped).
    pub from_own_device: bool,
}

/// Why an inbound message could not be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndecryptableKind {
    /// The sender's relay had nothing to deliver for this device.
    Unavailable,
    /// Decryption failed; the string is the error.
    DecryptFailed(String),
    /// The sender's device-identity proof did not check out. Never retried.
    VerifyFailed(String),
    /// The plaintext decrypted but is not a readable payload. Never
    /// retried: the sender would encrypt the same bytes again.
    DecodeFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppStateMutation {
    pub name: String,
    pub operation: MutationOperation,
    pub index: Vec<String>,
    pub value: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected { reason: String },
    LoggedOut,
    Message(MessageEvent),
    Undecryptable {
        id: String,
        chat: Jid,
        sender: DeviceAddress,
        unavailable: bool,
        kind: UndecryptableKind,
    },
    /// A message was re-encrypted for a device that asked for it.
    RetryResent {
        id: String,
        device: DeviceAddress,
        count: u32,
    },
    AppStateMutation(AppStateMutation),
    AppStateSynced { name: String, version: u64 },
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registered event handlers. Each call is isolated: a panicking handler is
/// logged and the remaining handlers still run.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(Arc::new(handler)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(handler)),
        }
    }

    pub fn emit(&self, event: &Event) {
        let handlers: Vec<Handler> = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(event = event_name(event), "event handler panicked");
            }
        }
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Connected => "connected",
        Event::Disconnected { .. } => "disconnected",
        Event::LoggedOut => "logged_out",
        Event::Message(_) => "message",
        Event::Undecryptable { .. } => "undecryptable",
        Event::RetryResent { .. } => "retry_resent",
        Event::AppStateMutation(_) => "app_state_mutation",
        Event::AppStateSynced { .. } => "app_state_synced",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.add_handler(|_| panic!("handler bug"));
        let counter = seen.clone();
        bus.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Event::Connected);
        bus.emit(&Event::LoggedOut);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_register_another_handler() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.add_handler(move |_| inner.add_handler(|_| {}));
        bus.emit(&Event::Connected);
        assert_eq!(bus.handlers.read().unwrap().len(), 2);
    }
}
