//! courier-client: the device side of a Courier session.
//!
//! Connects to the relay over a Noise-secured transport, keeps the
//! connection alive, and runs the message pipelines on top of
//! `courier-crypto`: fan-out send, receive with retry receipts, re-keying on
//! retry, pre-key upkeep, and app-state sync between a user's devices.

pub mod appstate;
pub mod client;
pub mod config;
mod connection;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod msgcache;
pub mod payload;
pub mod prekeys;
mod receive;
pub mod request;
pub mod retry;
pub mod send;
pub mod socket;
pub mod transport;

pub use appstate::PatchMutation;
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::Event;
pub use send::SendResult;
