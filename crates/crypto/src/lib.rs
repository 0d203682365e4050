//! courier-crypto: session security for Courier.
//!
//! Identity and pre-key management, pairwise sessions and sender keys on
//! top of libsignal, the Noise transport handshake, and the store traits
//! (with in-memory and SQLite backends) they all persist to.

pub mod aead;
pub mod cipher;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod padding;
pub mod prekeys;
pub mod session;
pub mod storage;
