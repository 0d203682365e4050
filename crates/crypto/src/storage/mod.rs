//! Key and session storage.
//!
//! The crate talks to storage only through the traits below, which hold
//! libsignal records keyed by Courier device addresses. Every getter returns
//! `Ok(None)` for absent data, so "not found" is never confused with a
//! backend failure. [`SignalStore`] presents any of them to libsignal
//! through its own store traits. Two backends ship: [`MemoryStore`] for
//! tests and ephemeral clients, and [`SqliteStore`] for persistent ones.

pub mod memory;
pub mod migrations;
pub mod identity_store;
pub mod pre_key_store;
pub mod signed_pre_key_store;
pub mod kyber_pre_key_store;
pub mod session_store;
pub mod sender_key_store;
pub mod signal;
pub mod sync_store;

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use courier_shared::ids::{DeviceAddress, GroupId};
use libsignal_protocol::{
    IdentityChange, IdentityKey, IdentityKeyPair, KyberPreKeyRecord, PreKeyRecord, PrivateKey,
    SenderKeyRecord, SessionRecord, SignedPreKeyRecord,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub use memory::MemoryStore;
pub use signal::SignalStore;

#[async_trait]
pub trait IdentityKeyStore: Send + Sync {
    async fn get_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError>;
    async fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError>;
    async fn store_local_identity(
        &self,
        keypair: &IdentityKeyPair,
        registration_id: u32,
    ) -> Result<(), CryptoError>;

    async fn save_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError>;
    /// Trust on first use: an unknown address is trusted, a known one only
    /// with the identity stored for it.
    async fn is_trusted_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError>;
    async fn get_identity(&self, address: &DeviceAddress)
        -> Result<Option<IdentityKey>, CryptoError>;
    async fn remove_identity(&self, address: &DeviceAddress) -> Result<(), CryptoError>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn get_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError>;
    /// Save a batch as not yet uploaded and advance the id counter past it.
    async fn save_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), CryptoError>;
    async fn remove_pre_key(&self, id: u32) -> Result<(), CryptoError>;
    async fn next_pre_key_id(&self) -> Result<u32, CryptoError>;
    async fn mark_pre_keys_uploaded(&self, ids: &[u32]) -> Result<(), CryptoError>;
    async fn count_uploaded_pre_keys(&self) -> Result<usize, CryptoError>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn get_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError>;
    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError>;
    async fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, CryptoError>;
    async fn next_signed_pre_key_id(&self) -> Result<u32, CryptoError>;
}

/// Last-resort Kyber pre-keys. One is generated beside every signed
/// pre-key, under the same id, and is never consumed.
#[async_trait]
pub trait KyberPreKeyStore: Send + Sync {
    async fn get_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, CryptoError>;
    async fn save_kyber_pre_key(&self, record: &KyberPreKeyRecord) -> Result<(), CryptoError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &DeviceAddress)
        -> Result<Option<SessionRecord>, CryptoError>;
    async fn store_session(
        &self,
        address: &DeviceAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError>;
    async fn delete_session(&self, address: &DeviceAddress) -> Result<(), CryptoError>;

    /// A record only counts once it holds a current session; a fresh or
    /// fully archived record does not.
    async fn has_session(&self, address: &DeviceAddress) -> Result<bool, CryptoError> {
        Ok(self
            .load_session(address)
            .await?
            .is_some_and(|record| record.remote_registration_id().is_ok()))
    }
}

#[async_trait]
pub trait SenderKeyStore: Send + Sync {
    async fn load_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
    ) -> Result<Option<SenderKeyRecord>, CryptoError>;
    async fn store_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
        record: &SenderKeyRecord,
    ) -> Result<(), CryptoError>;
}

/// Key material for app-state mutations, shared between a user's devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKey {
    pub key_id: Vec<u8>,
    pub key_data: [u8; 32],
    /// Unix seconds when the key was created by the issuing device.
    pub timestamp: i64,
}

/// Persisted state of one app-state category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateVersion {
    pub version: u64,
    pub hash: Vec<u8>,
}

/// Value MAC change for one mutation index. `None` removes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationMac {
    pub index_mac: Vec<u8>,
    pub value_mac: Option<Vec<u8>>,
}

/// Everything a successful app-state fetch persists, applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateCommit {
    pub name: String,
    pub state: AppStateVersion,
    /// Drop every stored index before applying `mutations` (snapshots).
    pub replace_all: bool,
    pub mutations: Vec<MutationMac>,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<SyncKey>, CryptoError>;
    async fn store_sync_key(&self, key: &SyncKey) -> Result<(), CryptoError>;
    /// Most recently created key, used to encrypt our own mutations.
    async fn latest_sync_key(&self) -> Result<Option<SyncKey>, CryptoError>;
    async fn get_app_state_version(&self, name: &str)
        -> Result<Option<AppStateVersion>, CryptoError>;
    async fn get_mutation_mac(
        &self,
        name: &str,
        index_mac: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError>;
    async fn commit_app_state(&self, commit: &AppStateCommit) -> Result<(), CryptoError>;
}

/// Everything the protocol needs from one store.
///
/// Cipher operations drive store futures to completion on the calling
/// thread (see [`SignalStore`]), so implementations must never wait on the
/// async runtime: hold only short, synchronous locks.
pub trait ProtocolStore:
    IdentityKeyStore
    + PreKeyStore
    + SignedPreKeyStore
    + KyberPreKeyStore
    + SessionStore
    + SenderKeyStore
    + SyncStore
{
}

impl<T> ProtocolStore for T where
    T: IdentityKeyStore
        + PreKeyStore
        + SignedPreKeyStore
        + KyberPreKeyStore
        + SessionStore
        + SenderKeyStore
        + SyncStore
        + ?Sized
{
}

/// SQLite-backed store. The connection is guarded by a mutex; every trait
/// method holds it only for the duration of its queries.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and run pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CryptoError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CryptoError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_crypto_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| CryptoError::StorageError("connection mutex poisoned".into()))?;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
    }
}

pub(crate) fn get_config(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
    match conn.query_row(
        "SELECT value FROM crypto_config WHERE key = ?1",
        [key],
        |row| row.get(0),
    ) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn set_config(conn: &Connection, key: &str, value: &[u8]) -> Result<(), CryptoError> {
    conn.execute(
        "INSERT INTO crypto_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Identity keypairs are stored as (serialized identity key, private key).
pub(crate) fn encode_identity_pair(keypair: &IdentityKeyPair) -> (Vec<u8>, Vec<u8>) {
    (
        keypair.identity_key().serialize().to_vec(),
        keypair.private_key().serialize().to_vec(),
    )
}

pub(crate) fn decode_identity_pair(public: &[u8], private: &[u8]) -> Result<IdentityKeyPair, CryptoError> {
    let identity_key =
        IdentityKey::decode(public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let private_key =
        PrivateKey::deserialize(private).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(IdentityKeyPair::new(identity_key, private_key))
}

/// Create an in-memory store with migrations applied, for tests.
#[cfg(test)]
pub(crate) fn init_test_db() -> SqliteStore {
    SqliteStore::open_in_memory().expect("in-memory sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_round_trip_and_overwrite() {
        let store = init_test_db();
        store
            .with_conn(|conn| {
                assert!(get_config(conn, "k")?.is_none());
                set_config(conn, "k", b"one")?;
                set_config(conn, "k", b"two")?;
                assert_eq!(get_config(conn, "k")?.unwrap(), b"two");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = init_test_db();
        let result: Result<(), CryptoError> = store.with_transaction(|conn| {
            set_config(conn, "k", b"v")?;
            Err(CryptoError::StorageError("boom".into()))
        });
        assert!(result.is_err());
        let value = store.with_conn(|conn| get_config(conn, "k")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        // Re-opening applies no migration twice.
        SqliteStore::open(&path).unwrap();
    }
}
