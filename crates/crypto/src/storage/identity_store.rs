//! IdentityKeyStore implementation for SqliteStore.

use async_trait::async_trait;
use courier_shared::ids::DeviceAddress;
use libsignal_protocol::{IdentityChange, IdentityKey, IdentityKeyPair};

use crate::error::CryptoError;
use crate::storage::{
    decode_identity_pair, encode_identity_pair, unix_now, IdentityKeyStore, SqliteStore,
};

fn load_trusted(
    conn: &rusqlite::Connection,
    address: &DeviceAddress,
) -> Result<Option<Vec<u8>>, CryptoError> {
    match conn.query_row(
        "SELECT identity_key FROM crypto_trusted_identities WHERE address = ?1 AND device_id = ?2",
        rusqlite::params![address.user.to_string(), address.device],
        |row| row.get::<_, Vec<u8>>(0),
    ) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl IdentityKeyStore for SqliteStore {
    async fn get_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT public_key, private_key FROM crypto_identity_keys WHERE id = 1",
                [],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            ) {
                Ok((public, private)) => Ok(Some(decode_identity_pair(&public, &private)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT registration_id FROM crypto_identity_keys WHERE id = 1",
                [],
                |row| row.get::<_, u32>(0),
            ) {
                Ok(id) => Ok(Some(id)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn store_local_identity(
        &self,
        keypair: &IdentityKeyPair,
        registration_id: u32,
    ) -> Result<(), CryptoError> {
        let (public, private) = encode_identity_pair(keypair);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO crypto_identity_keys (id, public_key, private_key, registration_id, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4)",
                rusqlite::params![public, private, registration_id, unix_now()],
            )?;
            Ok(())
        })
    }

    async fn save_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError> {
        let key_bytes = identity.serialize();
        self.with_transaction(|conn| {
            let changed = load_trusted(conn, address)?
                .is_some_and(|existing| existing.as_slice() != key_bytes.as_ref());

            conn.execute(
                "INSERT INTO crypto_trusted_identities (address, device_id, identity_key, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(address, device_id) DO UPDATE SET identity_key = excluded.identity_key",
                rusqlite::params![
                    address.user.to_string(),
                    address.device,
                    key_bytes.as_ref(),
                    unix_now()
                ],
            )?;

            Ok(IdentityChange::from_changed(changed))
        })
    }

    async fn is_trusted_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        self.with_conn(|conn| {
            Ok(match load_trusted(conn, address)? {
                Some(stored) => stored.as_slice() == identity.serialize().as_ref(),
                None => true,
            })
        })
    }

    async fn get_identity(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<IdentityKey>, CryptoError> {
        self.with_conn(|conn| {
            load_trusted(conn, address)?
                .map(|bytes| {
                    IdentityKey::decode(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
                })
                .transpose()
        })
    }

    async fn remove_identity(&self, address: &DeviceAddress) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM crypto_trusted_identities WHERE address = ?1 AND device_id = ?2",
                rusqlite::params![address.user.to_string(), address.device],
            )?;
            Ok(())
        })
    }
}
