//! SignedPreKeyStore implementation for SqliteStore.

use async_trait::async_trait;
use libsignal_protocol::{GenericSignedPreKey, SignedPreKeyRecord};

use crate::error::CryptoError;
use crate::storage::{SignedPreKeyStore, SqliteStore};

fn decode(bytes: rusqlite::Result<Vec<u8>>) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
    match bytes {
        Ok(bytes) => Ok(Some(SignedPreKeyRecord::deserialize(&bytes)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SignedPreKeyStore for SqliteStore {
    async fn get_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.with_conn(|conn| {
            decode(conn.query_row(
                "SELECT record FROM crypto_signed_pre_keys WHERE key_id = ?1",
                [id],
                |row| row.get::<_, Vec<u8>>(0),
            ))
        })
    }

    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        let id = u32::from(record.id()?);
        let created_at = i64::try_from(record.timestamp()?.epoch_millis() / 1000).unwrap_or(i64::MAX);
        let bytes = record.serialize()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO crypto_signed_pre_keys (key_id, record, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, bytes, created_at],
            )?;
            Ok(())
        })
    }

    async fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.with_conn(|conn| {
            decode(conn.query_row(
                "SELECT record FROM crypto_signed_pre_keys ORDER BY created_at DESC, key_id DESC LIMIT 1",
                [],
                |row| row.get::<_, Vec<u8>>(0),
            ))
        })
    }

    async fn next_signed_pre_key_id(&self) -> Result<u32, CryptoError> {
        self.with_conn(|conn| {
            let max: Option<u32> = conn.query_row(
                "SELECT MAX(key_id) FROM crypto_signed_pre_keys",
                [],
                |row| row.get(0),
            )?;
            Ok(max.map_or(1, |id| id + 1))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;
    use crate::prekeys::{generate_signed_pre_key, rotate_signed_pre_key};
    use crate::storage::init_test_db;
    use futures::executor::block_on;

    #[test]
    fn empty_store_has_no_signed_pre_key() {
        let store = init_test_db();
        assert!(block_on(store.latest_signed_pre_key()).unwrap().is_none());
        assert_eq!(block_on(store.next_signed_pre_key_id()).unwrap(), 1);
    }

    #[test]
    fn latest_signed_pre_key_follows_rotation() {
        let store = init_test_db();
        block_on(generate_identity(&store)).unwrap();
        let first = block_on(generate_signed_pre_key(&store)).unwrap();
        let second = block_on(rotate_signed_pre_key(&store)).unwrap();

        let first_id = u32::from(first.id().unwrap());
        let second_id = u32::from(second.id().unwrap());
        assert_eq!(second_id, first_id + 1);
        let latest = block_on(store.latest_signed_pre_key()).unwrap().unwrap();
        assert_eq!(u32::from(latest.id().unwrap()), second_id);
        assert_eq!(latest.public_key().unwrap(), second.public_key().unwrap());

        let old = block_on(store.get_signed_pre_key(first_id)).unwrap().unwrap();
        assert_eq!(old.signature().unwrap(), first.signature().unwrap());
    }
}
