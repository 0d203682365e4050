//! KyberPreKeyStore implementation for SqliteStore.

use async_trait::async_trait;
use libsignal_protocol::{GenericSignedPreKey, KyberPreKeyRecord};

use crate::error::CryptoError;
use crate::storage::{unix_now, KyberPreKeyStore, SqliteStore};

#[async_trait]
impl KyberPreKeyStore for SqliteStore {
    async fn get_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT record FROM crypto_kyber_pre_keys WHERE key_id = ?1",
                [id],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(bytes) => Ok(Some(KyberPreKeyRecord::deserialize(&bytes)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn save_kyber_pre_key(&self, record: &KyberPreKeyRecord) -> Result<(), CryptoError> {
        let id = u32::from(record.id()?);
        let bytes = record.serialize()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO crypto_kyber_pre_keys (key_id, record, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, bytes, unix_now()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;
    use futures::executor::block_on;
    use libsignal_protocol::{kem, KeyPair, KyberPreKeyId};

    fn record(id: u32) -> KyberPreKeyRecord {
        let signing_key = KeyPair::generate(&mut rand::rng());
        KyberPreKeyRecord::generate(
            kem::KeyType::Kyber1024,
            KyberPreKeyId::from(id),
            &signing_key.private_key,
        )
        .unwrap()
    }

    #[test]
    fn save_then_get_kyber_pre_key_round_trips() {
        let store = init_test_db();
        let saved = record(1);
        block_on(store.save_kyber_pre_key(&saved)).unwrap();

        let loaded = block_on(store.get_kyber_pre_key(1)).unwrap().unwrap();
        assert_eq!(loaded.serialize().unwrap(), saved.serialize().unwrap());
    }

    #[test]
    fn unknown_kyber_pre_key_is_none() {
        let store = init_test_db();
        assert!(block_on(store.get_kyber_pre_key(99999)).unwrap().is_none());
    }
}
