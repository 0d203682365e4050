//! PreKeyStore implementation for SqliteStore.

use async_trait::async_trait;
use courier_shared::constants::MAX_PRE_KEY_ID;
use libsignal_protocol::PreKeyRecord;

use crate::error::CryptoError;
use crate::storage::{get_config, set_config, unix_now, PreKeyStore, SqliteStore};

const NEXT_PRE_KEY_ID: &str = "next_pre_key_id";

#[async_trait]
impl PreKeyStore for SqliteStore {
    async fn get_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT record FROM crypto_pre_keys WHERE key_id = ?1",
                [id],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(bytes) => Ok(Some(PreKeyRecord::deserialize(&bytes)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn save_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), CryptoError> {
        let encoded = records
            .iter()
            .map(|r| Ok((u32::from(r.id()?), r.serialize()?)))
            .collect::<Result<Vec<_>, CryptoError>>()?;
        let Some(&(last, _)) = encoded.last() else {
            return Ok(());
        };
        let next = last % MAX_PRE_KEY_ID + 1;
        let now = unix_now();

        self.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT OR REPLACE INTO crypto_pre_keys (key_id, record, uploaded, created_at)
                 VALUES (?1, ?2, 0, ?3)",
            )?;
            for (id, bytes) in &encoded {
                stmt.execute(rusqlite::params![id, bytes, now])?;
            }
            set_config(conn, NEXT_PRE_KEY_ID, &next.to_be_bytes())
        })
    }

    async fn remove_pre_key(&self, id: u32) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM crypto_pre_keys WHERE key_id = ?1", [id])?;
            Ok(())
        })
    }

    async fn next_pre_key_id(&self) -> Result<u32, CryptoError> {
        self.with_conn(|conn| match get_config(conn, NEXT_PRE_KEY_ID)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::StorageError("invalid next_pre_key_id".into()))?;
                Ok(u32::from_be_bytes(bytes))
            }
            None => Ok(1),
        })
    }

    async fn mark_pre_keys_uploaded(&self, ids: &[u32]) -> Result<(), CryptoError> {
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare("UPDATE crypto_pre_keys SET uploaded = 1 WHERE key_id = ?1")?;
            for id in ids {
                stmt.execute([id])?;
            }
            Ok(())
        })
    }

    async fn count_uploaded_pre_keys(&self) -> Result<usize, CryptoError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM crypto_pre_keys WHERE uploaded = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}
