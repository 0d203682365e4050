//! SyncStore implementation for SqliteStore: app-state sync keys, versions
//! and the index-to-value MAC map.

use async_trait::async_trait;

use crate::error::CryptoError;
use crate::storage::{AppStateCommit, AppStateVersion, SqliteStore, SyncKey, SyncStore};

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, Vec<u8>, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_key((key_id, data, timestamp): (Vec<u8>, Vec<u8>, i64)) -> Result<SyncKey, CryptoError> {
    let key_data: [u8; 32] = data
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::StorageError("sync key data must be 32 bytes".into()))?;
    Ok(SyncKey {
        key_id,
        key_data,
        timestamp,
    })
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<SyncKey>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT key_id, key_data, timestamp FROM crypto_sync_keys WHERE key_id = ?1",
                [key_id],
                row_to_key,
            ) {
                Ok(row) => decode_key(row).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn store_sync_key(&self, key: &SyncKey) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO crypto_sync_keys (key_id, key_data, timestamp)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![key.key_id, &key.key_data[..], key.timestamp],
            )?;
            Ok(())
        })
    }

    async fn latest_sync_key(&self) -> Result<Option<SyncKey>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT key_id, key_data, timestamp FROM crypto_sync_keys
                 ORDER BY timestamp DESC LIMIT 1",
                [],
                row_to_key,
            ) {
                Ok(row) => decode_key(row).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn get_app_state_version(
        &self,
        name: &str,
    ) -> Result<Option<AppStateVersion>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT version, hash FROM crypto_app_state_versions WHERE name = ?1",
                [name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            ) {
                Ok((version, hash)) => Ok(Some(AppStateVersion {
                    version: version as u64,
                    hash,
                })),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn get_mutation_mac(
        &self,
        name: &str,
        index_mac: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT value_mac FROM crypto_app_state_mutation_macs
                 WHERE name = ?1 AND index_mac = ?2",
                rusqlite::params![name, index_mac],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(mac) => Ok(Some(mac)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn commit_app_state(&self, commit: &AppStateCommit) -> Result<(), CryptoError> {
        self.with_transaction(|conn| {
            if commit.replace_all {
                conn.execute(
                    "DELETE FROM crypto_app_state_mutation_macs WHERE name = ?1",
                    [&commit.name],
                )?;
            }
            for mutation in &commit.mutations {
                match &mutation.value_mac {
                    Some(value_mac) => conn.execute(
                        "INSERT OR REPLACE INTO crypto_app_state_mutation_macs (name, index_mac, value_mac)
                         VALUES (?1, ?2, ?3)",
                        rusqlite::params![commit.name, mutation.index_mac, value_mac],
                    )?,
                    None => conn.execute(
                        "DELETE FROM crypto_app_state_mutation_macs WHERE name = ?1 AND index_mac = ?2",
                        rusqlite::params![commit.name, mutation.index_mac],
                    )?,
                };
            }
            conn.execute(
                "INSERT INTO crypto_app_state_versions (name, version, hash) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET version = excluded.version, hash = excluded.hash",
                rusqlite::params![commit.name, commit.state.version as i64, commit.state.hash],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, MutationMac};
    use futures::executor::block_on;

    fn commit(version: u64, replace_all: bool, mutations: Vec<MutationMac>) -> AppStateCommit {
        AppStateCommit {
            name: "regular".into(),
            state: AppStateVersion {
                version,
                hash: vec![version as u8; 128],
            },
            replace_all,
            mutations,
        }
    }

    fn set(index: u8, value: u8) -> MutationMac {
        MutationMac {
            index_mac: vec![index],
            value_mac: Some(vec![value]),
        }
    }

    #[test]
    fn sync_keys_round_trip_and_latest_wins() {
        let store = init_test_db();
        let old = SyncKey {
            key_id: vec![1],
            key_data: [1; 32],
            timestamp: 100,
        };
        let new = SyncKey {
            key_id: vec![2],
            key_data: [2; 32],
            timestamp: 200,
        };
        block_on(store.store_sync_key(&old)).unwrap();
        block_on(store.store_sync_key(&new)).unwrap();

        assert_eq!(block_on(store.get_sync_key(&[1])).unwrap(), Some(old));
        assert_eq!(block_on(store.latest_sync_key()).unwrap(), Some(new));
        assert!(block_on(store.get_sync_key(&[9])).unwrap().is_none());
    }

    #[test]
    fn commit_applies_versions_and_macs() {
        let store = init_test_db();
        assert!(block_on(store.get_app_state_version("regular"))
            .unwrap()
            .is_none());

        block_on(store.commit_app_state(&commit(1, true, vec![set(1, 10), set(2, 20)]))).unwrap();
        block_on(store.commit_app_state(&commit(
            2,
            false,
            vec![
                set(1, 11),
                MutationMac {
                    index_mac: vec![2],
                    value_mac: None,
                },
            ],
        )))
        .unwrap();

        let state = block_on(store.get_app_state_version("regular"))
            .unwrap()
            .unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(
            block_on(store.get_mutation_mac("regular", &[1])).unwrap(),
            Some(vec![11])
        );
        assert!(block_on(store.get_mutation_mac("regular", &[2]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn snapshot_commit_replaces_existing_indexes() {
        let store = init_test_db();
        block_on(store.commit_app_state(&commit(3, true, vec![set(1, 10)]))).unwrap();
        block_on(store.commit_app_state(&commit(7, true, vec![set(5, 50)]))).unwrap();

        assert!(block_on(store.get_mutation_mac("regular", &[1]))
            .unwrap()
            .is_none());
        assert_eq!(
            block_on(store.get_mutation_mac("regular", &[5])).unwrap(),
            Some(vec![50])
        );
    }
}
