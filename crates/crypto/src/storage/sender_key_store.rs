//! SenderKeyStore implementation for SqliteStore.

use async_trait::async_trait;
use courier_shared::ids::{DeviceAddress, GroupId};
use libsignal_protocol::SenderKeyRecord;

use crate::error::CryptoError;
use crate::storage::{unix_now, SenderKeyStore, SqliteStore};

#[async_trait]
impl SenderKeyStore for SqliteStore {
    async fn load_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
    ) -> Result<Option<SenderKeyRecord>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT record FROM crypto_sender_keys
                 WHERE group_id = ?1 AND sender = ?2 AND sender_device = ?3",
                rusqlite::params![group.to_string(), sender.user.to_string(), sender.device],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(bytes) => Ok(Some(SenderKeyRecord::deserialize(&bytes)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn store_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
        record: &SenderKeyRecord,
    ) -> Result<(), CryptoError> {
        let bytes = record.serialize()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO crypto_sender_keys (group_id, sender, sender_device, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_id, sender, sender_device) DO UPDATE SET
                     record = excluded.record,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    group.to_string(),
                    sender.user.to_string(),
                    sender.device,
                    bytes,
                    unix_now()
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;
    use courier_shared::ids::UserId;
    use futures::executor::block_on;

    #[test]
    fn load_sender_key_returns_none_when_absent() {
        let store = init_test_db();
        let sender = DeviceAddress::new(UserId::new(), 0);
        assert!(block_on(store.load_sender_key(&GroupId::new(), &sender))
            .unwrap()
            .is_none());
    }

    #[test]
    fn sender_keys_are_scoped_by_group() {
        let store = init_test_db();
        let sender = DeviceAddress::new(UserId::new(), 0);
        let group = GroupId::new();
        // An empty protobuf is a valid, stateless record.
        let record = SenderKeyRecord::deserialize(&[]).unwrap();
        block_on(store.store_sender_key(&group, &sender, &record)).unwrap();

        assert!(block_on(store.load_sender_key(&group, &sender))
            .unwrap()
            .is_some());
        assert!(block_on(store.load_sender_key(&GroupId::new(), &sender))
            .unwrap()
            .is_none());
    }
}
