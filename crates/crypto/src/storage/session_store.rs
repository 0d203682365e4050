//! SessionStore implementation for SqliteStore.

use async_trait::async_trait;
use courier_shared::ids::DeviceAddress;
use libsignal_protocol::SessionRecord;

use crate::error::CryptoError;
use crate::storage::{unix_now, SessionStore, SqliteStore};

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_session(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<SessionRecord>, CryptoError> {
        self.with_conn(|conn| {
            match conn.query_row(
                "SELECT session_data FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
                rusqlite::params![address.user.to_string(), address.device],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn store_session(
        &self,
        address: &DeviceAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError> {
        let session_bytes = record.serialize()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO crypto_sessions (address, device_id, session_data, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(address, device_id) DO UPDATE SET
                     session_data = excluded.session_data,
                     last_used_at = excluded.last_used_at",
                rusqlite::params![
                    address.user.to_string(),
                    address.device,
                    session_bytes,
                    unix_now()
                ],
            )?;
            Ok(())
        })
    }

    async fn delete_session(&self, address: &DeviceAddress) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
                rusqlite::params![address.user.to_string(), address.device],
            )?;
            Ok(())
        })
    }
}
