//! Versioned schema migrations for the SQLite store, tracked in a
//! `_crypto_migrations` table so they never collide with an embedding
//! application's own migration bookkeeping.

use crate::error::CryptoError;
use rusqlite::{params, Connection};

const MIGRATIONS: &[(i32, &str)] = &[
    (1, MIGRATION_001),
    (2, MIGRATION_002),
    (3, MIGRATION_003),
];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS crypto_identity_keys (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    public_key      BLOB NOT NULL,
    private_key     BLOB NOT NULL,
    registration_id INTEGER NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_trusted_identities (
    address       TEXT NOT NULL,
    device_id     INTEGER NOT NULL,
    identity_key  BLOB NOT NULL,
    first_seen_at INTEGER NOT NULL,
    PRIMARY KEY (address, device_id)
);

CREATE TABLE IF NOT EXISTS crypto_pre_keys (
    key_id     INTEGER PRIMARY KEY,
    record     BLOB NOT NULL,
    uploaded   INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_signed_pre_keys (
    key_id     INTEGER PRIMARY KEY,
    record     BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_sessions (
    address      TEXT NOT NULL,
    device_id    INTEGER NOT NULL,
    session_data BLOB NOT NULL,
    created_at   INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    PRIMARY KEY (address, device_id)
);

CREATE TABLE IF NOT EXISTS crypto_sender_keys (
    group_id      TEXT NOT NULL,
    sender        TEXT NOT NULL,
    sender_device INTEGER NOT NULL,
    record        BLOB NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (group_id, sender, sender_device)
);

CREATE TABLE IF NOT EXISTS crypto_config (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

const MIGRATION_002: &str = "
CREATE TABLE IF NOT EXISTS crypto_sync_keys (
    key_id    BLOB PRIMARY KEY,
    key_data  BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_app_state_versions (
    name    TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    hash    BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_app_state_mutation_macs (
    name      TEXT NOT NULL,
    index_mac BLOB NOT NULL,
    value_mac BLOB NOT NULL,
    PRIMARY KEY (name, index_mac)
);
";

const MIGRATION_003: &str = "
CREATE TABLE IF NOT EXISTS crypto_kyber_pre_keys (
    key_id     INTEGER PRIMARY KEY,
    record     BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
";

const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS _crypto_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
)";

/// Apply every migration newer than the recorded version. Each one commits
/// together with its bookkeeping row.
pub fn run_crypto_migrations(conn: &Connection) -> Result<(), CryptoError> {
    conn.execute_batch(MIGRATIONS_TABLE)?;
    let applied: i32 = conn.query_row(
        "SELECT IFNULL(MAX(version), 0) FROM _crypto_migrations",
        [],
        |row| row.get(0),
    )?;

    let pending = MIGRATIONS.iter().filter(|(version, _)| *version > applied);
    for &(version, sql) in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO _crypto_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;
        tracing::debug!(version, "applied crypto migration");
    }
    Ok(())
}
