use rusqlite::Connection;

use crate::error::StoreError;

/// Bumped on any incompatible layout change. A mismatch on open wipes the
/// database rather than misinterpreting old rows.
pub const SCHEMA_VERSION: u32 = 1;

pub fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- Sealed record store. Ordering metadata stays in the clear so the
        -- range index works; content is an AES-GCM blob.
        CREATE TABLE IF NOT EXISTS records (
            id              TEXT PRIMARY KEY,
            order_key       INTEGER NOT NULL,
            time            INTEGER NOT NULL,   -- unix epoch seconds
            content         BLOB NOT NULL,
            decrypt_failed  INTEGER NOT NULL DEFAULT 0,
            updated_at      INTEGER NOT NULL    -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_records_position
            ON records(time DESC, order_key DESC);
        CREATE INDEX IF NOT EXISTS idx_records_decrypt_failed
            ON records(decrypt_failed) WHERE decrypt_failed = 1;

        -- Scalar session/resume state: schema version, event cursor,
        -- build progress, enabled/paused flags.
        CREATE TABLE IF NOT EXISTS flags (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
    ",
    )?;

    Ok(())
}
