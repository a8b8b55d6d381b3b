use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::error::StoreError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::file(db_path);

    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;

    Ok(pool)
}

/// Single-connection pool so every handle sees the same in-memory database.
pub fn create_memory_pool() -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    Ok(pool)
}
