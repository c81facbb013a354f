pub mod schema;

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Key/value store for provider responses with per-entry expiry.
pub struct CacheDb {
    conn: Connection,
}

/// Thread-safe wrapper around CacheDb.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<CacheDb>>,
}

impl SharedCache {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = CacheDb::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheDb> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached body for `key`, unless it expired before `now` (unix seconds).
    pub fn get(&self, key: &str, now: i64) -> Result<Option<String>, rusqlite::Error> {
        self.lock().get(key, now)
    }

    /// Store `body` under `key` until `expires_at` (unix seconds).
    pub fn put(&self, key: &str, body: &str, expires_at: i64) -> Result<(), rusqlite::Error> {
        self.lock().put(key, body, expires_at)
    }

    /// Delete entries that expired before `now`.
    pub fn purge_expired(&self, now: i64) -> Result<usize, rusqlite::Error> {
        self.lock().purge_expired(now)
    }

    /// Total entry count, expired or not.
    pub fn len(&self) -> Result<usize, rusqlite::Error> {
        self.lock().len()
    }
}

impl CacheDb {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn get(&self, key: &str, now: i64) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT body FROM provider_cache WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![key, now],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn put(&self, key: &str, body: &str, expires_at: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO provider_cache (key, body, expires_at, created_at)
             VALUES (?1, ?2, ?3, datetime('now'))",
            rusqlite::params![key, body, expires_at],
        )?;
        Ok(())
    }

    pub fn purge_expired(&self, now: i64) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "DELETE FROM provider_cache WHERE expires_at <= ?1",
            rusqlite::params![now],
        )
    }

    pub fn len(&self) -> Result<usize, rusqlite::Error> {
        self.conn.query_row("SELECT COUNT(*) FROM provider_cache", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }
}
