use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS provider_cache (
            key         TEXT PRIMARY KEY,
            body        TEXT NOT NULL, -- JSON
            expires_at  INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_provider_cache_expires ON provider_cache(expires_at);
        ",
    )?;
    Ok(())
}
