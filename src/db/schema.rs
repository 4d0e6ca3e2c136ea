use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fraud_rules (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            conditions  TEXT NOT NULL, -- JSON array of conditions
            severity    TEXT NOT NULL,
            action      TEXT NOT NULL,
            is_active   INTEGER NOT NULL DEFAULT 1,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            evaluation_id      TEXT NOT NULL UNIQUE,
            user_id            TEXT NOT NULL,
            amount             REAL NOT NULL,
            transaction_type   TEXT NOT NULL,
            ip                 TEXT NOT NULL,
            device_fingerprint TEXT NOT NULL,
            latitude           REAL,
            longitude          REAL,
            recipient_id       TEXT,
            category           TEXT,
            local_hour         INTEGER NOT NULL,
            action             TEXT NOT NULL,
            created_at         INTEGER NOT NULL -- unix seconds
        );

        CREATE TABLE IF NOT EXISTS fraud_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      TEXT NOT NULL,
            kind         TEXT NOT NULL,
            confirmed_at INTEGER NOT NULL -- unix seconds
        );

        CREATE TABLE IF NOT EXISTS audit_events (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            evaluation_id TEXT,
            kind          TEXT NOT NULL,
            severity      TEXT NOT NULL,
            message       TEXT NOT NULL,
            payload       TEXT, -- JSON
            at            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_user_time ON transactions(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_fraud_events_user_time ON fraud_events(user_id, confirmed_at);
        CREATE INDEX IF NOT EXISTS idx_audit_events_severity ON audit_events(severity);
        ",
    )?;
    Ok(())
}
