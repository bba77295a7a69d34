use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (chat + attendance schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                deleted_at  INTEGER
            );

            -- seq gives the canonical insertion order used by pagination
            CREATE TABLE messages (
                seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
                id                  TEXT NOT NULL UNIQUE,
                event_id            TEXT NOT NULL,
                sender_id           TEXT,
                sender_name         TEXT NOT NULL,
                text                TEXT,
                created_at          INTEGER NOT NULL,
                edited_at           INTEGER,
                edit_count          INTEGER NOT NULL DEFAULT 0 CHECK (edit_count <= 1),
                is_pinned           INTEGER NOT NULL DEFAULT 0,
                reply_to            TEXT,
                attachment_url      TEXT,
                attachment_name     TEXT,
                attachment_mime     TEXT,
                attachment_size     INTEGER,
                unsent_at           INTEGER
            );

            CREATE INDEX idx_messages_event ON messages(event_id, seq);

            CREATE UNIQUE INDEX idx_messages_single_pin
                ON messages(event_id) WHERE is_pinned = 1;

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE uploads (
                id          TEXT PRIMARY KEY,
                uploader_id TEXT NOT NULL,
                filename    TEXT NOT NULL,
                mime_type   TEXT NOT NULL,
                size_bytes  INTEGER NOT NULL,
                sha256      TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE registrations (
                id              TEXT PRIMARY KEY,
                event_id        TEXT NOT NULL,
                volunteer_id    TEXT NOT NULL,
                has_attended    INTEGER NOT NULL DEFAULT 0,
                in_time         INTEGER,
                out_time        INTEGER,
                exit_qr_token   TEXT UNIQUE,
                created_at      INTEGER NOT NULL,
                UNIQUE (event_id, volunteer_id)
            );

            CREATE INDEX idx_registrations_event ON registrations(event_id);

            CREATE TABLE consumed_exit_tokens (
                token           TEXT PRIMARY KEY,
                registration_id TEXT NOT NULL REFERENCES registrations(id),
                consumed_at     INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
