//! v001 -- Initial schema creation.
//!
//! One table holds every document; the path is the primary key and the
//! collection column supports the range queries and subscription matching.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    path       TEXT PRIMARY KEY NOT NULL,   -- collection/id[/subcollection/id]
    collection TEXT NOT NULL,               -- path minus the final id segment
    data       TEXT NOT NULL,               -- JSON payload
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_documents_collection_created
    ON documents(collection, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
