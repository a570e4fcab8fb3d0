// Database schema definitions for the LLM backend

use super::db_error;
use rusqlite::Connection;

/// One row per configured model instance. `loader_kwargs` holds a JSON object.
const CREATE_INSTANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    backend TEXT NOT NULL,
    loader TEXT NOT NULL,
    model_path TEXT,
    model_version TEXT,
    gateway TEXT,
    loader_kwargs TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Create all tables if they don't exist yet
pub fn initialize(conn: &Connection) -> Result<(), String> {
    conn.execute(CREATE_INSTANCES_TABLE, [])
        .map_err(db_error("create instances table"))?;
    Ok(())
}
