// SQLite database crate for the LLM backend
// Instance configuration records are the only persistent state the pool needs.

pub mod instances;
pub mod schema;
pub mod store;

use rusqlite::Connection;
use std::sync::Mutex;

pub use store::{InstancePatch, InstanceRecord, RecordStore};

/// Main database wrapper around a single SQLite connection
pub struct Database {
    conn: Mutex<Connection>,
}

/// Helper function to create standardized database error messages
///
/// Usage: `.map_err(db_error("insert instance"))?`
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> String + '_ {
    move |e| format!("Failed to {context}: {e}")
}

impl Database {
    /// Open (or create) a database and initialize schema
    pub fn new(db_path: &str) -> Result<Self, String> {
        let conn = Connection::open(db_path).map_err(db_error("open database"))?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get a reference to the connection (locked)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database lock poisoned")
    }
}

/// Get current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
