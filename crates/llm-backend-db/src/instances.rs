// Instance configuration record operations

use super::{current_timestamp_millis, db_error, Database};
use crate::store::{InstancePatch, InstanceRecord, RecordStore};
use llm_backend_types::InstanceConfig;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde_json::{Map, Value};

const SELECT_INSTANCE_COLUMNS: &str = "SELECT id, backend, loader, model_path, model_version, gateway,
        loader_kwargs, created_at, updated_at FROM instances";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let kwargs_json: String = row.get(6)?;
    let loader_kwargs: Map<String, Value> = serde_json::from_str(&kwargs_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(InstanceRecord {
        id: row.get(0)?,
        config: InstanceConfig {
            backend: row.get(1)?,
            loader: row.get(2)?,
            model_path: row.get(3)?,
            model_version: row.get(4)?,
            gateway: row.get(5)?,
            loader_kwargs,
        },
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn read_instance(conn: &Connection, id: &str) -> Result<Option<InstanceRecord>, String> {
    let sql = format!("{SELECT_INSTANCE_COLUMNS} WHERE id = ?1");
    match conn.query_row(&sql, [id], row_to_record) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("Failed to get instance: {e}")),
    }
}

fn kwargs_to_json(config: &InstanceConfig) -> Result<String, String> {
    serde_json::to_string(&config.loader_kwargs)
        .map_err(|e| format!("Failed to serialize loader kwargs: {e}"))
}

impl Database {
    /// Create a new instance record with a generated UUID
    pub fn create_instance(&self, config: &InstanceConfig) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_instance_with_id(&id, config)?;
        Ok(id)
    }

    /// Create an instance record under a caller-chosen id
    pub fn create_instance_with_id(&self, id: &str, config: &InstanceConfig) -> Result<(), String> {
        let now = current_timestamp_millis();
        let kwargs = kwargs_to_json(config)?;

        let conn = self.connection();
        conn.execute(
            "INSERT INTO instances (id, backend, loader, model_path, model_version, gateway,
                                    loader_kwargs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                config.backend,
                config.loader,
                config.model_path,
                config.model_version,
                config.gateway,
                kwargs,
                now,
                now
            ],
        )
        .map_err(db_error("create instance"))?;

        Ok(())
    }

    /// Get instance by ID
    pub fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, String> {
        let conn = self.connection();
        read_instance(&conn, id)
    }

    /// List all instances (oldest first)
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, String> {
        let conn = self.connection();
        let sql = format!("{SELECT_INSTANCE_COLUMNS} ORDER BY created_at ASC, id ASC");
        let mut stmt = conn.prepare(&sql).map_err(db_error("prepare statement"))?;

        let records = stmt
            .query_map([], row_to_record)
            .map_err(db_error("query instances"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("read instance row"))?;

        Ok(records)
    }

    /// Apply a partial update. Returns `false` if the instance does not exist.
    pub fn update_instance(&self, id: &str, patch: &InstancePatch) -> Result<bool, String> {
        let conn = self.connection();
        let Some(mut record) = read_instance(&conn, id)? else {
            return Ok(false);
        };
        if patch.is_empty() {
            return Ok(true);
        }
        patch.apply(&mut record.config);
        let config = &record.config;
        let kwargs = kwargs_to_json(config)?;

        conn.execute(
            "UPDATE instances SET backend = ?1, loader = ?2, model_path = ?3, model_version = ?4,
                    gateway = ?5, loader_kwargs = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                config.backend,
                config.loader,
                config.model_path,
                config.model_version,
                config.gateway,
                kwargs,
                current_timestamp_millis(),
                id
            ],
        )
        .map_err(db_error("update instance"))?;

        Ok(true)
    }

    /// Delete an instance. Returns `false` if it did not exist.
    pub fn delete_instance(&self, id: &str) -> Result<bool, String> {
        let conn = self.connection();
        let affected = conn
            .execute("DELETE FROM instances WHERE id = ?1", [id])
            .map_err(db_error("delete instance"))?;
        Ok(affected > 0)
    }
}

impl RecordStore for Database {
    fn get_record(&self, id: &str) -> Result<Option<InstanceRecord>, String> {
        self.get_instance(id)
    }

    fn post_record(&self, config: &InstanceConfig) -> Result<String, String> {
        self.create_instance(config)
    }

    fn patch_record(&self, id: &str, patch: &InstancePatch) -> Result<bool, String> {
        self.update_instance(id, patch)
    }

    fn delete_record(&self, id: &str) -> Result<bool, String> {
        self.delete_instance(id)
    }

    fn list_records(&self) -> Result<Vec<InstanceRecord>, String> {
        self.list_instances()
    }
}
