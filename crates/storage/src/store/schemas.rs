#![forbid(unsafe_code)]

use super::sync::{SyncRowKind, log_local_row, schema_row_id};
use super::{SqliteStore, StoreError, StoreTx, now_ms};
use lix_core::{SchemaDefinition, canonical_identifier, canonical_json};
use rusqlite::{Connection, OptionalExtension, params};

impl SqliteStore {
    pub fn register_schema(&mut self, definition: &SchemaDefinition) -> Result<(), StoreError> {
        self.transact(|tx| tx.register_schema(definition))
    }

    pub fn schema(&self, key: &str, version: &str) -> Result<Option<SchemaDefinition>, StoreError> {
        schema_definition(self.connection(), key, version)
    }

    pub fn list_schemas(&self) -> Result<Vec<SchemaDefinition>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare("SELECT definition FROM stored_schemas ORDER BY key, version")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }
}

impl StoreTx<'_> {
    /// Schemas are immutable per `(key, version)`: re-registering the same definition is a no-op.
    pub fn register_schema(&mut self, definition: &SchemaDefinition) -> Result<(), StoreError> {
        let key = canonical_identifier("schema_key", &definition.key)
            .map_err(|_| StoreError::InvalidInput("invalid schema key"))?;
        let version = canonical_identifier("schema_version", &definition.version)
            .map_err(|_| StoreError::InvalidInput("invalid schema version"))?;
        let definition = SchemaDefinition {
            key: key.clone(),
            version: version.clone(),
            ..definition.clone()
        };
        SchemaDefinition::from_json(&definition.to_json())
            .map_err(|_| StoreError::InvalidInput("invalid schema definition"))?;
        let encoded = canonical_json(&definition.to_json());

        match stored_definition(self.conn(), &key, &version)? {
            Some(existing) if existing == encoded => return Ok(()),
            Some(_) => {
                return Err(StoreError::InvalidInput(
                    "schema version is already registered with a different definition",
                ));
            }
            None => {}
        }
        self.tx.execute(
            "INSERT INTO stored_schemas(key, version, definition, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![key, version, encoded, now_ms()],
        )?;
        log_local_row(
            self.conn(),
            self.store_id,
            SyncRowKind::Schema,
            &schema_row_id(&key, &version),
        )?;
        tracing::debug!(schema_key = %key, schema_version = %version, "schema registered");
        Ok(())
    }

    pub fn schema(&self, key: &str, version: &str) -> Result<Option<SchemaDefinition>, StoreError> {
        schema_definition(self.conn(), key, version)
    }
}

fn stored_definition(conn: &Connection, key: &str, version: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT definition FROM stored_schemas WHERE key=?1 AND version=?2",
            params![key, version],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub(crate) fn schema_definition(
    conn: &Connection,
    key: &str,
    version: &str,
) -> Result<Option<SchemaDefinition>, StoreError> {
    stored_definition(conn, key, version)?
        .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
        .transpose()
}

/// Every schema key that may have state: registered ones plus any seen on a change.
pub(crate) fn known_schema_keys(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT key FROM stored_schemas UNION SELECT schema_key FROM changes ORDER BY 1",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
