#![forbid(unsafe_code)]

//! Whole-store export and import.

use super::install::{install_schema, load_store_id, preflight_gate};
use super::sync::rotate_store_id;
use super::{SqliteStore, StoreError, scratch_path};
use rusqlite::backup::Backup;
use rusqlite::{Connection, params};
use std::path::Path;
use std::time::Duration;

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;

impl SqliteStore {
    /// Serializes the whole database into one SQLite file image.
    pub fn export_blob(&self) -> Result<Vec<u8>, StoreError> {
        let path = scratch_path(self.storage_dir(), "export");
        let result = vacuum_into(self.connection(), &path);
        let bytes = result.and_then(|()| Ok(std::fs::read(&path)?));
        remove_scratch(&path);
        let bytes = bytes?;
        tracing::debug!(bytes = bytes.len(), "store exported");
        Ok(bytes)
    }

    /// Replaces the entire store with an exported image. The store id travels with the image.
    pub fn import_blob(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let path = scratch_path(self.storage_dir(), "import");
        std::fs::write(&path, bytes)?;
        let result = self.restore_from(&path);
        remove_scratch(&path);
        result?;
        tracing::info!(store_id = %self.store_id, "store imported");
        Ok(())
    }

    /// Imports an image as a new, independent store: same data under a fresh store id.
    pub fn fork_from_blob(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.import_blob(bytes)?;
        let store_id = rotate_store_id(&self.conn)?;
        tracing::info!(store_id = %store_id, "store forked from image");
        self.store_id = store_id;
        Ok(())
    }

    fn restore_from(&mut self, path: &Path) -> Result<(), StoreError> {
        let source = Connection::open(path)?;
        preflight_gate(&source)?;
        {
            let backup = Backup::new(&source, &mut self.conn)?;
            backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)?;
        }
        drop(source);
        install_schema(&self.conn)?;
        self.store_id = load_store_id(&self.conn)?;
        Ok(())
    }
}

/// Removes a scratch database and any journal files SQLite left next to it.
fn remove_scratch(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }
}

fn vacuum_into(conn: &Connection, path: &Path) -> Result<(), StoreError> {
    conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().into_owned()])?;
    Ok(())
}
