//! Session metadata persisted in a redb table `sessions`.

use std::path::{Path, PathBuf};

use jobkit_core::{JobError, Result, SessionType};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// What a session name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Backend serving the session.
    pub session_type: SessionType,
    /// Contact string to hand back to the backend on reopen.
    pub contact: Option<String>,
}

fn db_error(err: impl Into<redb::Error>) -> JobError {
    JobError::Internal(format!("session store: {}", err.into()))
}

/// Name → [`SessionRecord`] map.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    db: Database,
}

impl SessionStore {
    /// Open (or create) the metadata database at `path`.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] when the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobError::Internal(format!("session store directory {}: {e}", parent.display()))
            })?;
        }
        let db = Database::create(&path).map_err(db_error)?;
        let tx = db.begin_write().map_err(db_error)?;
        tx.open_table(SESSIONS).map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(Self { path, db })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `record` under a new `name`.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidArgument`] when `name` is already taken.
    pub fn create(&self, name: &str, record: &SessionRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| JobError::Internal(format!("session store encode: {e}")))?;
        let tx = self.db.begin_write().map_err(db_error)?;
        {
            let mut table = tx.open_table(SESSIONS).map_err(db_error)?;
            if table.get(name).map_err(db_error)?.is_some() {
                return Err(JobError::InvalidArgument(format!(
                    "session '{name}' already exists"
                )));
            }
            table.insert(name, bytes.as_slice()).map_err(db_error)?;
        }
        tx.commit().map_err(db_error)
    }

    /// Record stored under `name`.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] on storage or decode failures.
    pub fn get(&self, name: &str) -> Result<Option<SessionRecord>> {
        let tx = self.db.begin_read().map_err(db_error)?;
        let table = tx.open_table(SESSIONS).map_err(db_error)?;
        let Some(bytes) = table.get(name).map_err(db_error)? else {
            return Ok(None);
        };
        serde_json::from_slice(bytes.value())
            .map(Some)
            .map_err(|e| JobError::Internal(format!("session store decode: {e}")))
    }

    /// Remove `name`; returns whether it existed.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] on storage failures.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let tx = self.db.begin_write().map_err(db_error)?;
        let existed = {
            let mut table = tx.open_table(SESSIONS).map_err(db_error)?;
            table.remove(name).map_err(db_error)?.is_some()
        };
        tx.commit().map_err(db_error)?;
        Ok(existed)
    }

    /// All session names in lexical order.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] on storage failures.
    pub fn names(&self) -> Result<Vec<String>> {
        let tx = self.db.begin_read().map_err(db_error)?;
        let table = tx.open_table(SESSIONS).map_err(db_error)?;
        let mut names = Vec::new();
        for entry in table.iter().map_err(db_error)? {
            let (key, _) = entry.map_err(db_error)?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }
}
