//! Redb backed job store.
//!
//! Four tables keyed by bare job id:
//! - `job_ids`: index of known jobs
//! - `templates`: JSON encoded [`JobTemplate`]
//! - `job_records`: JSON encoded list of [`InternalJob`]
//! - `array_jobs`: whether the id is an array job
//!
//! Values carry no schema tag; the reader only understands what it wrote.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use jobkit_core::{JobError, JobInfo, JobState, JobTemplate, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{
    InternalJob, JobStore, array_records, find_record, find_record_mut, sort_job_ids,
    split_job_id, task_job_id,
};

const JOB_IDS: TableDefinition<&str, ()> = TableDefinition::new("job_ids");
const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");
const JOB_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_records");
const ARRAY_JOBS: TableDefinition<&str, bool> = TableDefinition::new("array_jobs");

fn db_error(err: impl Into<redb::Error>) -> JobError {
    JobError::Internal(format!("job store: {}", err.into()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| JobError::Internal(format!("job store encode: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| JobError::Internal(format!("job store decode: {e}")))
}

/// Crash persistent job store.
#[derive(Debug)]
pub struct PersistentJobStore {
    path: PathBuf,
    db: Mutex<Option<Database>>,
}

impl PersistentJobStore {
    /// Open (or create) the store at `path` and make sure every table exists.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Internal`] when the database cannot be opened,
    /// e.g. because another tracker still holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobError::Internal(format!("job store directory {}: {e}", parent.display()))
            })?;
        }
        let db = Database::create(&path).map_err(db_error)?;

        let tx = db.begin_write().map_err(db_error)?;
        tx.open_table(JOB_IDS).map_err(db_error)?;
        tx.open_table(TEMPLATES).map_err(db_error)?;
        tx.open_table(JOB_RECORDS).map_err(db_error)?;
        tx.open_table(ARRAY_JOBS).map_err(db_error)?;
        tx.commit().map_err(db_error)?;

        info!(path = %path.display(), "Opened persistent job store");
        Ok(Self {
            path,
            db: Mutex::new(Some(db)),
        })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let db = guard
            .as_ref()
            .ok_or_else(|| JobError::Internal("job store is closed".to_string()))?;
        f(db)
    }

    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(db_error)?;
            let value = f(&tx)?;
            tx.commit().map_err(db_error)?;
            Ok(value)
        })
    }

    fn read_records(&self, base: &str) -> Result<Vec<InternalJob>> {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_error)?;
            let table = tx.open_table(JOB_RECORDS).map_err(db_error)?;
            let value = table.get(base).map_err(db_error)?;
            match value {
                Some(bytes) => decode(bytes.value()),
                None => Err(JobError::unknown_job(base)),
            }
        })
    }

    fn update_records(
        &self,
        base: &str,
        job_id: &str,
        f: impl FnOnce(&mut Vec<InternalJob>) -> Result<()>,
    ) -> Result<()> {
        self.write(|tx| {
            let mut table = tx.open_table(JOB_RECORDS).map_err(db_error)?;
            let current = table.get(base).map_err(db_error)?.map(|v| v.value().to_vec());
            let mut records: Vec<InternalJob> = match current {
                Some(bytes) => decode(&bytes)?,
                None => return Err(JobError::unknown_job(job_id)),
            };
            f(&mut records)?;
            let bytes = encode(&records)?;
            table.insert(base, bytes.as_slice()).map_err(db_error)?;
            Ok(())
        })
    }

    fn insert_job(
        &self,
        job_id: &str,
        template: &JobTemplate,
        records: &[InternalJob],
        is_array: bool,
    ) -> Result<()> {
        let template_bytes = encode(template)?;
        let record_bytes = encode(&records)?;
        self.write(|tx| {
            tx.open_table(JOB_IDS)
                .map_err(db_error)?
                .insert(job_id, ())
                .map_err(db_error)?;
            tx.open_table(TEMPLATES)
                .map_err(db_error)?
                .insert(job_id, template_bytes.as_slice())
                .map_err(db_error)?;
            tx.open_table(JOB_RECORDS)
                .map_err(db_error)?
                .insert(job_id, record_bytes.as_slice())
                .map_err(db_error)?;
            tx.open_table(ARRAY_JOBS)
                .map_err(db_error)?
                .insert(job_id, is_array)
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn delete_everywhere(tx: &WriteTransaction, base: &str) -> Result<()> {
        tx.open_table(JOB_IDS)
            .map_err(db_error)?
            .remove(base)
            .map_err(db_error)?;
        tx.open_table(TEMPLATES)
            .map_err(db_error)?
            .remove(base)
            .map_err(db_error)?;
        tx.open_table(JOB_RECORDS)
            .map_err(db_error)?
            .remove(base)
            .map_err(db_error)?;
        tx.open_table(ARRAY_JOBS)
            .map_err(db_error)?
            .remove(base)
            .map_err(db_error)?;
        Ok(())
    }
}

impl JobStore for PersistentJobStore {
    fn save_job(&self, job_id: &str, template: &JobTemplate, pid: u32) -> Result<()> {
        if self.has_job(job_id) {
            return self.update_records(job_id, job_id, |records| {
                let record = records
                    .first_mut()
                    .ok_or_else(|| JobError::unknown_job(job_id))?;
                record.pid = pid;
                Ok(())
            });
        }
        self.insert_job(
            job_id,
            template,
            &[InternalJob::queued(0, pid, Utc::now())],
            false,
        )
    }

    fn save_array_job(
        &self,
        array_id: &str,
        pids: &[u32],
        template: &JobTemplate,
        begin: u64,
        end: u64,
        step: u64,
    ) -> Result<()> {
        let records = array_records(pids, begin, end, step);
        if records.is_empty() {
            return Err(JobError::InvalidArgument(format!(
                "array job {array_id} has no tasks in {begin}..={end} by {step}"
            )));
        }
        self.insert_job(array_id, template, &records, true)
    }

    fn save_array_job_pid(&self, array_id: &str, task_id: u64, pid: u32) -> Result<()> {
        let task = task_job_id(array_id, task_id);
        self.update_records(array_id, &task, |records| {
            find_record_mut(&task, records)?.pid = pid;
            Ok(())
        })
    }

    fn save_job_state(&self, job_id: &str, state: JobState, info: &JobInfo) -> Result<()> {
        let (base, _) = split_job_id(job_id)?;
        self.update_records(base, job_id, |records| {
            find_record_mut(job_id, records)?.record(state, info);
            Ok(())
        })
    }

    fn has_job(&self, job_id: &str) -> bool {
        let Ok((base, task)) = split_job_id(job_id) else {
            return false;
        };
        match self.read_records(base) {
            Ok(records) => task.is_none_or(|task| records.iter().any(|r| r.task_id == task)),
            Err(_) => false,
        }
    }

    fn is_array_job(&self, job_id: &str) -> bool {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_error)?;
            let table = tx.open_table(ARRAY_JOBS).map_err(db_error)?;
            let flag = table.get(job_id).map_err(db_error)?;
            Ok(flag.is_some_and(|v| v.value()))
        })
        .unwrap_or(false)
    }

    fn remove_job(&self, job_id: &str) -> Result<()> {
        let (base, task) = split_job_id(job_id)?;
        let Some(task) = task else {
            if !self.has_job(base) {
                return Err(JobError::unknown_job(job_id));
            }
            debug!(job_id, "Removing job from persistent store");
            return self.write(|tx| Self::delete_everywhere(tx, base));
        };

        let mut records = self.read_records(base)?;
        let before = records.len();
        records.retain(|r| r.task_id != task);
        if records.len() == before {
            return Err(JobError::unknown_job(job_id));
        }
        if records.is_empty() {
            return self.write(|tx| Self::delete_everywhere(tx, base));
        }
        let bytes = encode(&records)?;
        self.write(|tx| {
            tx.open_table(JOB_RECORDS)
                .map_err(db_error)?
                .insert(base, bytes.as_slice())
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn get_pid(&self, job_id: &str) -> Result<u32> {
        self.get_job_record(job_id).map(|record| record.pid)
    }

    fn get_job_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.with_db(|db| {
            let tx = db.begin_read().map_err(db_error)?;
            let table = tx.open_table(JOB_IDS).map_err(db_error)?;
            let mut ids = Vec::new();
            for entry in table.iter().map_err(db_error)? {
                let (key, _) = entry.map_err(db_error)?;
                ids.push(key.value().to_string());
            }
            Ok(ids)
        })?;
        sort_job_ids(&mut ids);
        Ok(ids)
    }

    fn get_array_job_task_ids(&self, array_id: &str) -> Result<Vec<String>> {
        let records = self.read_records(array_id)?;
        if !self.is_array_job(array_id) {
            return Err(JobError::InvalidArgument(format!(
                "job {array_id} is not an array job"
            )));
        }
        Ok(records
            .iter()
            .map(|r| task_job_id(array_id, r.task_id))
            .collect())
    }

    fn get_job_record(&self, job_id: &str) -> Result<InternalJob> {
        let (base, _) = split_job_id(job_id)?;
        let records = self.read_records(base)?;
        find_record(job_id, &records).cloned()
    }

    fn get_job_template(&self, job_id: &str) -> Result<JobTemplate> {
        let (base, _) = split_job_id(job_id)?;
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_error)?;
            let table = tx.open_table(TEMPLATES).map_err(db_error)?;
            let value = table.get(base).map_err(db_error)?;
            match value {
                Some(bytes) => decode(bytes.value()),
                None => Err(JobError::unknown_job(job_id)),
            }
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            info!(path = %self.path.display(), "Closed persistent job store");
        }
        Ok(())
    }
}
