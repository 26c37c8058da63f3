use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use jobkit_core::{JobError, JobInfo, JobState, JobTemplate, Result};

use super::{
    InternalJob, JobStore, array_records, find_record, find_record_mut, sort_job_ids,
    split_job_id, task_job_id,
};

#[derive(Debug, Clone)]
struct StoredJob {
    template: JobTemplate,
    records: Vec<InternalJob>,
    is_array: bool,
}

/// Map backed job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, StoredJob>>,
}

impl MemoryJobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<String, StoredJob>) -> T) -> T {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut jobs)
    }
}

impl JobStore for MemoryJobStore {
    fn save_job(&self, job_id: &str, template: &JobTemplate, pid: u32) -> Result<()> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.get_mut(job_id)
                && let Some(record) = job.records.first_mut()
            {
                record.pid = pid;
                return;
            }
            jobs.insert(
                job_id.to_string(),
                StoredJob {
                    template: template.clone(),
                    records: vec![InternalJob::queued(0, pid, Utc::now())],
                    is_array: false,
                },
            );
        });
        Ok(())
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
        self.with_jobs(|jobs| {
            jobs.insert(
                array_id.to_string(),
                StoredJob {
                    template: template.clone(),
                    records,
                    is_array: true,
                },
            );
        });
        Ok(())
    }

    fn save_array_job_pid(&self, array_id: &str, task_id: u64, pid: u32) -> Result<()> {
        self.with_jobs(|jobs| {
            let job = jobs
                .get_mut(array_id)
                .ok_or_else(|| JobError::unknown_job(array_id))?;
            let task = task_job_id(array_id, task_id);
            find_record_mut(&task, &mut job.records)?.pid = pid;
            Ok(())
        })
    }

    fn save_job_state(&self, job_id: &str, state: JobState, info: &JobInfo) -> Result<()> {
        let (base, _) = split_job_id(job_id)?;
        self.with_jobs(|jobs| {
            let job = jobs
                .get_mut(base)
                .ok_or_else(|| JobError::unknown_job(job_id))?;
            find_record_mut(job_id, &mut job.records)?.record(state, info);
            Ok(())
        })
    }

    fn has_job(&self, job_id: &str) -> bool {
        let Ok((base, task)) = split_job_id(job_id) else {
            return false;
        };
        self.with_jobs(|jobs| match (jobs.get(base), task) {
            (Some(_), None) => true,
            (Some(job), Some(task)) => job.records.iter().any(|r| r.task_id == task),
            (None, _) => false,
        })
    }

    fn is_array_job(&self, job_id: &str) -> bool {
        self.with_jobs(|jobs| jobs.get(job_id).is_some_and(|job| job.is_array))
    }

    fn remove_job(&self, job_id: &str) -> Result<()> {
        let (base, task) = split_job_id(job_id)?;
        self.with_jobs(|jobs| match task {
            None => jobs
                .remove(base)
                .map(|_| ())
                .ok_or_else(|| JobError::unknown_job(job_id)),
            Some(task) => {
                let job = jobs
                    .get_mut(base)
                    .ok_or_else(|| JobError::unknown_job(job_id))?;
                let before = job.records.len();
                job.records.retain(|r| r.task_id != task);
                if job.records.len() == before {
                    return Err(JobError::unknown_job(job_id));
                }
                if job.records.is_empty() {
                    jobs.remove(base);
                }
                Ok(())
            }
        })
    }

    fn get_pid(&self, job_id: &str) -> Result<u32> {
        self.get_job_record(job_id).map(|record| record.pid)
    }

    fn get_job_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.with_jobs(|jobs| jobs.keys().cloned().collect::<Vec<_>>());
        sort_job_ids(&mut ids);
        Ok(ids)
    }

    fn get_array_job_task_ids(&self, array_id: &str) -> Result<Vec<String>> {
        self.with_jobs(|jobs| match jobs.get(array_id) {
            Some(job) if job.is_array => Ok(job
                .records
                .iter()
                .map(|r| task_job_id(array_id, r.task_id))
                .collect()),
            Some(_) => Err(JobError::InvalidArgument(format!(
                "job {array_id} is not an array job"
            ))),
            None => Err(JobError::unknown_job(array_id)),
        })
    }

    fn get_job_record(&self, job_id: &str) -> Result<InternalJob> {
        let (base, _) = split_job_id(job_id)?;
        self.with_jobs(|jobs| {
            let job = jobs.get(base).ok_or_else(|| JobError::unknown_job(job_id))?;
            find_record(job_id, &job.records).cloned()
        })
    }

    fn get_job_template(&self, job_id: &str) -> Result<JobTemplate> {
        let (base, _) = split_job_id(job_id)?;
        self.with_jobs(|jobs| {
            jobs.get(base)
                .map(|job| job.template.clone())
                .ok_or_else(|| JobError::unknown_job(job_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> JobTemplate {
        JobTemplate::new("/bin/true", Vec::<String>::new())
    }

    #[test]
    fn test_save_and_update_pid() {
        let store = MemoryJobStore::new();
        store.save_job("1", &template(), 0).expect("save");
        assert_eq!(store.get_pid("1").ok(), Some(0));
        store.save_job("1", &template(), 4242).expect("update");
        assert_eq!(store.get_pid("1").ok(), Some(4242));
        assert_eq!(
            store.get_job_record("1").map(|r| r.state).ok(),
            Some(JobState::Queued)
        );
    }

    #[test]
    fn test_array_job_pids_and_tasks() {
        let store = MemoryJobStore::new();
        store
            .save_array_job("3", &[], &template(), 1, 5, 2)
            .expect("save array");
        assert!(store.is_array_job("3"));
        assert_eq!(
            store.get_array_job_task_ids("3").ok(),
            Some(vec!["3.1".to_string(), "3.3".to_string(), "3.5".to_string()])
        );
        store.save_array_job_pid("3", 3, 77).expect("pid");
        assert_eq!(store.get_pid("3.3").ok(), Some(77));
        assert_eq!(store.get_pid("3").ok(), Some(0));
        assert!(matches!(store.get_pid("3.2"), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_remove_array_removes_all_tasks() {
        let store = MemoryJobStore::new();
        store
            .save_array_job("3", &[], &template(), 1, 3, 1)
            .expect("save array");
        store.remove_job("3.2").expect("remove task");
        assert!(!store.has_job("3.2"));
        assert!(store.has_job("3.1"));
        store.remove_job("3").expect("remove array");
        assert!(!store.has_job("3.1"));
        assert!(store.get_job_ids().expect("ids").is_empty());
    }

    #[test]
    fn test_save_job_state() {
        let store = MemoryJobStore::new();
        store.save_job("9", &template(), 10).expect("save");
        let mut info = JobInfo::new("9", JobState::Failed);
        info.exit_status = Some(2);
        store
            .save_job_state("9", JobState::Failed, &info)
            .expect("state");
        let record = store.get_job_record("9").expect("record");
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.exit_status, Some(2));
        assert!(matches!(
            store.save_job_state("10", JobState::Done, &info),
            Err(JobError::NotFound(_))
        ));
    }
}
