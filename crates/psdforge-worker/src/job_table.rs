//! In-memory job table.
//!
//! Every status write goes through [`JobTable::transition`], which enforces
//! the job state machine and owns the timestamps. Observers follow a job
//! through a `watch` channel instead of polling.

use chrono::Utc;
use psdforge_core::{AppError, Job, JobStatus};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

struct Entry {
    job: Job,
    tx: watch::Sender<Job>,
}

impl Entry {
    fn publish(&self) {
        self.tx.send_replace(self.job.clone());
    }
}

#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, job: Job) {
        let (tx, _) = watch::channel(job.clone());
        self.lock().insert(job.id.clone(), Entry { job, tx });
    }

    pub fn remove(&self, job_id: &str) -> Option<Job> {
        self.lock().remove(job_id).map(|entry| entry.job)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).map(|entry| entry.job.clone())
    }

    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<Job>> {
        self.lock().get(job_id).map(|entry| entry.tx.subscribe())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.lock().values().filter(|e| e.job.status == status).count()
    }

    /// Ids of jobs that are not in a terminal state
    pub fn live_ids(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.id.clone())
            .collect()
    }

    /// Move a job to `next` and apply `update` to it in the same critical section.
    ///
    /// Sets `started_at` on the first move to PROCESSING and `completed_at` on
    /// any terminal state. COMPLETED pins progress to 100.
    pub fn transition<F>(&self, job_id: &str, next: JobStatus, update: F) -> Result<Job, AppError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.lock();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;

        let current = entry.job.status;
        if !current.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "Invalid job transition {} -> {} for {}",
                current, next, job_id
            )));
        }

        let job = &mut entry.job;
        job.status = next;
        if next == JobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        update(job);
        if next.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        if next == JobStatus::Completed {
            job.progress = 100.0;
        }

        entry.publish();
        Ok(entry.job.clone())
    }

    /// Raise progress on a PROCESSING job. Lower values are ignored.
    pub fn set_progress(&self, job_id: &str, progress: f32) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        if entry.job.status != JobStatus::Processing {
            return false;
        }

        let progress = progress.clamp(0.0, 100.0);
        if progress <= entry.job.progress {
            return false;
        }
        entry.job.progress = progress;
        entry.publish();
        true
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, e| match e.job.completed_at {
            Some(done) if e.job.status.is_terminal() => done > cutoff,
            _ => true,
        });
        before - jobs.len()
    }

    /// Resolve once the job reaches a terminal state. `None` for unknown ids.
    pub async fn wait_terminal(&self, job_id: &str) -> Option<Job> {
        let mut rx = self.subscribe(job_id)?;
        loop {
            {
                let job = rx.borrow_and_update();
                if job.status.is_terminal() {
                    return Some(job.clone());
                }
            }
            if rx.changed().await.is_err() {
                // Entry removed from the table
                return self.get(job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psdforge_core::{ConversionOptions, InputKind, JobMetadata};

    fn job(id: &str) -> Job {
        Job::new(
            id.to_string(),
            JobMetadata {
                filename: "a.psd".into(),
                file_type: InputKind::Psd,
                file_size: 10,
                options: ConversionOptions::default(),
                strategy: None,
            },
        )
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let table = JobTable::new();
        table.insert(job("j1"));

        let started = table.transition("j1", JobStatus::Processing, |_| {}).unwrap();
        let first_start = started.started_at.unwrap();
        table.set_progress("j1", 40.0);
        let again = table.transition("j1", JobStatus::Processing, |_| {}).unwrap();
        assert_eq!(again.started_at, Some(first_start));

        let done = table.transition("j1", JobStatus::Completed, |_| {}).unwrap();
        assert_eq!(done.progress, 100.0);
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let table = JobTable::new();
        table.insert(job("j1"));
        table.transition("j1", JobStatus::Processing, |_| {}).unwrap();
        table
            .transition("j1", JobStatus::Failed, |j| j.error_message = Some("boom".into()))
            .unwrap();

        assert!(table.transition("j1", JobStatus::Completed, |_| {}).is_err());
        assert!(table.transition("j1", JobStatus::Cancelled, |_| {}).is_err());
        assert!(!table.set_progress("j1", 99.0));
        assert_eq!(table.get("j1").unwrap().error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let table = JobTable::new();
        table.insert(job("j1"));
        assert!(table.transition("j1", JobStatus::Completed, |_| {}).is_err());
        assert!(matches!(
            table.transition("missing", JobStatus::Processing, |_| {}),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_progress_only_rises_while_processing() {
        let table = JobTable::new();
        table.insert(job("j1"));
        assert!(!table.set_progress("j1", 10.0));

        table.transition("j1", JobStatus::Processing, |_| {}).unwrap();
        assert!(table.set_progress("j1", 20.0));
        assert!(!table.set_progress("j1", 10.0));
        assert!(table.set_progress("j1", 250.0));
        assert_eq!(table.get("j1").unwrap().progress, 100.0);
    }

    #[test]
    fn test_prune_keeps_live_jobs() {
        let table = JobTable::new();
        table.insert(job("live"));
        table.insert(job("done"));
        table.transition("done", JobStatus::Cancelled, |_| {}).unwrap();

        assert_eq!(table.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(table.prune_finished(Duration::ZERO), 1);
        assert!(table.get("live").is_some());
        assert!(table.get("done").is_none());
        assert_eq!(table.live_ids(), vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_terminal_observes_completion() {
        let table = std::sync::Arc::new(JobTable::new());
        table.insert(job("j1"));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_terminal("j1").await })
        };
        table.transition("j1", JobStatus::Processing, |_| {}).unwrap();
        table.transition("j1", JobStatus::Completed, |_| {}).unwrap();

        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(table.wait_terminal("missing").await.is_none());
    }
}
