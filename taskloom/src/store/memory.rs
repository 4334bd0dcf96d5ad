//! Provides an in memory implementation of [`JobStore`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and in single process setups where durability is not required.
use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CandidateFilter, Condition, JobPatch, JobStore, SortOrder, StoreError};
use crate::job::{now, Job, JobId, JobLog, JobStatus};

/// An in memory implementation of [`JobStore`].
///
/// Jobs are kept in insertion order and every operation takes the lock for its whole duration,
/// so [`JobStore::update_if`] is atomic.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    logs: Arc<RwLock<Vec<JobLog>>>,
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Vec<Job>) -> T) -> Result<T, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(f(&jobs))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Vec<Job>) -> T) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(f(&mut jobs))
    }
}

fn is_candidate(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Waiting => true,
        JobStatus::Delayed => job.is_due(now),
        JobStatus::WaitingDependency => job.dependency_count == 0,
        _ => false,
    }
}

fn by_priority(job: &Job) -> (Reverse<i32>, DateTime<Utc>) {
    (Reverse(job.priority), job.created_at)
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        self.write(|jobs| {
            jobs.push(job.clone());
            job
        })
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.read(|jobs| jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn update_if(
        &self,
        id: JobId,
        condition: &Condition,
        patch: &JobPatch,
    ) -> Result<Option<Job>, StoreError> {
        let now = now();
        self.write(|jobs| {
            jobs.iter_mut()
                .find(|job| job.id == id)
                .filter(|job| condition.matches(job))
                .map(|job| {
                    patch.apply(job, now);
                    job.clone()
                })
        })
    }

    async fn select_candidates(
        &self,
        filter: &CandidateFilter<'_>,
    ) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            let mut candidates: Vec<_> = jobs
                .iter()
                .filter(|job| is_candidate(job, filter.now))
                .filter(|job| filter.name.map_or(true, |name| job.name == name))
                .cloned()
                .collect();
            candidates.sort_by_key(by_priority);
            candidates
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .collect()
        })
    }

    async fn select_by_parent(&self, parent_id: JobId) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            jobs.iter()
                .filter(|job| job.parent_job_id == Some(parent_id))
                .cloned()
                .collect()
        })
    }

    async fn select_by_status(
        &self,
        statuses: &[JobStatus],
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            let mut selected: Vec<_> = jobs
                .iter()
                .filter(|job| statuses.contains(&job.status))
                .cloned()
                .collect();
            match order {
                SortOrder::RecentlyFinished => {
                    selected.sort_by_key(|job| Reverse(job.finished_on));
                }
                SortOrder::Priority => selected.sort_by_key(by_priority),
            }
            selected.truncate(limit);
            selected
        })
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        self.read(|jobs| {
            jobs.iter().fold(HashMap::new(), |mut counts, job| {
                *counts.entry(job.status).or_insert(0) += 1;
                counts
            })
        })
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = self.write(|jobs| {
            let deleted: Vec<JobId> = jobs
                .iter()
                .filter(|job| job.status.is_terminal())
                .filter(|job| job.finished_on.is_some_and(|finished| finished < cutoff))
                .map(|job| job.id)
                .collect();
            jobs.retain(|job| !deleted.contains(&job.id));
            for job in jobs.iter_mut() {
                if job.parent_job_id.is_some_and(|parent| deleted.contains(&parent)) {
                    job.parent_job_id = None;
                }
            }
            deleted
        })?;
        let mut logs = self.logs.write().map_err(|_| StoreError::BadState)?;
        logs.retain(|log| !deleted.contains(&log.job_id));
        Ok(deleted.len() as u64)
    }

    async fn append_log(&self, log: JobLog) -> Result<JobLog, StoreError> {
        let mut logs = self.logs.write().map_err(|_| StoreError::BadState)?;
        logs.push(log.clone());
        Ok(log)
    }

    async fn select_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLog>, StoreError> {
        let logs = self.logs.read().map_err(|_| StoreError::BadState)?;
        let selected: Vec<_> = logs.iter().filter(|log| log.job_id == job_id).collect();
        let skip = selected.len().saturating_sub(limit);
        Ok(selected.into_iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_suite;

    test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn poisoned_lock_is_reported_as_bad_state() {
        let store = InMemoryStore::new();
        let jobs = store.jobs.clone();
        let _ = std::thread::spawn(move || {
            let _guard = jobs.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        let result = store.get_by_id(JobId::new()).await;

        assert_matches!(result, Err(StoreError::BadState));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_claimers_never_share_a_job() {
        let queue = crate::queue::QueueService::new(InMemoryStore::new());
        for _ in 0..20 {
            queue
                .add_job("job", serde_json::json!(null), crate::job::JobOptions::default())
                .await
                .unwrap();
        }

        let claimers = (0..8).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_next(None).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            })
        });
        let mut claimed: Vec<JobId> = futures::future::join_all(claimers)
            .await
            .into_iter()
            .flat_map(Result::unwrap)
            .collect();

        assert_eq!(claimed.len(), 20);
        claimed.sort_by_key(ToString::to_string);
        claimed.dedup();
        assert_eq!(claimed.len(), 20);
    }

    #[tokio::test]
    async fn select_by_status_recently_finished_first() {
        let store = InMemoryStore::new();
        let base = now();
        for offset in [1, 3, 2] {
            let mut job = Job::raw_job();
            job.status = JobStatus::Completed;
            job.finished_on = Some(base + chrono::TimeDelta::seconds(offset));
            store.insert(job).await.unwrap();
        }

        let jobs = store
            .select_by_status(&[JobStatus::Completed], SortOrder::RecentlyFinished, 2)
            .await
            .unwrap();

        let finished: Vec<_> = jobs.iter().filter_map(|job| job.finished_on).collect();
        assert_eq!(
            finished,
            vec![
                base + chrono::TimeDelta::seconds(3),
                base + chrono::TimeDelta::seconds(2)
            ]
        );
    }
}
