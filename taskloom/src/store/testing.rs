//! Test suite for ensuring a correct implementation of a store.
//!
//! The suite covers the [`JobStore`] contract and the queue semantics built on top of it.
use std::collections::HashSet;

use chrono::TimeDelta;
use serde_json::json;

use super::*;
use crate::{
    executor::ExecutionError,
    job::{now, JobLog, JobOptions, LogLevel},
    queue::{NewJob, QueueError, QueueService, CANCELLED_REASON},
};

const DEFAULT_NAME: &str = "job";

/// Create the test suite for a taskloom store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use taskloom::test_suite;
/// use taskloom::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use taskloom::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: SqlitePool),
///     backend: StoreImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@tests $attr, $args, $backend,
            insert_and_get_round_trip,
            get_unknown_job,
            update_if_applies_patch,
            update_if_condition_not_met,
            select_candidates_order_and_filter,
            select_by_parent,
            count_by_status,
            delete_finished_before,
            claimable_on_next_poll,
            dependent_job_not_claimed_before_parent_completes,
            complete_decrements_each_child_once,
            fail_delay_within_jitter_bounds,
            exhausted_attempts_fail_job,
            concurrent_claims_claim_once,
            cancel_only_pending_jobs,
            process_message_retry_scenario,
            parent_child_scenario,
            retry_failed_job,
            monitoring_queries,
            cleanup_old_jobs,
            job_logs_are_kept_with_their_job,
            pause_and_resume_job,
            add_bulk_is_all_or_nothing
        );
    };
    (@tests $attr:meta, $args:tt, $backend:expr, $($test:ident),+) => {
        $(
            #[$attr]
            async fn $test $args {
                let backend = $backend;
                $crate::store::testing::$test(backend).await;
            }
        )+
    };
}

impl Job {
    #[doc(hidden)]
    pub fn raw_job() -> Self {
        let now = now();
        Self {
            id: JobId::new(),
            name: DEFAULT_NAME.to_owned(),
            data: serde_json::Value::Null,
            opts: JobOptions::default(),
            status: JobStatus::Waiting,
            priority: 0,
            delay_ms: 0,
            max_attempts: 3,
            attempts: 0,
            progress: 0,
            parent_job_id: None,
            dependency_count: 0,
            result: None,
            failure_reason: None,
            stacktrace: None,
            created_at: now,
            status_changed_at: now,
            processed_on: None,
            finished_on: None,
        }
    }

    fn with_name(self, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..self
        }
    }

    fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }

    fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }
}

async fn add(queue: &QueueService<impl JobStore>, name: &str, opts: JobOptions) -> Job {
    queue.add_job(name, json!(null), opts).await.unwrap()
}

async fn get(store: &impl JobStore, id: JobId) -> Job {
    store.get_by_id(id).await.unwrap().unwrap()
}

/// Makes a delayed job due without waiting for its delay.
async fn fast_forward(store: &impl JobStore, id: JobId) {
    store
        .update_if(
            id,
            &Condition::status_in([JobStatus::Delayed]),
            &JobPatch::default().with_delay_ms(0),
        )
        .await
        .unwrap()
        .unwrap();
}

fn assert_delay_in_bounds(delay_ms: u64, attempts: u32) {
    let expected = (1_000_u64 << (attempts - 1)) as f64;
    let lower = (expected * 0.75).min(30_000.0) as u64;
    let upper = (expected * 1.25).min(30_000.0) as u64;
    assert!(
        (lower..=upper).contains(&delay_ms),
        "delay {delay_ms} for attempt {attempts} not in [{lower}, {upper}]"
    );
}

#[doc(hidden)]
pub async fn insert_and_get_round_trip(store: impl JobStore) {
    let parent = store.insert(Job::raw_job()).await.unwrap();
    let at = now();
    let job = Job {
        data: json!({"chatId": 1, "content": "hi"}),
        opts: JobOptions::default()
            .with_priority(4)
            .with_delay(TimeDelta::seconds(2))
            .depends_on(parent.id),
        status: JobStatus::Failed,
        priority: 4,
        delay_ms: 2_000,
        max_attempts: 5,
        attempts: 5,
        progress: 42,
        parent_job_id: Some(parent.id),
        dependency_count: 1,
        result: Some(json!({"partial": [1, 2]})),
        failure_reason: Some("boom".to_owned()),
        stacktrace: Some("at line 1".to_owned()),
        processed_on: Some(at + TimeDelta::milliseconds(5)),
        finished_on: Some(at + TimeDelta::milliseconds(9)),
        ..Job::raw_job()
    };

    let inserted = store.insert(job.clone()).await.unwrap();
    let loaded = get(&store, job.id).await;

    assert_eq!(inserted, job);
    assert_eq!(loaded, job);
}

#[doc(hidden)]
pub async fn get_unknown_job(store: impl JobStore) {
    store.insert(Job::raw_job()).await.unwrap();

    assert_eq!(store.get_by_id(JobId::new()).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn update_if_applies_patch(store: impl JobStore) {
    let job = store.insert(Job::raw_job()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    let processed_on = now();

    let updated = store
        .update_if(
            job.id,
            &Condition::status_in(JobStatus::CLAIMABLE).with_dependency_count(0),
            &JobPatch::status(JobStatus::Active)
                .with_processed_on(Some(processed_on))
                .with_result(Some(json!(1)))
                .with_failure_reason(Some("reason".to_owned())),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.status, JobStatus::Active);
    assert_eq!(updated.processed_on, Some(processed_on));
    assert_eq!(updated.result, Some(json!(1)));
    assert_eq!(updated.failure_reason.as_deref(), Some("reason"));
    assert!(updated.status_changed_at > job.status_changed_at);
    assert_eq!(updated.created_at, job.created_at);
    assert_eq!(get(&store, job.id).await, updated);

    let cleared = store
        .update_if(
            job.id,
            &Condition::status_in([JobStatus::Active]),
            &JobPatch::default()
                .with_result(None)
                .with_failure_reason(None)
                .with_progress(7),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cleared.result, None);
    assert_eq!(cleared.failure_reason, None);
    assert_eq!(cleared.progress, 7);
    assert_eq!(cleared.status_changed_at, updated.status_changed_at);
}

#[doc(hidden)]
pub async fn update_if_condition_not_met(store: impl JobStore) {
    let job = store
        .insert(Job {
            dependency_count: 1,
            ..Job::raw_job().with_status(JobStatus::WaitingDependency)
        })
        .await
        .unwrap();
    let patch = JobPatch::status(JobStatus::Active);

    let by_status = store
        .update_if(job.id, &Condition::status_in([JobStatus::Waiting]), &patch)
        .await
        .unwrap();
    let by_count = store
        .update_if(
            job.id,
            &Condition::status_in(JobStatus::CLAIMABLE).with_dependency_count(0),
            &patch,
        )
        .await
        .unwrap();
    let by_processed = store
        .update_if(
            job.id,
            &Condition::status_in(JobStatus::CLAIMABLE).with_processed_before(now()),
            &patch,
        )
        .await
        .unwrap();
    let unknown = store
        .update_if(JobId::new(), &Condition::status_in(JobStatus::ALL), &patch)
        .await
        .unwrap();

    assert_eq!(by_status, None);
    assert_eq!(by_count, None);
    assert_eq!(by_processed, None);
    assert_eq!(unknown, None);
    assert_eq!(get(&store, job.id).await, job);
}

#[doc(hidden)]
pub async fn select_candidates_order_and_filter(store: impl JobStore) {
    let low = store.insert(Job::raw_job()).await.unwrap();
    let high = store
        .insert(Job::raw_job().with_priority(10))
        .await
        .unwrap();
    let low_second = store.insert(Job::raw_job()).await.unwrap();
    let delayed = store
        .insert(Job {
            delay_ms: 60_000,
            ..Job::raw_job().with_status(JobStatus::Delayed).with_priority(5)
        })
        .await
        .unwrap();
    let due = store
        .insert(Job::raw_job().with_status(JobStatus::Delayed).with_priority(5))
        .await
        .unwrap();
    let released = store
        .insert(Job::raw_job().with_status(JobStatus::WaitingDependency))
        .await
        .unwrap();
    let blocked = store
        .insert(Job {
            dependency_count: 1,
            ..Job::raw_job().with_status(JobStatus::WaitingDependency)
        })
        .await
        .unwrap();
    for status in [
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
    ] {
        store
            .insert(Job::raw_job().with_status(status).with_priority(100))
            .await
            .unwrap();
    }
    let other = store
        .insert(Job::raw_job().with_name("other").with_priority(50))
        .await
        .unwrap();

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();
    let all = store
        .select_candidates(&CandidateFilter::new(None, now(), 100))
        .await
        .unwrap();
    assert_eq!(
        ids(all),
        vec![other.id, high.id, due.id, low.id, low_second.id, released.id]
    );

    let later = delayed.available_at();
    let with_delayed = ids(store
        .select_candidates(&CandidateFilter::new(None, later, 100))
        .await
        .unwrap());
    assert_eq!(&with_delayed[..3], &[other.id, high.id, delayed.id]);
    assert!(!with_delayed.contains(&blocked.id));

    let partition = store
        .select_candidates(&CandidateFilter::new(Some(DEFAULT_NAME), now(), 2).with_offset(2))
        .await
        .unwrap();
    assert_eq!(ids(partition), vec![low.id, low_second.id]);
}

#[doc(hidden)]
pub async fn select_by_parent(store: impl JobStore) {
    let parent = store.insert(Job::raw_job()).await.unwrap();
    let child = store
        .insert(Job {
            parent_job_id: Some(parent.id),
            ..Job::raw_job()
        })
        .await
        .unwrap();
    store.insert(Job::raw_job()).await.unwrap();

    let children = store.select_by_parent(parent.id).await.unwrap();

    assert_eq!(children, vec![child.clone()]);
    assert!(store.select_by_parent(child.id).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn count_by_status(store: impl JobStore) {
    for status in [
        JobStatus::Waiting,
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Paused,
    ] {
        store
            .insert(Job::raw_job().with_status(status))
            .await
            .unwrap();
    }

    let counts = store.count_by_status().await.unwrap();

    assert_eq!(counts.get(&JobStatus::Waiting), Some(&2));
    assert_eq!(counts.get(&JobStatus::Active), Some(&1));
    assert_eq!(counts.get(&JobStatus::Paused), Some(&1));
    assert_eq!(counts.get(&JobStatus::Completed).copied().unwrap_or(0), 0);
}

#[doc(hidden)]
pub async fn delete_finished_before(store: impl JobStore) {
    let cutoff = now();
    let old = |status| Job {
        finished_on: Some(cutoff - TimeDelta::hours(1)),
        ..Job::raw_job().with_status(status)
    };
    let old_completed = store.insert(old(JobStatus::Completed)).await.unwrap();
    let old_failed = store.insert(old(JobStatus::Failed)).await.unwrap();
    let recent = store
        .insert(Job {
            finished_on: Some(cutoff + TimeDelta::hours(1)),
            ..Job::raw_job().with_status(JobStatus::Completed)
        })
        .await
        .unwrap();
    let pending = store.insert(Job::raw_job()).await.unwrap();
    let child = store
        .insert(Job {
            parent_job_id: Some(old_completed.id),
            ..Job::raw_job()
        })
        .await
        .unwrap();

    let deleted = store.delete_finished_before(cutoff).await.unwrap();

    assert_eq!(deleted, 2);
    assert_eq!(store.get_by_id(old_completed.id).await.unwrap(), None);
    assert_eq!(store.get_by_id(old_failed.id).await.unwrap(), None);
    assert_eq!(get(&store, recent.id).await, recent);
    assert_eq!(get(&store, pending.id).await, pending);
    assert_eq!(get(&store, child.id).await.parent_job_id, None);
}

#[doc(hidden)]
pub async fn claimable_on_next_poll(store: impl JobStore) {
    let queue = QueueService::new(store);
    let job = add(&queue, DEFAULT_NAME, JobOptions::default()).await;

    let claimed = queue.claim_next(Some(DEFAULT_NAME)).await.unwrap().unwrap();

    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Active);
    assert!(claimed.processed_on.is_some());
    assert_eq!(queue.claim_next(Some(DEFAULT_NAME)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn dependent_job_not_claimed_before_parent_completes(store: impl JobStore) {
    let queue = QueueService::new(store);
    let parent = add(&queue, "parent", JobOptions::default()).await;
    let child = add(&queue, "child", JobOptions::default().depends_on(parent.id)).await;

    assert_eq!(child.status, JobStatus::WaitingDependency);
    assert_eq!(queue.claim_next(Some("child")).await.unwrap(), None);

    queue.claim_next(Some("parent")).await.unwrap().unwrap();
    let error = ExecutionError::from("parent failed");
    queue.fail_job(parent.id, &error).await.unwrap().unwrap();

    assert_eq!(queue.claim_next(Some("child")).await.unwrap(), None);
    assert_eq!(get(queue.store(), child.id).await.dependency_count, 1);
}

#[doc(hidden)]
pub async fn complete_decrements_each_child_once(store: impl JobStore) {
    let queue = QueueService::new(store);
    let parent = add(&queue, "parent", JobOptions::default()).await;
    let single = add(&queue, "child", JobOptions::default().depends_on(parent.id)).await;
    let double = add(
        &queue,
        "child",
        JobOptions::default()
            .depends_on(parent.id)
            .with_dependency_count(2),
    )
    .await;
    let unblocked = add(
        &queue,
        "child",
        JobOptions::default()
            .depends_on(parent.id)
            .with_dependency_count(0),
    )
    .await;

    queue.claim_next(Some("parent")).await.unwrap().unwrap();
    let completed = queue
        .complete_job(parent.id, Some(json!("done")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(queue.complete_job(parent.id, None).await.unwrap(), None);

    let single = get(queue.store(), single.id).await;
    assert_eq!(single.dependency_count, 0);
    assert_eq!(single.status, JobStatus::Waiting);

    let double = get(queue.store(), double.id).await;
    assert_eq!(double.dependency_count, 1);
    assert_eq!(double.status, JobStatus::WaitingDependency);

    let unblocked = get(queue.store(), unblocked.id).await;
    assert_eq!(unblocked.dependency_count, 0);
    assert_eq!(unblocked.status, JobStatus::Waiting);

    let mut claimed = HashSet::new();
    while let Some(job) = queue.claim_next(Some("child")).await.unwrap() {
        claimed.insert(job.id);
    }
    assert_eq!(claimed, HashSet::from([single.id, unblocked.id]));
}

#[doc(hidden)]
pub async fn fail_delay_within_jitter_bounds(store: impl JobStore) {
    let queue = QueueService::new(store);
    let job = add(
        &queue,
        DEFAULT_NAME,
        JobOptions::default().with_max_attempts(10),
    )
    .await;
    let error = ExecutionError::from("boom");

    for attempts in 1..=7 {
        queue.claim_next(None).await.unwrap().unwrap();
        let failed = queue.fail_job(job.id, &error).await.unwrap().unwrap();

        assert_eq!(failed.status, JobStatus::Delayed);
        assert_eq!(failed.attempts, attempts);
        assert_eq!(failed.failure_reason.as_deref(), Some("boom"));
        assert_delay_in_bounds(failed.delay_ms, attempts);
        assert_eq!(queue.claim_next(None).await.unwrap(), None);

        fast_forward(queue.store(), job.id).await;
    }
}

#[doc(hidden)]
pub async fn exhausted_attempts_fail_job(store: impl JobStore) {
    let queue = QueueService::new(store);
    let job = add(&queue, DEFAULT_NAME, JobOptions::default().with_max_attempts(2)).await;
    let error = ExecutionError::from("boom").with_stacktrace("at handler");

    queue.claim_next(None).await.unwrap().unwrap();
    let retried = queue.fail_job(job.id, &error).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Delayed);
    assert_eq!(retried.finished_on, None);

    fast_forward(queue.store(), job.id).await;
    queue.claim_next(None).await.unwrap().unwrap();
    let failed = queue.fail_job(job.id, &error).await.unwrap().unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.failure_reason.as_deref(), Some("boom"));
    assert_eq!(failed.stacktrace.as_deref(), Some("at handler"));
    assert!(failed.finished_on.is_some());
    assert_eq!(queue.claim_next(None).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn concurrent_claims_claim_once(store: impl JobStore) {
    let first = QueueService::new(store.clone());
    let second = QueueService::new(store);
    let job = add(&first, DEFAULT_NAME, JobOptions::default()).await;

    let (a, b) = tokio::join!(first.claim_next(None), second.claim_next(None));
    let claimed: Vec<Job> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, job.id);
}

#[doc(hidden)]
pub async fn cancel_only_pending_jobs(store: impl JobStore) {
    let queue = QueueService::new(store);
    let waiting = add(&queue, "waiting", JobOptions::default()).await;
    let delayed = add(
        &queue,
        "delayed",
        JobOptions::default().with_delay(TimeDelta::hours(1)),
    )
    .await;
    let active = add(&queue, "active", JobOptions::default()).await;
    queue.claim_next(Some("active")).await.unwrap().unwrap();

    for id in [waiting.id, delayed.id] {
        let cancelled = queue.cancel_job(id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.failure_reason.as_deref(), Some(CANCELLED_REASON));
        assert!(cancelled.finished_on.is_some());
    }

    let before = get(queue.store(), active.id).await;
    assert!(matches!(
        queue.cancel_job(active.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Active,
            ..
        })
    ));
    assert_eq!(get(queue.store(), active.id).await, before);

    assert!(matches!(
        queue.cancel_job(waiting.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Failed,
            ..
        })
    ));
    let unknown = JobId::new();
    assert!(matches!(
        queue.cancel_job(unknown).await,
        Err(QueueError::NotFound(id)) if id == unknown
    ));
}

#[doc(hidden)]
pub async fn process_message_retry_scenario(store: impl JobStore) {
    let queue = QueueService::new(store);
    let job = queue
        .add_job(
            "process-message",
            json!({"chatId": 1, "content": "hi"}),
            JobOptions::default().with_priority(10),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Waiting);

    let claimed = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Active);

    let error = ExecutionError::from("network unreachable");
    let failed = queue.fail_job(job.id, &error).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Delayed);
    assert_eq!(failed.attempts, 1);
    assert_delay_in_bounds(failed.delay_ms, 1);
    assert_eq!(queue.claim_next(None).await.unwrap(), None);

    fast_forward(queue.store(), job.id).await;
    let claimed = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.failure_reason, None);

    let completed = queue
        .complete_job(job.id, Some(json!({"content": "hello"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.progress, 100);

    let report = queue.get_job_status(job.id).await.unwrap().unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.result, Some(json!({"content": "hello"})));
    assert_eq!(report.error, None);
    assert_eq!(report.attempts, 1);
    assert!(report.finished_on.is_some());
}

#[doc(hidden)]
pub async fn parent_child_scenario(store: impl JobStore) {
    let queue = QueueService::new(store);
    let parent = add(&queue, DEFAULT_NAME, JobOptions::default()).await;
    let child = queue
        .add_job(
            DEFAULT_NAME,
            json!(null),
            JobOptions::default()
                .with_priority(100)
                .depends_on(parent.id),
        )
        .await
        .unwrap();
    assert_eq!(child.dependency_count, 1);

    let claimed = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, parent.id);
    assert_eq!(queue.claim_next(None).await.unwrap(), None);

    queue.complete_job(parent.id, None).await.unwrap().unwrap();
    let released = get(queue.store(), child.id).await;
    assert_eq!(released.status, JobStatus::Waiting);
    assert_eq!(released.dependency_count, 0);

    let claimed = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, child.id);
}

#[doc(hidden)]
pub async fn retry_failed_job(store: impl JobStore) {
    let queue = QueueService::new(store);
    let job = add(&queue, DEFAULT_NAME, JobOptions::default().with_max_attempts(1)).await;
    queue.claim_next(None).await.unwrap().unwrap();
    queue
        .fail_job(job.id, &ExecutionError::from("boom"))
        .await
        .unwrap()
        .unwrap();

    let retried = queue.retry_job(job.id).await.unwrap();

    assert_eq!(retried.status, JobStatus::Waiting);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.max_attempts, 2);
    assert_eq!(retried.failure_reason, None);
    assert_eq!(retried.finished_on, None);
    assert!(matches!(
        queue.retry_job(job.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Waiting,
            ..
        })
    ));
    assert!(matches!(
        queue.retry_job(JobId::new()).await,
        Err(QueueError::NotFound(_))
    ));

    let claimed = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
}

#[doc(hidden)]
pub async fn monitoring_queries(store: impl JobStore) {
    let queue = QueueService::new(store);
    let active = add(&queue, "active", JobOptions::default()).await;
    queue.claim_next(Some("active")).await.unwrap().unwrap();
    let completed = add(&queue, "completed", JobOptions::default()).await;
    queue.claim_next(Some("completed")).await.unwrap().unwrap();
    queue.complete_job(completed.id, None).await.unwrap().unwrap();
    let failed = add(&queue, "failed", JobOptions::default().with_max_attempts(1)).await;
    queue.claim_next(Some("failed")).await.unwrap().unwrap();
    queue
        .fail_job(failed.id, &ExecutionError::from("boom"))
        .await
        .unwrap()
        .unwrap();
    let waiting = add(&queue, "waiting", JobOptions::default()).await;
    add(
        &queue,
        "delayed",
        JobOptions::default().with_delay(TimeDelta::hours(1)),
    )
    .await;
    add(&queue, "blocked", JobOptions::default().depends_on(active.id)).await;

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(
        stats,
        crate::queue::QueueStats {
            waiting: 1,
            delayed: 1,
            waiting_dependency: 1,
            active: 1,
            completed: 1,
            failed: 1,
            paused: 0,
            total: 6,
        }
    );

    let pending = queue.get_pending_jobs(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, waiting.id);

    let completed_jobs = queue.poll_completed_jobs(10).await.unwrap();
    assert_eq!(completed_jobs.len(), 1);
    assert_eq!(completed_jobs[0].id, completed.id);

    let failed_jobs = queue.get_failed_jobs(10).await.unwrap();
    assert_eq!(failed_jobs.len(), 1);
    assert_eq!(failed_jobs[0].id, failed.id);
    assert_eq!(failed_jobs[0].failure_reason.as_deref(), Some("boom"));

    assert_eq!(queue.get_job_status(JobId::new()).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn cleanup_old_jobs(store: impl JobStore) {
    let queue = QueueService::new(store);
    let completed = add(&queue, DEFAULT_NAME, JobOptions::default()).await;
    queue.claim_next(None).await.unwrap().unwrap();
    queue.complete_job(completed.id, None).await.unwrap().unwrap();
    let waiting = add(&queue, DEFAULT_NAME, JobOptions::default()).await;

    assert_eq!(queue.cleanup_old_jobs(TimeDelta::hours(1)).await.unwrap(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(queue.cleanup_old_jobs(TimeDelta::zero()).await.unwrap(), 1);

    assert_eq!(queue.get_job(completed.id).await.unwrap(), None);
    assert!(queue.get_job(waiting.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn job_logs_are_kept_with_their_job(store: impl JobStore) {
    let finished = store
        .insert(Job {
            finished_on: Some(now() - TimeDelta::hours(1)),
            ..Job::raw_job().with_status(JobStatus::Completed)
        })
        .await
        .unwrap();
    let other = store.insert(Job::raw_job()).await.unwrap();
    let at = now();
    let log = |job_id, message: &str, level, offset| JobLog {
        job_id,
        message: message.to_owned(),
        level,
        timestamp: at + TimeDelta::milliseconds(offset),
    };
    let first = store
        .append_log(log(finished.id, "started", LogLevel::Info, 0))
        .await
        .unwrap();
    let second = store
        .append_log(log(finished.id, "slow response", LogLevel::Warn, 1))
        .await
        .unwrap();
    let third = store
        .append_log(log(finished.id, "done", LogLevel::Info, 2))
        .await
        .unwrap();
    let kept = store
        .append_log(log(other.id, "queued", LogLevel::Debug, 0))
        .await
        .unwrap();

    assert_eq!(
        store.select_logs(finished.id, 10).await.unwrap(),
        vec![first, second.clone(), third.clone()]
    );
    assert_eq!(
        store.select_logs(finished.id, 2).await.unwrap(),
        vec![second, third]
    );
    assert!(store.select_logs(JobId::new(), 10).await.unwrap().is_empty());

    assert_eq!(store.delete_finished_before(now()).await.unwrap(), 1);
    assert!(store.select_logs(finished.id, 10).await.unwrap().is_empty());
    assert_eq!(store.select_logs(other.id, 10).await.unwrap(), vec![kept]);
}

#[doc(hidden)]
pub async fn pause_and_resume_job(store: impl JobStore) {
    let queue = QueueService::new(store);
    let parent = add(&queue, "parent", JobOptions::default()).await;
    let child = add(&queue, "child", JobOptions::default().depends_on(parent.id)).await;
    let delayed = add(
        &queue,
        "delayed",
        JobOptions::default().with_delay(TimeDelta::hours(1)),
    )
    .await;
    let cancelled = add(&queue, "cancelled", JobOptions::default()).await;

    for id in [child.id, delayed.id, cancelled.id] {
        assert_eq!(queue.pause_job(id).await.unwrap().status, JobStatus::Paused);
    }
    assert!(matches!(
        queue.pause_job(child.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Paused,
            ..
        })
    ));
    assert_eq!(queue.claim_next(Some("cancelled")).await.unwrap(), None);
    assert_eq!(queue.get_queue_stats().await.unwrap().paused, 3);

    queue.claim_next(Some("parent")).await.unwrap().unwrap();
    assert!(matches!(
        queue.pause_job(parent.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Active,
            ..
        })
    ));
    queue.complete_job(parent.id, None).await.unwrap().unwrap();
    let child = get(queue.store(), child.id).await;
    assert_eq!(child.status, JobStatus::Paused);
    assert_eq!(child.dependency_count, 0);

    let child = queue.resume_job(child.id).await.unwrap();
    assert_eq!(child.status, JobStatus::Waiting);
    let delayed = queue.resume_job(delayed.id).await.unwrap();
    assert_eq!(delayed.status, JobStatus::Waiting);
    assert_eq!(delayed.delay_ms, 0);
    assert_eq!(
        queue.claim_next(Some("delayed")).await.unwrap().unwrap().id,
        delayed.id
    );
    assert!(matches!(
        queue.resume_job(child.id).await,
        Err(QueueError::InvalidState {
            status: JobStatus::Waiting,
            ..
        })
    ));
    assert!(matches!(
        queue.resume_job(JobId::new()).await,
        Err(QueueError::NotFound(_))
    ));

    let cancelled = queue.cancel_job(cancelled.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.failure_reason.as_deref(), Some(CANCELLED_REASON));
}

#[doc(hidden)]
pub async fn add_bulk_is_all_or_nothing(store: impl JobStore) {
    let queue = QueueService::new(store);
    let parent = add(&queue, "parent", JobOptions::default()).await;

    let rejected = queue
        .add_bulk([
            NewJob::new(DEFAULT_NAME, json!(1)),
            NewJob::new(DEFAULT_NAME, json!(2))
                .with_opts(JobOptions::default().depends_on(JobId::new())),
        ])
        .await;
    assert!(matches!(rejected, Err(QueueError::Validation(_))));
    assert_eq!(queue.get_queue_stats().await.unwrap().total, 1);

    let added = queue
        .add_bulk([
            NewJob::new(DEFAULT_NAME, json!(1)).with_opts(JobOptions::default().with_priority(5)),
            NewJob::new("child", json!(2)).with_opts(JobOptions::default().depends_on(parent.id)),
            NewJob::new(DEFAULT_NAME, json!(3)),
        ])
        .await
        .unwrap();

    assert_eq!(added.len(), 3);
    assert_eq!(added[1].status, JobStatus::WaitingDependency);
    for job in &added {
        assert_eq!(&get(queue.store(), job.id).await, job);
    }
    assert_eq!(
        queue.claim_next(Some(DEFAULT_NAME)).await.unwrap().unwrap().id,
        added[0].id
    );
}
