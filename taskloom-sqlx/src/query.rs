use sqlx::{QueryBuilder, Sqlite};
use taskloom::{
    job::{JobId, JobStatus},
    store::{CandidateFilter, Condition, JobPatch, SortOrder},
};

use crate::types::{millis, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Sqlite>;
}

/// Clamp a limit to what SQLite accepts.
pub(crate) fn limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn push_statuses(builder: &mut QueryBuilder<'_, Sqlite>, statuses: &[JobStatus]) {
    if statuses.is_empty() {
        builder.push("0");
        return;
    }
    builder.push("status IN (");
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

/// A conditional update returning the updated job.
pub(crate) struct UpdateIf<'a> {
    pub id: JobId,
    pub condition: &'a Condition,
    pub patch: &'a JobPatch,
    pub now: i64,
}

impl ToQuery for UpdateIf<'_> {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let patch = self.patch;
        let mut builder = QueryBuilder::new("UPDATE taskloom_jobs SET ");
        let mut set = builder.separated(", ");
        // Assignments all see the row as it was before the update.
        set.push("id = id");
        if let Some(status) = patch.status {
            set.push("status_changed_at = CASE WHEN status = ");
            set.push_bind_unseparated(status.as_str());
            set.push_unseparated(" THEN status_changed_at ELSE ");
            set.push_bind_unseparated(self.now);
            set.push_unseparated(" END");
            set.push("status = ");
            set.push_bind_unseparated(status.as_str());
        }
        if let Some(attempts) = patch.attempts {
            set.push("attempts = ");
            set.push_bind_unseparated(i64::from(attempts));
        }
        if let Some(max_attempts) = patch.max_attempts {
            set.push("max_attempts = ");
            set.push_bind_unseparated(i64::from(max_attempts));
        }
        if let Some(delay_ms) = patch.delay_ms {
            set.push("delay = ");
            set.push_bind_unseparated(i64::try_from(delay_ms).unwrap_or(i64::MAX));
        }
        if let Some(progress) = patch.progress {
            set.push("progress = ");
            set.push_bind_unseparated(i64::from(progress));
        }
        if let Some(dependency_count) = patch.dependency_count {
            set.push("dependency_count = ");
            set.push_bind_unseparated(i64::from(dependency_count));
        }
        if let Some(result) = &patch.result {
            set.push("result = ");
            set.push_bind_unseparated(result.as_ref().map(|result| result.to_string()));
        }
        if let Some(failure_reason) = &patch.failure_reason {
            set.push("failure_reason = ");
            set.push_bind_unseparated(failure_reason.as_deref());
        }
        if let Some(stacktrace) = &patch.stacktrace {
            set.push("stacktrace = ");
            set.push_bind_unseparated(stacktrace.as_deref());
        }
        if let Some(processed_on) = patch.processed_on {
            set.push("processed_on = ");
            set.push_bind_unseparated(processed_on.map(millis));
        }
        if let Some(finished_on) = patch.finished_on {
            set.push("finished_on = ");
            set.push_bind_unseparated(finished_on.map(millis));
        }

        let condition = self.condition;
        builder.push(" WHERE id = ");
        builder.push_bind(self.id.to_string());
        builder.push(" AND ");
        push_statuses(&mut builder, &condition.status_in);
        if let Some(dependency_count) = condition.dependency_count {
            builder.push(" AND dependency_count = ");
            builder.push_bind(i64::from(dependency_count));
        }
        if let Some(processed_before) = condition.processed_before {
            builder.push(" AND processed_on < ");
            builder.push_bind(millis(processed_before));
        }
        if let Some(status_changed_at) = condition.status_changed_at {
            builder.push(" AND status_changed_at = ");
            builder.push_bind(millis(status_changed_at));
        }
        builder.push(" RETURNING ");
        builder.push(JOB_COLUMNS);
        builder
    }
}

impl ToQuery for CandidateFilter<'_> {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(JOB_COLUMNS);
        builder.push(
            " FROM taskloom_jobs WHERE (status = 'waiting' \
            OR (status = 'delayed' AND delay <= ",
        );
        builder.push_bind(millis(self.now));
        builder.push(
            " - status_changed_at) \
            OR (status = 'waiting_dependency' AND dependency_count = 0))",
        );
        if let Some(name) = self.name {
            builder.push(" AND name = ");
            builder.push_bind(name);
        }
        builder.push(" ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ");
        builder.push_bind(limit(self.limit));
        builder.push(" OFFSET ");
        builder.push_bind(limit(self.offset));
        builder
    }
}

/// Jobs in any of the statuses, in the given order.
pub(crate) struct ByStatus<'a> {
    pub statuses: &'a [JobStatus],
    pub order: SortOrder,
    pub limit: usize,
}

impl ToQuery for ByStatus<'_> {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(JOB_COLUMNS);
        builder.push(" FROM taskloom_jobs WHERE ");
        push_statuses(&mut builder, self.statuses);
        builder.push(match self.order {
            SortOrder::RecentlyFinished => " ORDER BY finished_on DESC NULLS LAST, rowid ASC",
            SortOrder::Priority => " ORDER BY priority DESC, created_at ASC, rowid ASC",
        });
        builder.push(" LIMIT ");
        builder.push_bind(limit(self.limit));
        builder
    }
}
