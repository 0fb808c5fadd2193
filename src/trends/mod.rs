use crate::catalog::Catalog;
use crate::deriver::select_latest_per_key;
use crate::store::{Submission, SubmissionStore};
use anyhow::anyhow;
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

pub const DEFAULT_MISSED_TASK_LIMIT: usize = 5;

/// One 7-day window, anchored on the current day of week rather than the
/// calendar Monday. `completion_rate` is the fraction of expected checklists
/// that reached full completion by their deadline that week.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    pub week_start: NaiveDate,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissedTask {
    pub task_name: String,
    pub missed_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub weeks: u32,
    pub computed_at: NaiveDateTime,
    pub trends: Vec<TrendBucket>,
    pub missed_tasks: Vec<MissedTask>,
}

/// A failed or timed-out history query is surfaced distinctly so callers can
/// tell "no data" apart from "fetch failed".
#[derive(Debug, Error)]
pub enum TrendError {
    #[error("history query failed: {source}")]
    Query {
        #[source]
        source: anyhow::Error,
    },
    #[error("history query timed out after {0:?}")]
    Timeout(Duration),
}

/// Pure aggregation over a fetched history window. Never mutates its inputs;
/// identical inputs yield identical output.
pub fn aggregate(
    catalog: &Catalog,
    history: &[Submission],
    weeks: u32,
    now: NaiveDateTime,
    missed_task_limit: usize,
) -> (Vec<TrendBucket>, Vec<MissedTask>) {
    let today = now.date();
    let window_start = today - ChronoDuration::days(i64::from(weeks) * 7);

    let trends = (0..weeks)
        .map(|bucket| {
            let week_start = window_start + ChronoDuration::days(i64::from(bucket) * 7);
            let completion_rate = bucket_completion_rate(catalog, history, week_start);

            TrendBucket {
                week_start,
                completion_rate,
            }
        })
        .collect();

    let missed_tasks = rank_missed_tasks(history, window_start, now, missed_task_limit);

    (trends, missed_tasks)
}

fn bucket_completion_rate(catalog: &Catalog, history: &[Submission], week_start: NaiveDate) -> f64 {
    let expected = catalog.len() * 7;
    if expected == 0 {
        return 0.0;
    }

    let completed = (0..7)
        .map(|offset| {
            let day = week_start + ChronoDuration::days(offset);
            let latest = select_latest_per_key(history, day);

            catalog
                .entries()
                .iter()
                .filter(|entry| {
                    latest.get(&entry.key()).is_some_and(|submission| {
                        submission.is_complete()
                            && submission.submitted_at <= entry.deadline.on_date(day)
                    })
                })
                .count()
        })
        .sum::<usize>();

    completed as f64 / expected as f64
}

/// Counts every incomplete task line in the window, ranked by count
/// descending with name ascending as the tie-break for determinism.
fn rank_missed_tasks(
    history: &[Submission],
    window_start: NaiveDate,
    now: NaiveDateTime,
    limit: usize,
) -> Vec<MissedTask> {
    let mut counts: HashMap<&str, u64> = HashMap::new();

    for submission in history {
        if submission.is_malformed()
            || submission.submitted_at.date() < window_start
            || submission.submitted_at >= now
        {
            continue;
        }

        let Some(details) = submission.task_details.as_ref() else {
            continue;
        };
        for task in details.iter().filter(|task| !task.completed) {
            *counts.entry(task.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut missed = counts
        .into_iter()
        .map(|(task_name, missed_count)| MissedTask {
            task_name: task_name.to_string(),
            missed_count,
        })
        .collect::<Vec<_>>();

    missed.sort_by(|left, right| {
        right
            .missed_count
            .cmp(&left.missed_count)
            .then_with(|| left.task_name.cmp(&right.task_name))
    });
    missed.into_iter().take(limit).collect()
}

/// Runs the history query off the async runtime with a caller-supplied
/// timeout, then aggregates. The query failing or expiring is a typed error,
/// never an empty report.
pub async fn fetch_trends(
    db_path: &Path,
    catalog: &Catalog,
    weeks: u32,
    query_timeout: Duration,
    missed_task_limit: usize,
) -> Result<TrendReport, TrendError> {
    let now = Local::now().naive_local();
    // Fetch from midnight of the window start; the buckets cover whole
    // calendar days, so an instant cutoff would drop part of the first day.
    let window_start = now.date() - ChronoDuration::days(i64::from(weeks) * 7);
    let since = window_start.and_time(NaiveTime::MIN);
    let path = db_path.to_path_buf();

    let history = fetch_history(
        move || SubmissionStore::open(&path).and_then(|store| store.submissions_since(since)),
        query_timeout,
    )
    .await?;

    let (trends, missed_tasks) = aggregate(catalog, &history, weeks, now, missed_task_limit);

    Ok(TrendReport {
        weeks,
        computed_at: now,
        trends,
        missed_tasks,
    })
}

async fn fetch_history<F>(fetch: F, query_timeout: Duration) -> Result<Vec<Submission>, TrendError>
where
    F: FnOnce() -> anyhow::Result<Vec<Submission>> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(fetch);

    timeout(query_timeout, task)
        .await
        .map_err(|_| TrendError::Timeout(query_timeout))?
        .map_err(|error| TrendError::Query {
            source: anyhow!("history query task failed: {error}"),
        })?
        .map_err(|source| TrendError::Query { source })
}
