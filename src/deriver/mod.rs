use crate::catalog::{Catalog, ChecklistKey, ChecklistType, DeadlineTime, Location};
use crate::store::Submission;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Overdue,
}

/// Live compliance state for one (location, checklist type) pair. Derived on
/// every recomputation, never persisted; the submission stream is the source
/// of truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecklistStatus {
    pub location: Location,
    pub checklist_type: ChecklistType,
    pub status: Status,
    pub deadline: DeadlineTime,
    pub completed_at: Option<NaiveDateTime>,
    pub completed_tasks: u32,
    pub total_tasks: u32,
    pub critical_tasks_pending: Vec<String>,
}

/// Computes one status per catalog entry from the current day's submissions.
/// Pure function of its inputs; `now` drives both the calendar day and the
/// deadline comparison.
pub fn derive(
    catalog: &Catalog,
    submissions: &[Submission],
    now: NaiveDateTime,
) -> Vec<ChecklistStatus> {
    let today = now.date();
    let selected = select_latest_per_key(submissions, today);

    catalog
        .entries()
        .iter()
        .map(|entry| {
            let deadline_at = entry.deadline.on_date(today);
            let submission = selected.get(&entry.key()).copied();

            let (status, completed_at, completed_tasks, total_tasks) = match submission {
                None => {
                    let status = if now > deadline_at {
                        Status::Overdue
                    } else {
                        Status::Pending
                    };
                    (status, None, 0, entry.nominal_task_count)
                }
                Some(submission) if submission.is_complete() => (
                    Status::Completed,
                    Some(submission.submitted_at),
                    submission.completed_tasks,
                    submission.total_tasks,
                ),
                Some(submission) => {
                    let total = if submission.total_tasks > 0 {
                        submission.total_tasks
                    } else {
                        entry.nominal_task_count
                    };
                    let status = if submission.completed_tasks > 0 {
                        Status::InProgress
                    } else if now > deadline_at {
                        Status::Overdue
                    } else {
                        Status::Pending
                    };
                    (status, None, submission.completed_tasks, total)
                }
            };

            let critical_tasks_pending = if status == Status::Completed {
                Vec::new()
            } else {
                pending_critical_tasks(&entry.critical_tasks, submission)
            };

            ChecklistStatus {
                location: entry.location,
                checklist_type: entry.checklist_type,
                status,
                deadline: entry.deadline,
                completed_at,
                completed_tasks,
                total_tasks,
                critical_tasks_pending,
            }
        })
        .collect()
}

/// Picks the authoritative submission per key for the given day: the latest
/// by submission time, except that once full completion was reported the key
/// stays on its latest complete submission. A stale partial resubmission can
/// never regress a completed checklist within the same day.
pub(crate) fn select_latest_per_key<'a>(
    submissions: &'a [Submission],
    today: chrono::NaiveDate,
) -> HashMap<ChecklistKey, &'a Submission> {
    let mut latest: HashMap<ChecklistKey, &'a Submission> = HashMap::new();

    for submission in submissions {
        if submission.submitted_at.date() != today {
            continue;
        }
        if submission.is_malformed() {
            warn!(
                id = submission.id,
                location = submission.location.slug(),
                checklist_type = submission.checklist_type.as_str(),
                completed = submission.completed_tasks,
                total = submission.total_tasks,
                "dropping malformed submission"
            );
            continue;
        }

        latest
            .entry(submission.key())
            .and_modify(|current| {
                let replace = if current.is_complete() {
                    submission.is_complete() && submission.submitted_at >= current.submitted_at
                } else {
                    submission.is_complete() || submission.submitted_at >= current.submitted_at
                };
                if replace {
                    *current = submission;
                }
            })
            .or_insert(submission);
    }

    latest
}

fn pending_critical_tasks(
    critical_tasks: &[String],
    submission: Option<&Submission>,
) -> Vec<String> {
    let completed_names: Vec<&str> = submission
        .and_then(|submission| submission.task_details.as_ref())
        .map(|details| {
            details
                .iter()
                .filter(|task| task.completed)
                .map(|task| task.name.as_str())
                .collect()
        })
        .unwrap_or_default();

    critical_tasks
        .iter()
        .filter(|task| !completed_names.contains(&task.as_str()))
        .cloned()
        .collect()
}
