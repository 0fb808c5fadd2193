pub mod queries;

use crate::catalog::{ChecklistKey, ChecklistType, Location};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

const EVENT_BUFFER: usize = 64;

/// One task line inside a submission, in checklist order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub name: String,
    pub completed: bool,
}

/// A staff-reported progress snapshot against one checklist. Multiple
/// submissions for the same key on the same day are expected; later ones
/// supersede earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub id: i64,
    pub location: Location,
    pub checklist_type: ChecklistType,
    pub submitted_at: NaiveDateTime,
    pub submitted_by: Option<String>,
    pub completed_tasks: u32,
    pub total_tasks: u32,
    pub task_details: Option<Vec<TaskDetail>>,
}

impl Submission {
    pub fn key(&self) -> ChecklistKey {
        ChecklistKey {
            location: self.location,
            checklist_type: self.checklist_type,
        }
    }

    /// Full completion requires at least one task; a 0/0 submission reports
    /// no progress, not a finished checklist.
    pub fn is_complete(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks == self.total_tasks
    }

    /// completed_tasks must never exceed total_tasks. Violations are dropped
    /// by the deriver and aggregator, never propagated.
    pub fn is_malformed(&self) -> bool {
        self.completed_tasks > self.total_tasks
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionInput {
    pub location: Location,
    pub checklist_type: ChecklistType,
    #[serde(default)]
    pub submitted_by: Option<String>,
    pub completed_tasks: u32,
    pub total_tasks: u32,
    #[serde(default)]
    pub task_details: Option<Vec<TaskDetail>>,
}

/// Change notification pushed by the store on every write.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    SubmissionsChanged { date: NaiveDate },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("submission query failed: {0}")]
    Query(String),
}

/// Push subscription plus current-day pull, as consumed by the coordinator.
pub trait SubmissionFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
    fn submissions_for_date(&self, date: NaiveDate) -> Result<Vec<Submission>, FeedError>;
}

pub struct SubmissionStore {
    conn: Connection,
}

impl SubmissionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite DB: {}", path.display()))?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    pub fn init_schema(&self) -> Result<()> {
        queries::schema_statements()
            .iter()
            .try_for_each(|statement| {
                self.conn
                    .execute(statement, [])
                    .context("Failed to initialize schema")
                    .map(|_| ())
            })
    }

    pub fn insert_submission(
        &self,
        input: &SubmissionInput,
        submitted_at: NaiveDateTime,
    ) -> Result<Submission> {
        let date_str = submitted_at.date().format("%Y-%m-%d").to_string();
        let task_details_json = input
            .task_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize task details")?;

        self.conn
            .execute(
                "INSERT INTO submissions (date, location, checklist_type, submitted_at, submitted_by, completed_tasks, total_tasks, task_details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    date_str,
                    input.location.slug(),
                    input.checklist_type.as_str(),
                    submitted_at,
                    input.submitted_by,
                    input.completed_tasks,
                    input.total_tasks,
                    task_details_json,
                ],
            )
            .context("Failed to insert submission")?;

        let id = self.conn.last_insert_rowid();

        Ok(Submission {
            id,
            location: input.location,
            checklist_type: input.checklist_type,
            submitted_at,
            submitted_by: input.submitted_by.clone(),
            completed_tasks: input.completed_tasks,
            total_tasks: input.total_tasks,
            task_details: input.task_details.clone(),
        })
    }

    pub fn submissions_for_date(&self, date: NaiveDate) -> Result<Vec<Submission>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let mut statement = self.conn.prepare(
            "SELECT id, location, checklist_type, submitted_at, submitted_by, completed_tasks, total_tasks, task_details
             FROM submissions
             WHERE date = ?1
             ORDER BY submitted_at ASC",
        )?;

        let rows = statement
            .query_map(params![date_str], map_raw_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query submissions for date")?;

        Ok(decode_rows(rows))
    }

    pub fn submissions_since(&self, since: NaiveDateTime) -> Result<Vec<Submission>> {
        let mut statement = self.conn.prepare(
            "SELECT id, location, checklist_type, submitted_at, submitted_by, completed_tasks, total_tasks, task_details
             FROM submissions
             WHERE submitted_at >= ?1
             ORDER BY submitted_at ASC",
        )?;

        let rows = statement
            .query_map(params![since], map_raw_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query submission history")?;

        Ok(decode_rows(rows))
    }

    pub fn latest_submission_at(&self) -> Result<Option<NaiveDateTime>> {
        let timestamp = self
            .conn
            .query_row(
                "SELECT submitted_at FROM submissions ORDER BY submitted_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        Ok(timestamp)
    }

    pub fn submission_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM submissions", [], |row| row.get(0))
            .context("Failed to count submissions")
    }
}

struct RawSubmissionRow {
    id: i64,
    location: String,
    checklist_type: String,
    submitted_at: NaiveDateTime,
    submitted_by: Option<String>,
    completed_tasks: i64,
    total_tasks: i64,
    task_details: Option<String>,
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSubmissionRow> {
    Ok(RawSubmissionRow {
        id: row.get(0)?,
        location: row.get(1)?,
        checklist_type: row.get(2)?,
        submitted_at: row.get(3)?,
        submitted_by: row.get(4)?,
        completed_tasks: row.get(5)?,
        total_tasks: row.get(6)?,
        task_details: row.get(7)?,
    })
}

/// Rows carrying an unknown location or checklist type are skipped with a
/// warning; foreign data must not break the pipeline.
fn decode_rows(rows: Vec<RawSubmissionRow>) -> Vec<Submission> {
    rows.into_iter()
        .filter_map(|row| {
            let location = match Location::from_str(&row.location) {
                Ok(value) => value,
                Err(_) => {
                    warn!(id = row.id, location = %row.location, "skipping submission with unknown location");
                    return None;
                }
            };
            let checklist_type = match ChecklistType::from_str(&row.checklist_type) {
                Ok(value) => value,
                Err(_) => {
                    warn!(id = row.id, checklist_type = %row.checklist_type, "skipping submission with unknown checklist type");
                    return None;
                }
            };
            let task_details = row.task_details.as_deref().and_then(|raw| {
                serde_json::from_str::<Vec<TaskDetail>>(raw)
                    .map_err(|error| {
                        warn!(id = row.id, error = %error, "dropping unreadable task details");
                        error
                    })
                    .ok()
            });

            Some(Submission {
                id: row.id,
                location,
                checklist_type,
                submitted_at: row.submitted_at,
                submitted_by: row.submitted_by,
                completed_tasks: row.completed_tasks.max(0) as u32,
                total_tasks: row.total_tasks.max(0) as u32,
                task_details,
            })
        })
        .collect()
}

/// Shared write handle: persists submissions and broadcasts a change event on
/// every insert. Opens the DB per operation so the handle stays Send + Sync.
pub struct SubmissionHub {
    db_path: PathBuf,
    events: broadcast::Sender<StoreEvent>,
}

impl SubmissionHub {
    pub fn new(db_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { db_path, events }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record(&self, input: &SubmissionInput, submitted_at: NaiveDateTime) -> Result<Submission> {
        let store = SubmissionStore::open(&self.db_path)?;
        let submission = store.insert_submission(input, submitted_at)?;

        // Nobody listening is fine; the coordinator may not be running.
        let _ = self.events.send(StoreEvent::SubmissionsChanged {
            date: submitted_at.date(),
        });

        Ok(submission)
    }
}

impl SubmissionFeed for SubmissionHub {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn submissions_for_date(&self, date: NaiveDate) -> Result<Vec<Submission>, FeedError> {
        SubmissionStore::open(&self.db_path)
            .and_then(|store| store.submissions_for_date(date))
            .map_err(|error| FeedError::Query(error.to_string()))
    }
}
