pub const CREATE_SUBMISSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  date            TEXT NOT NULL,
  location        TEXT NOT NULL,
  checklist_type  TEXT NOT NULL,
  submitted_at    TEXT NOT NULL,
  submitted_by    TEXT,
  completed_tasks INTEGER NOT NULL DEFAULT 0,
  total_tasks     INTEGER NOT NULL DEFAULT 0,
  task_details    TEXT
);
"#;

pub const INDEX_SUBMISSIONS_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_submissions_date ON submissions(date);";

pub const INDEX_SUBMISSIONS_SUBMITTED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_submissions_submitted_at ON submissions(submitted_at);";

pub fn schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SUBMISSIONS,
        INDEX_SUBMISSIONS_DATE,
        INDEX_SUBMISSIONS_SUBMITTED_AT,
    ]
}
