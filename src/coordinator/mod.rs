use crate::catalog::Catalog;
use crate::deriver::{self, ChecklistStatus};
use crate::store::{StoreEvent, SubmissionFeed};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{error, info, warn};

const SNAPSHOT_BUFFER: usize = 16;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Full status snapshot republished on every recomputation. `stale` is set
/// when the snapshot could not be refreshed from the store (subscription lost
/// or a fetch failed) and carries the last known statuses instead.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub computed_at: NaiveDateTime,
    pub stale: bool,
    pub statuses: Vec<ChecklistStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Subscribed,
    Delivering,
    Reconnecting,
    Closed,
}

/// Long-lived listener around the status deriver: recomputes on every store
/// change event and on a periodic timer (deadlines pass without new data),
/// and fans snapshots out over a bounded broadcast channel. Slow subscribers
/// miss intermediate snapshots, they never block recomputation.
pub struct Coordinator {
    snapshots: broadcast::Sender<StatusSnapshot>,
    shutdown: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

impl Coordinator {
    pub fn spawn(
        catalog: Arc<Catalog>,
        feed: Arc<dyn SubmissionFeed>,
        refresh_interval: Duration,
    ) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);
        let (shutdown, shutdown_rx) = mpsc::channel(1);

        let worker = tokio::spawn(run_loop(
            catalog,
            feed,
            refresh_interval,
            snapshots.clone(),
            shutdown_rx,
        ));

        Self {
            snapshots,
            shutdown,
            worker,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.snapshots.subscribe()
    }

    /// Cancels the subscription and timer together. The in-flight
    /// recomputation finishes and publishes its last snapshot before the
    /// worker exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(error) = self.worker.await {
            error!(error = %error, "coordinator worker did not shut down cleanly");
        }
    }
}

async fn run_loop(
    catalog: Arc<Catalog>,
    feed: Arc<dyn SubmissionFeed>,
    refresh_interval: Duration,
    snapshots: broadcast::Sender<StatusSnapshot>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut events = feed.subscribe();
    let mut state = State::Subscribed;
    info!(
        state = ?state,
        refresh_seconds = refresh_interval.as_secs(),
        "coordinator subscribed"
    );

    let mut ticker = interval(refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_statuses: Vec<ChecklistStatus> = Vec::new();

    // Pull fallback: publish an initial snapshot before any push arrives.
    publish(&catalog, &*feed, &snapshots, &mut last_statuses);
    state = State::Delivering;
    info!(state = ?state, "initial snapshot published");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                publish(&catalog, &*feed, &snapshots, &mut last_statuses);
                state = State::Closed;
                info!(state = ?state, "coordinator closed");
                break;
            }
            _ = ticker.tick() => {
                publish(&catalog, &*feed, &snapshots, &mut last_statuses);
            }
            event = events.recv() => match event {
                Ok(StoreEvent::SubmissionsChanged { date }) => {
                    publish(&catalog, &*feed, &snapshots, &mut last_statuses);
                    info!(date = %date, "snapshot republished on store change");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "store events lagged; recomputing from scratch");
                    publish(&catalog, &*feed, &snapshots, &mut last_statuses);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    state = State::Reconnecting;
                    warn!(state = ?state, "store subscription lost; reconnecting");

                    match reconnect(&catalog, &*feed, &snapshots, &mut last_statuses, &mut shutdown).await {
                        Some(receiver) => {
                            events = receiver;
                            state = State::Delivering;
                            info!(state = ?state, "store subscription restored");
                        }
                        None => {
                            state = State::Closed;
                            info!(state = ?state, "coordinator closed during reconnect");
                            break;
                        }
                    }
                }
            }
        }
    }

    debug_assert_eq!(state, State::Closed);
}

/// Recomputes the snapshot and fans it out. On a fetch failure the last known
/// statuses are republished flagged stale; the failure is never silent.
fn publish(
    catalog: &Catalog,
    feed: &dyn SubmissionFeed,
    snapshots: &broadcast::Sender<StatusSnapshot>,
    last_statuses: &mut Vec<ChecklistStatus>,
) {
    let now = Local::now().naive_local();

    let snapshot = match feed.submissions_for_date(now.date()) {
        Ok(submissions) => {
            let statuses = deriver::derive(catalog, &submissions, now);
            *last_statuses = statuses.clone();
            StatusSnapshot {
                computed_at: now,
                stale: false,
                statuses,
            }
        }
        Err(error) => {
            warn!(error = %error, "current-day fetch failed; republishing stale snapshot");
            StatusSnapshot {
                computed_at: now,
                stale: true,
                statuses: last_statuses.clone(),
            }
        }
    };

    // Fire and forget: no subscribers is not an error.
    let _ = snapshots.send(snapshot);
}

/// Bounded exponential backoff until the feed hands out a working
/// subscription again. Each failed round republishes a stale-flagged
/// snapshot so consumers are never silently behind. Returns None when a
/// shutdown request interrupts the wait.
async fn reconnect(
    catalog: &Catalog,
    feed: &dyn SubmissionFeed,
    snapshots: &broadcast::Sender<StatusSnapshot>,
    last_statuses: &mut Vec<ChecklistStatus>,
    shutdown: &mut mpsc::Receiver<()>,
) -> Option<broadcast::Receiver<StoreEvent>> {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let now = Local::now().naive_local();
        let _ = snapshots.send(StatusSnapshot {
            computed_at: now,
            stale: true,
            statuses: last_statuses.clone(),
        });

        tokio::select! {
            _ = shutdown.recv() => return None,
            _ = sleep(backoff) => {}
        }

        let mut receiver = feed.subscribe();
        match receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Closed) => {
                warn!(backoff_seconds = backoff.as_secs(), "reconnect attempt failed");
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            _ => {
                // Replay with freshly fetched current-day submissions before
                // resuming delivery.
                publish(catalog, feed, snapshots, last_statuses);
                return Some(receiver);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChecklistType, DeadlineTime, ExpectedChecklist, Location};
    use crate::deriver::Status;
    use crate::store::{FeedError, Submission};
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tokio::time::{self, timeout as tokio_timeout};

    struct FakeFeed {
        events: Mutex<broadcast::Sender<StoreEvent>>,
        submissions: Mutex<Vec<Submission>>,
        fail_fetch: Mutex<bool>,
    }

    impl FakeFeed {
        fn new() -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                events: Mutex::new(events),
                submissions: Mutex::new(Vec::new()),
                fail_fetch: Mutex::new(false),
            }
        }

        fn push(&self, submission: Submission) {
            let date = submission.submitted_at.date();
            self.submissions.lock().unwrap().push(submission);
            let _ = self
                .events
                .lock()
                .unwrap()
                .send(StoreEvent::SubmissionsChanged { date });
        }

        fn drop_subscription(&self) {
            let (replacement, _) = broadcast::channel(16);
            *self.events.lock().unwrap() = replacement;
        }

        fn set_fail_fetch(&self, fail: bool) {
            *self.fail_fetch.lock().unwrap() = fail;
        }
    }

    impl SubmissionFeed for FakeFeed {
        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.events.lock().unwrap().subscribe()
        }

        fn submissions_for_date(&self, date: NaiveDate) -> Result<Vec<Submission>, FeedError> {
            if *self.fail_fetch.lock().unwrap() {
                return Err(FeedError::Query("store unreachable".to_string()));
            }

            Ok(self
                .submissions
                .lock()
                .unwrap()
                .iter()
                .filter(|submission| submission.submitted_at.date() == date)
                .cloned()
                .collect())
        }
    }

    fn midnight_deadline_catalog() -> Arc<Catalog> {
        // A 12:00 AM deadline is already past for the whole day, so statuses
        // are deterministic regardless of when the test runs.
        Arc::new(
            Catalog::from_entries(vec![ExpectedChecklist {
                location: Location::LittleElm,
                checklist_type: ChecklistType::Opening,
                deadline: DeadlineTime::parse("12:00 AM").unwrap(),
                nominal_task_count: 11,
                critical_tasks: Vec::new(),
            }])
            .expect("catalog"),
        )
    }

    fn complete_submission_now() -> Submission {
        Submission {
            id: 1,
            location: Location::LittleElm,
            checklist_type: ChecklistType::Opening,
            submitted_at: Local::now().naive_local(),
            submitted_by: None,
            completed_tasks: 11,
            total_tasks: 11,
            task_details: None,
        }
    }

    async fn next_snapshot(receiver: &mut broadcast::Receiver<StatusSnapshot>) -> StatusSnapshot {
        tokio_timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("snapshot within deadline")
            .expect("snapshot channel open")
    }

    /// Steps the paused clock until a matching snapshot arrives, with a hard
    /// iteration bound so a missing snapshot fails instead of spinning.
    async fn advance_until(
        snapshots: &mut broadcast::Receiver<StatusSnapshot>,
        accept: impl Fn(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        for _ in 0..64 {
            time::advance(Duration::from_secs(2)).await;
            loop {
                match snapshots.try_recv() {
                    Ok(snapshot) if accept(&snapshot) => return snapshot,
                    Ok(_) => continue,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(error) => panic!("snapshot channel failed: {error}"),
                }
            }
        }
        panic!("no matching snapshot after bounded clock advances");
    }

    #[tokio::test]
    async fn publishes_initial_snapshot_on_start() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(3600),
        );
        let mut snapshots = coordinator.subscribe();

        // Initial snapshot may already be gone if we subscribed late; poke
        // the feed so at least one more arrives.
        feed.push(complete_submission_now());

        let snapshot = next_snapshot(&mut snapshots).await;
        assert!(!snapshot.stale);
        assert_eq!(snapshot.statuses.len(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn store_change_triggers_recomputation() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(3600),
        );
        let mut snapshots = coordinator.subscribe();

        feed.push(complete_submission_now());

        let snapshot = loop {
            let snapshot = next_snapshot(&mut snapshots).await;
            if snapshot.statuses[0].status == Status::Completed {
                break snapshot;
            }
        };
        assert_eq!(snapshot.statuses[0].completed_tasks, 11);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_failure_marks_snapshot_stale() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(3600),
        );
        let mut snapshots = coordinator.subscribe();

        feed.push(complete_submission_now());
        let fresh = loop {
            let snapshot = next_snapshot(&mut snapshots).await;
            if snapshot.statuses[0].status == Status::Completed {
                break snapshot;
            }
        };

        feed.set_fail_fetch(true);
        feed.push(complete_submission_now());

        let stale = loop {
            let snapshot = next_snapshot(&mut snapshots).await;
            if snapshot.stale {
                break snapshot;
            }
        };
        // Stale snapshot carries the last good statuses.
        assert_eq!(stale.statuses, fresh.statuses);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_tick_republishes_without_store_changes() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(60),
        );
        let mut snapshots = coordinator.subscribe();

        time::advance(Duration::from_secs(61)).await;

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.statuses[0].status, Status::Overdue);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_subscription_recovers_with_backoff() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(3600),
        );
        let mut snapshots = coordinator.subscribe();

        // Wait for the initial snapshot so the worker already holds a
        // receiver on the original sender before that sender is dropped.
        let initial = next_snapshot(&mut snapshots).await;
        assert!(!initial.stale);

        feed.drop_subscription();

        // The first reconnect round publishes a stale marker.
        let stale = advance_until(&mut snapshots, |snapshot| snapshot.stale).await;
        assert_eq!(stale.statuses.len(), 1);

        // After the backoff sleep the fresh subscription is picked up and a
        // recomputed snapshot goes out.
        let recovered = advance_until(&mut snapshots, |snapshot| !snapshot.stale).await;
        assert_eq!(recovered.statuses.len(), 1);

        // And store changes flow again.
        feed.push(complete_submission_now());
        let live = advance_until(&mut snapshots, |snapshot| {
            snapshot.statuses[0].status == Status::Completed
        })
        .await;
        assert!(!live.stale);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_publishes_final_snapshot() {
        let feed = Arc::new(FakeFeed::new());
        let coordinator = Coordinator::spawn(
            midnight_deadline_catalog(),
            feed.clone(),
            Duration::from_secs(3600),
        );
        let mut snapshots = coordinator.subscribe();

        coordinator.shutdown().await;

        // At least the initial and the final drain snapshot were published.
        let mut seen = 0;
        while let Ok(snapshot) = snapshots.try_recv() {
            assert_eq!(snapshot.statuses.len(), 1);
            seen += 1;
        }
        assert!(seen >= 1);
    }
}
