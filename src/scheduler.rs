//! Periodic ingestion and ownership of every background task.

use chrono::{FixedOffset, Utc};
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::models::League;
use crate::ingestion::{today_in, Ingestor};

/// Runs an ingestion cycle immediately, then every `interval`.
pub struct Scheduler {
    ingestor: Arc<Ingestor>,
    leagues: Vec<League>,
    interval: Duration,
    utc_offset: FixedOffset,
}

impl Scheduler {
    pub fn new(ingestor: Arc<Ingestor>, leagues: Vec<League>, interval: Duration, utc_offset: FixedOffset) -> Self {
        Scheduler {
            ingestor,
            leagues,
            interval,
            utc_offset,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Auto-ingest scheduler started: every {} min, leagues={:?}",
            self.interval.as_secs() / 60,
            self.leagues
        );

        // First tick completes immediately
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Auto-ingest scheduler stopping");
                    break;
                }
                _ = ticker.tick() => self.cycle().await,
            }
        }
    }

    async fn cycle(&self) {
        let date = today_in(self.utc_offset, Utc::now());
        match self.ingestor.run(&self.leagues, date, "scheduler").await {
            Ok(summary) => debug!("Scheduled cycle recorded as run #{}", summary.run_id),
            Err(e) => error!("Scheduled ingestion cycle failed: {:#}", e),
        }
    }
}

/// Handles to every spawned background task plus the token that stops them.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        BackgroundTasks {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!("Spawning background task {}", name);
        let handle = tokio::spawn(task(self.cancel.child_token()));
        self.handles.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Cancel everything and wait up to `grace` for tasks to wind down;
    /// stragglers are aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) = self.handles.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        error!("Background task {} ended abnormally: {}", name, e);
                    }
                }
                info!("All {} background task(s) stopped", names.len());
            }
            Err(_) => {
                warn!(
                    "Background tasks still running after {}s grace; aborting (claimed jobs recover on next start)",
                    grace.as_secs()
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ScoreboardGame;
    use crate::db::Database;
    use crate::error::GatewayError;
    use crate::ingestion::RetryPolicy;
    use crate::scoreboard::ScoreboardGateway;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EmptyGateway;

    #[async_trait]
    impl ScoreboardGateway for EmptyGateway {
        async fn fetch(&self, _league: League, _date: NaiveDate) -> Result<Vec<ScoreboardGame>, GatewayError> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "empty"
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_first_cycle_immediately() {
        let db = Database::open_in_memory().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            db.clone(),
            Arc::new(EmptyGateway),
            RetryPolicy::new(1),
            chrono::Duration::hours(2),
        ));
        let scheduler = Scheduler::new(
            ingestor,
            vec![League::Nba, League::Nhl],
            Duration::from_secs(3600),
            FixedOffset::east_opt(0).unwrap(),
        );

        let mut tasks = BackgroundTasks::new();
        tasks.spawn("ingestion", |cancel| scheduler.run(cancel));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tasks.shutdown(Duration::from_secs(1)).await;

        let runs = db.list_ingestion_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, "scheduler");
        assert_eq!(runs[0].leagues, vec![League::Nba, League::Nhl]);
    }

    struct DownGateway;

    #[async_trait]
    impl ScoreboardGateway for DownGateway {
        async fn fetch(&self, _league: League, _date: NaiveDate) -> Result<Vec<ScoreboardGame>, GatewayError> {
            Err(GatewayError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_keep_the_schedule_running() {
        let db = Database::open_in_memory().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            db.clone(),
            Arc::new(DownGateway),
            RetryPolicy::new(1),
            chrono::Duration::hours(2),
        ));
        let scheduler = Scheduler::new(
            ingestor,
            vec![League::Nba, League::Nhl],
            Duration::from_secs(60),
            FixedOffset::east_opt(0).unwrap(),
        );

        let mut tasks = BackgroundTasks::new();
        tasks.spawn("ingestion", |cancel| scheduler.run(cancel));
        tokio::time::sleep(Duration::from_secs(150)).await;
        tasks.shutdown(Duration::from_secs(1)).await;

        let runs = db.list_ingestion_runs(10).unwrap();
        assert!(runs.len() >= 2, "expected repeated cycles, got {}", runs.len());
        for run in &runs {
            assert_eq!(run.outcomes.len(), 2);
            assert!(run.outcomes.iter().all(|o| o.is_failed()));
            assert_eq!(run.jobs_enqueued, 0);
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cooperative_tasks_and_aborts_stragglers() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut tasks = BackgroundTasks::new();

        let flag = finished.clone();
        tasks.spawn("cooperative", move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        tasks.spawn("stubborn", |_cancel| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(tasks.len(), 2);

        let started = std::time::Instant::now();
        tasks.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(finished.load(Ordering::SeqCst));
    }
}
