//! One ingestion cycle: fetch each league's scoreboard, upsert the games,
//! then hand the touched games to the enqueue policy.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::models::{Game, IngestionRun, League, LeagueOutcome, ScoreboardGame, UpsertOutcome};
use crate::db::Database;
use crate::error::GatewayError;
use crate::picks::policy;
use crate::scoreboard::ScoreboardGateway;

/// Caller-side retry for scoreboard fetches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(500),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): exponential plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(6);
        let base = self.base_delay.saturating_mul(1 << exp);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: i64,
    pub target_date: NaiveDate,
    pub outcomes: Vec<LeagueOutcome>,
    pub games_fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub jobs_enqueued: usize,
}

impl IngestionSummary {
    pub fn games_upserted(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn failed_leagues(&self) -> Vec<League> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(LeagueOutcome::league)
            .collect()
    }
}

pub struct Ingestor {
    db: Database,
    gateway: Arc<dyn ScoreboardGateway>,
    retry: RetryPolicy,
    window: ChronoDuration,
}

impl Ingestor {
    pub fn new(db: Database, gateway: Arc<dyn ScoreboardGateway>, retry: RetryPolicy, window: ChronoDuration) -> Self {
        Ingestor {
            db,
            gateway,
            retry,
            window,
        }
    }

    pub async fn run(&self, leagues: &[League], date: NaiveDate, trigger: &str) -> Result<IngestionSummary> {
        self.run_at(leagues, date, trigger, Utc::now()).await
    }

    /// Run a cycle evaluating the enqueue window at `now`.
    ///
    /// A failing league is recorded and skipped; only storage failures while
    /// writing the run record itself surface as `Err`.
    pub async fn run_at(
        &self,
        leagues: &[League],
        date: NaiveDate,
        trigger: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestionSummary> {
        let started_at = Utc::now();
        info!(
            "Ingestion ({}) starting: date={} leagues={}",
            trigger,
            date,
            leagues.iter().map(League::as_str).collect::<Vec<_>>().join(",")
        );

        let mut outcomes = Vec::with_capacity(leagues.len());
        let mut touched: Vec<Game> = Vec::new();
        let (mut fetched, mut inserted, mut updated, mut unchanged) = (0, 0, 0, 0);

        for &league in leagues {
            let games = match self.fetch_with_retry(league, date).await {
                Ok(games) => games,
                Err(e) => {
                    if matches!(e, GatewayError::BadResponse(_)) {
                        error!("Data quality: {} scoreboard for {} rejected: {}", league, date, e);
                    } else {
                        warn!("{} scoreboard for {} unavailable: {}", league, date, e);
                    }
                    outcomes.push(LeagueOutcome::Failed {
                        league,
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.store_games(&games, &mut touched) {
                Ok((ins, upd, unch)) => {
                    info!(
                        "{}: fetched={} inserted={} updated={} unchanged={}",
                        league,
                        games.len(),
                        ins,
                        upd,
                        unch
                    );
                    fetched += games.len();
                    inserted += ins;
                    updated += upd;
                    unchanged += unch;
                    outcomes.push(LeagueOutcome::Synced {
                        league,
                        fetched: games.len(),
                        inserted: ins,
                        updated: upd,
                        unchanged: unch,
                    });
                }
                Err(e) => {
                    error!("Failed to store {} games: {:#}", league, e);
                    outcomes.push(LeagueOutcome::Failed {
                        league,
                        kind: "storage".to_string(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        let synced: Vec<League> = outcomes
            .iter()
            .filter(|o| !o.is_failed())
            .map(LeagueOutcome::league)
            .collect();
        let jobs_enqueued = match self.enqueue(&synced, &mut touched, now) {
            Ok(n) => n,
            Err(e) => {
                error!("Enqueue policy failed: {:#}", e);
                0
            }
        };

        let run = IngestionRun {
            id: None,
            trigger: trigger.to_string(),
            target_date: date,
            leagues: leagues.to_vec(),
            started_at,
            finished_at: Utc::now(),
            games_fetched: fetched,
            games_upserted: inserted + updated + unchanged,
            jobs_enqueued,
            outcomes: outcomes.clone(),
        };
        let run_id = self.db.record_ingestion_run(&run)?;

        let summary = IngestionSummary {
            run_id,
            target_date: date,
            outcomes,
            games_fetched: fetched,
            inserted,
            updated,
            unchanged,
            jobs_enqueued,
        };
        let failed = summary.failed_leagues();
        if failed.is_empty() {
            info!(
                "Ingestion run #{} done: fetched={} upserted={} enqueued={}",
                run_id,
                summary.games_fetched,
                summary.games_upserted(),
                jobs_enqueued
            );
        } else {
            warn!(
                "Ingestion run #{} done with {} failed league(s) {:?}: fetched={} upserted={} enqueued={}",
                run_id,
                failed.len(),
                failed,
                summary.games_fetched,
                summary.games_upserted(),
                jobs_enqueued
            );
        }
        Ok(summary)
    }

    async fn fetch_with_retry(&self, league: League, date: NaiveDate) -> Result<Vec<ScoreboardGame>, GatewayError> {
        let mut attempt = 1;
        loop {
            match self.gateway.fetch(league, date).await {
                Ok(games) => return Ok(games),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "{} {} fetch attempt {}/{} failed: {}; retrying in {:?}",
                        self.gateway.name(),
                        league,
                        attempt,
                        self.retry.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn store_games(&self, games: &[ScoreboardGame], touched: &mut Vec<Game>) -> Result<(usize, usize, usize)> {
        let (mut inserted, mut updated, mut unchanged) = (0, 0, 0);
        for game in games {
            let (stored, outcome) = self.db.upsert_game(game)?;
            match outcome {
                UpsertOutcome::Inserted => inserted += 1,
                UpsertOutcome::Updated => updated += 1,
                UpsertOutcome::Unchanged => unchanged += 1,
            }
            touched.push(stored);
        }
        Ok((inserted, updated, unchanged))
    }

    /// Touched games plus stored games already inside their window, so games
    /// just past a day boundary are not missed. Only leagues synced in this
    /// cycle are considered.
    fn enqueue(&self, leagues: &[League], touched: &mut Vec<Game>, now: DateTime<Utc>) -> Result<usize> {
        touched.extend(policy::games_in_window(&self.db, leagues, now, self.window)?);
        policy::enqueue_due(&self.db, touched, now, self.window)
    }
}

/// Calendar date at `now` in `offset`.
pub fn today_in(offset: FixedOffset, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// `[start, end)` in UTC of the calendar day `date` in `offset`.
pub fn day_bounds(date: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = (local_midnight - ChronoDuration::seconds(offset.local_minus_utc().into())).and_utc();
    (start, start + ChronoDuration::days(1))
}
