//! Pick worker: claims jobs from the queue and drives the pick generator.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::openai::{coerce_no_odds, PickGenerator, PickRequest};
use super::policy::in_pregame_window;
use crate::db::models::{GameStatus, JobState, PickJob};
use crate::db::Database;
use crate::error::{PickError, QueueError};
use crate::vault::{CredentialVault, PICKS_API_KEY};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub stale_after: ChronoDuration,
    pub window: ChronoDuration,
    pub pick_timeout: Duration,
    pub allow_totals: bool,
}

/// What one worker iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Disabled,
    NoCredential,
    Idle,
    Processed { job_id: i64, state: JobState },
    /// The claim was lost or the transition rejected; the job was left alone.
    Abandoned { job_id: i64 },
}

pub struct PickWorker {
    db: Database,
    vault: Arc<CredentialVault>,
    generator: Arc<dyn PickGenerator>,
    settings: WorkerSettings,
    owner: String,
    idle_polls: u64,
}

impl PickWorker {
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        generator: Arc<dyn PickGenerator>,
        settings: WorkerSettings,
        index: usize,
    ) -> Self {
        PickWorker {
            db,
            vault,
            generator,
            settings,
            owner: format!("worker-{}-{}", std::process::id(), index),
            idle_polls: 0,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Loop until `cancel` fires. A job already in flight is finished first.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Pick worker {} started (poll={}s, max_retries={})",
            self.owner,
            self.settings.poll_interval.as_secs(),
            self.settings.max_retries
        );

        while !cancel.is_cancelled() {
            match self.run_once().await {
                // More work may be waiting
                Ok(Tick::Processed { .. }) | Ok(Tick::Abandoned { .. }) => continue,
                Ok(_) => {}
                Err(e) => error!("Pick worker {} iteration failed: {:#}", self.owner, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Pick worker {} stopped", self.owner);
    }

    pub async fn run_once(&mut self) -> Result<Tick> {
        if !self.settings.enabled {
            if self.note_idle() {
                info!("Auto-picks disabled; worker {} idle", self.owner);
            }
            return Ok(Tick::Disabled);
        }

        if self.db.get_credential(PICKS_API_KEY)?.is_none() {
            if self.note_idle() {
                warn!("No API key stored; worker {} idle (run `set-api-key`)", self.owner);
            }
            return Ok(Tick::NoCredential);
        }

        let Some(job) = self.db.claim_next(&self.owner, self.settings.stale_after)? else {
            if self.note_idle() {
                let snap = self.db.queue_snapshot()?;
                info!(
                    "Worker {} idle: pending={} claimed={} succeeded={} failed={}",
                    self.owner, snap.pending, snap.claimed, snap.succeeded, snap.failed
                );
            }
            return Ok(Tick::Idle);
        };
        self.idle_polls = 0;

        if let Some(note) = job.last_error.as_deref().filter(|n| n.starts_with("recovered stale claim")) {
            warn!("Job #{}: {}", job.id, note);
        }

        self.process(&job).await
    }

    /// Idle logging on the first and every tenth consecutive idle poll.
    fn note_idle(&mut self) -> bool {
        self.idle_polls += 1;
        self.idle_polls == 1 || self.idle_polls % 10 == 0
    }

    async fn process(&self, job: &PickJob) -> Result<Tick> {
        info!(
            "Job #{} claimed by {} (game #{}, attempt {})",
            job.id,
            self.owner,
            job.game_id,
            job.attempts + 1
        );

        let marked = match self.attempt(job).await {
            Ok(result_json) => self
                .db
                .mark_succeeded(job.id, &self.owner, &result_json)
                .map(|_| JobState::Succeeded),
            Err(e) => {
                let state = self.db.mark_failed(
                    job.id,
                    &self.owner,
                    &e.to_string(),
                    e.is_retryable(),
                    self.settings.max_retries,
                );
                match &state {
                    Ok(JobState::Pending) => warn!(
                        "Job #{} re-queued ({}/{} retries): {}",
                        job.id,
                        job.attempts + 1,
                        self.settings.max_retries,
                        e
                    ),
                    Ok(_) => error!("Job #{} failed after {} attempt(s): {}", job.id, job.attempts + 1, e),
                    Err(_) => {}
                }
                state
            }
        };

        match marked {
            Ok(state) => Ok(Tick::Processed { job_id: job.id, state }),
            Err(e) => match e.downcast_ref::<QueueError>() {
                Some(QueueError::ClaimLost { .. }) => {
                    warn!("Job #{}: {}", job.id, e);
                    Ok(Tick::Abandoned { job_id: job.id })
                }
                Some(QueueError::InvalidTransition { .. }) => {
                    error!("Job #{}: {}", job.id, e);
                    Ok(Tick::Abandoned { job_id: job.id })
                }
                _ => Err(e),
            },
        }
    }

    /// One pick attempt; `Ok` carries the payload to store on the job.
    async fn attempt(&self, job: &PickJob) -> Result<String, PickError> {
        let game = self
            .db
            .get_game(job.game_id)
            .map_err(|e| PickError::Transient(format!("loading game: {:#}", e)))?
            .ok_or_else(|| PickError::Permanent(format!("game #{} not found", job.game_id)))?;

        let now = Utc::now();
        if game.status != GameStatus::Scheduled {
            info!("Job #{}: game status is {}, skipped", job.id, game.status);
            return Ok(json!({"skipped": format!("game status is {}", game.status)}).to_string());
        }
        if !in_pregame_window(game.start_time, now, self.settings.window) {
            info!("Job #{}: game outside pregame window, skipped", job.id);
            return Ok(json!({"skipped": "outside pregame window"}).to_string());
        }

        let stored = self
            .db
            .get_credential(PICKS_API_KEY)
            .map_err(|e| PickError::Transient(format!("loading credential: {:#}", e)))?
            .ok_or_else(|| PickError::Permanent("no API key stored".to_string()))?;
        let api_key = self
            .vault
            .open(&stored)
            .map_err(|e| PickError::Permanent(e.to_string()))?;

        let request = PickRequest::for_game(&game, self.settings.allow_totals, now);
        info!(
            "Job #{}: {} vs {} ({}) start={}, asking {}",
            job.id,
            game.home_team,
            game.away_team,
            game.league,
            game.start_time,
            self.generator.name()
        );

        let mut generated = tokio::time::timeout(
            self.settings.pick_timeout,
            self.generator.generate(&api_key, &request),
        )
        .await
        .map_err(|_| {
            PickError::Transient(format!(
                "pick generation timed out after {}s",
                self.settings.pick_timeout.as_secs()
            ))
        })??;

        if request.odds.is_none() {
            coerce_no_odds(&mut generated.pick);
        }
        info!(
            "Job #{}: pick saved -> result={} market={} confidence={}",
            job.id, generated.pick["result"], generated.pick["market"], generated.pick["confidence"]
        );
        Ok(generated.to_result_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Game, League};
    use crate::db::test_support::scoreboard_game;
    use crate::picks::openai::GeneratedPick;
    use crate::vault::resolve_secret;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGenerator {
        script: Mutex<VecDeque<Result<GeneratedPick, PickError>>>,
        keys_seen: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl FakeGenerator {
        fn scripted(responses: Vec<Result<GeneratedPick, PickError>>) -> Arc<Self> {
            Arc::new(FakeGenerator {
                script: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.keys_seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PickGenerator for FakeGenerator {
        async fn generate(&self, api_key: &str, _request: &PickRequest) -> Result<GeneratedPick, PickError> {
            self.keys_seen.lock().unwrap().push(api_key.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PickError::Permanent("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn pick() -> Result<GeneratedPick, PickError> {
        Ok(GeneratedPick {
            pick: serde_json::json!({"result": "BET", "market": "ML", "confidence": 0.6, "stake_u": 1, "is_value": true}),
            model: "test-model".to_string(),
            response_id: Some("resp_1".to_string()),
        })
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            enabled: true,
            poll_interval: Duration::from_millis(10),
            max_retries: 2,
            stale_after: ChronoDuration::minutes(15),
            window: ChronoDuration::hours(2),
            pick_timeout: Duration::from_secs(5),
            allow_totals: false,
        }
    }

    fn vault(secret: &str) -> Arc<CredentialVault> {
        Arc::new(CredentialVault::new(&resolve_secret(Some(secret))))
    }

    /// Database with one scheduled game starting in an hour and its pending job.
    fn setup(status: GameStatus) -> (Database, Game) {
        let db = Database::open_in_memory().unwrap();
        let sg = scoreboard_game(League::Nba, "401", Utc::now() + ChronoDuration::hours(1), status);
        let (game, _) = db.upsert_game(&sg).unwrap();
        // Status guards live in the policy; force a job in regardless
        db.enqueue_if_absent(&game).unwrap();
        (db, game)
    }

    fn worker(db: &Database, vault: Arc<CredentialVault>, generator: Arc<FakeGenerator>, settings: WorkerSettings) -> PickWorker {
        PickWorker::new(db.clone(), vault, generator, settings, 0)
    }

    fn job_result(db: &Database, game: &Game) -> Value {
        let job = &db.jobs_for_game(game.id).unwrap()[0];
        serde_json::from_str(job.result_json.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_success_stores_coerced_pick() {
        let (db, game) = setup(GameStatus::Scheduled);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = FakeGenerator::scripted(vec![pick()]);
        let mut w = worker(&db, v, generator.clone(), settings());

        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed { state: JobState::Succeeded, .. }));
        assert_eq!(generator.keys_seen.lock().unwrap().as_slice(), ["sk-test".to_string()]);

        let result = job_result(&db, &game);
        assert_eq!(result["pick"]["result"], "NO_BET");
        assert_eq!(result["pick"]["missing_data"], serde_json::json!(["odds"]));
        assert_eq!(result["model"], "test-model");

        assert_eq!(w.run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (db, game) = setup(GameStatus::Scheduled);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = FakeGenerator::scripted(vec![Err(PickError::Transient("429".into())), pick()]);
        let mut w = worker(&db, v, generator.clone(), settings());

        let first = w.run_once().await.unwrap();
        assert!(matches!(first, Tick::Processed { state: JobState::Pending, .. }));
        let second = w.run_once().await.unwrap();
        assert!(matches!(second, Tick::Processed { state: JobState::Succeeded, .. }));

        let job = &db.jobs_for_game(game.id).unwrap()[0];
        assert_eq!(job.attempts, 1);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let (db, game) = setup(GameStatus::Scheduled);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let transient = || Err(PickError::Transient("503".into()));
        let generator = FakeGenerator::scripted(vec![transient(), transient(), transient(), pick()]);
        let mut w = worker(&db, v, generator.clone(), settings());

        for _ in 0..3 {
            w.run_once().await.unwrap();
        }
        let job = &db.jobs_for_game(game.id).unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(w.run_once().await.unwrap(), Tick::Idle);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let (db, game) = setup(GameStatus::Scheduled);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = FakeGenerator::scripted(vec![Err(PickError::Permanent("401 invalid key".into()))]);
        let mut w = worker(&db, v, generator, settings());

        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed { state: JobState::Failed, .. }));
        let job = &db.jobs_for_game(game.id).unwrap()[0];
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.as_deref().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_key_sealed_under_other_secret_fails_permanently() {
        let (db, game) = setup(GameStatus::Scheduled);
        vault("old-secret").seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = FakeGenerator::scripted(vec![pick()]);
        let mut w = worker(&db, vault("new-secret"), generator.clone(), settings());

        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed { state: JobState::Failed, .. }));
        let job = &db.jobs_for_game(game.id).unwrap()[0];
        assert!(job.last_error.as_deref().unwrap().contains("cannot be decrypted"));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_game_no_longer_scheduled_is_skipped() {
        let (db, game) = setup(GameStatus::Postponed);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = FakeGenerator::scripted(vec![pick()]);
        let mut w = worker(&db, v, generator.clone(), settings());

        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed { state: JobState::Succeeded, .. }));
        assert_eq!(job_result(&db, &game)["skipped"], "game status is postponed");
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_idles_without_credential_or_when_disabled() {
        let (db, game) = setup(GameStatus::Scheduled);
        let generator = FakeGenerator::scripted(vec![pick()]);

        let mut w = worker(&db, vault("s3cret"), generator.clone(), settings());
        assert_eq!(w.run_once().await.unwrap(), Tick::NoCredential);

        let mut off = worker(&db, vault("s3cret"), generator.clone(), WorkerSettings { enabled: false, ..settings() });
        assert_eq!(off.run_once().await.unwrap(), Tick::Disabled);

        assert_eq!(db.jobs_for_game(game.id).unwrap()[0].state, JobState::Pending);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_generator_timeout_is_transient() {
        let (db, game) = setup(GameStatus::Scheduled);
        let v = vault("s3cret");
        v.seal_into(&db, PICKS_API_KEY, "sk-test").unwrap();
        let generator = Arc::new(FakeGenerator {
            script: Mutex::new(vec![pick()].into()),
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mut w = worker(
            &db,
            v,
            generator,
            WorkerSettings {
                pick_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed { state: JobState::Pending, .. }));
        let job = &db.jobs_for_game(game.id).unwrap()[0];
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (db, _game) = setup(GameStatus::Scheduled);
        let generator = FakeGenerator::scripted(vec![]);
        let w = worker(&db, vault("s3cret"), generator, settings());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(w.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
