use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod jobs;
pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection with mutex).
///
/// Every queue or game-store operation takes the lock for exactly one
/// statement or one transaction; it is never held across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn)
    }

    /// Fresh private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    // ── Games ────────────────────────────────────────────────────────────────

    /// Insert or refresh a game keyed by (league, external_id).
    ///
    /// Identity is kept; status, start time, teams and scores are overwritten
    /// and `last_synced_at` is bumped on every sighting.
    pub fn upsert_game(&self, game: &ScoreboardGame) -> Result<(Game, UpsertOutcome)> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("{} WHERE league=?1 AND external_id=?2", SELECT_GAME),
                params![game.league, game.external_id],
                map_game,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO games (
                        league, external_id, sport, home_team, away_team,
                        home_abbrev, away_abbrev, home_score, away_score,
                        start_time, status, created_at, last_synced_at
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?12)",
                    params![
                        game.league,
                        game.external_id,
                        game.sport,
                        game.home_team,
                        game.away_team,
                        game.home_abbrev,
                        game.away_abbrev,
                        game.home_score,
                        game.away_score,
                        game.start_time,
                        game.status,
                        now,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
            Some(stored) => {
                let changed = stored.status != game.status
                    || stored.start_time != game.start_time
                    || stored.home_score != game.home_score
                    || stored.away_score != game.away_score
                    || stored.home_team != game.home_team
                    || stored.away_team != game.away_team;
                tx.execute(
                    "UPDATE games SET
                        sport=?1, home_team=?2, away_team=?3, home_abbrev=?4, away_abbrev=?5,
                        home_score=?6, away_score=?7, start_time=?8, status=?9, last_synced_at=?10
                     WHERE id=?11",
                    params![
                        game.sport,
                        game.home_team,
                        game.away_team,
                        game.home_abbrev,
                        game.away_abbrev,
                        game.home_score,
                        game.away_score,
                        game.start_time,
                        game.status,
                        now,
                        stored.id,
                    ],
                )?;
                if changed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        let stored = tx.query_row(
            &format!("{} WHERE league=?1 AND external_id=?2", SELECT_GAME),
            params![game.league, game.external_id],
            map_game,
        )?;
        tx.commit()?;
        Ok((stored, outcome))
    }

    pub fn get_game(&self, id: i64) -> Result<Option<Game>> {
        let conn = self.conn()?;
        let game = conn
            .query_row(
                &format!("{} WHERE id=?1", SELECT_GAME),
                params![id],
                map_game,
            )
            .optional()?;
        Ok(game)
    }

    /// Games starting in `[from, to)`, optionally restricted to some leagues.
    pub fn list_games_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        leagues: &[League],
    ) -> Result<Vec<Game>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE start_time >= ?1 AND start_time < ?2 ORDER BY start_time ASC, id ASC",
            SELECT_GAME
        ))?;
        let games = stmt
            .query_map(params![from, to], map_game)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(games
            .into_iter()
            .filter(|g| leagues.is_empty() || leagues.contains(&g.league))
            .collect())
    }

    #[cfg(test)]
    pub fn count_games(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM games", [], |r| r.get(0))?)
    }

    // ── Ingestion runs ───────────────────────────────────────────────────────

    pub fn record_ingestion_run(&self, run: &IngestionRun) -> Result<i64> {
        let leagues_json = serde_json::to_string(&run.leagues)?;
        let outcomes_json = serde_json::to_string(&run.outcomes)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ingestion_runs (
                run_trigger, target_date, leagues_json, started_at, finished_at,
                games_fetched, games_upserted, jobs_enqueued, outcomes_json
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                run.trigger,
                run.target_date,
                leagues_json,
                run.started_at,
                run.finished_at,
                run.games_fetched as i64,
                run.games_upserted as i64,
                run.jobs_enqueued as i64,
                outcomes_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_ingestion_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_trigger, target_date, leagues_json, started_at, finished_at,
                    games_fetched, games_upserted, jobs_enqueued, outcomes_json
             FROM ingestion_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    trigger: row.get(1)?,
                    target_date: row.get(2)?,
                    leagues_json: row.get(3)?,
                    started_at: row.get(4)?,
                    finished_at: row.get(5)?,
                    games_fetched: row.get(6)?,
                    games_upserted: row.get(7)?,
                    jobs_enqueued: row.get(8)?,
                    outcomes_json: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            runs.push(IngestionRun {
                id: Some(row.id),
                trigger: row.trigger,
                target_date: row.target_date,
                leagues: serde_json::from_str(&row.leagues_json)?,
                started_at: row.started_at,
                finished_at: row.finished_at,
                games_fetched: row.games_fetched as usize,
                games_upserted: row.games_upserted as usize,
                jobs_enqueued: row.jobs_enqueued as usize,
                outcomes: serde_json::from_str(&row.outcomes_json)?,
            });
        }
        Ok(runs)
    }

    // ── Credentials ──────────────────────────────────────────────────────────

    /// Store (or replace) an already-encrypted credential.
    pub fn store_credential(&self, name: &str, ciphertext: &str, secret_fingerprint: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO credentials (name, ciphertext, secret_fingerprint, updated_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(name) DO UPDATE SET
                ciphertext=excluded.ciphertext,
                secret_fingerprint=excluded.secret_fingerprint,
                updated_at=excluded.updated_at",
            params![name, ciphertext, secret_fingerprint, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, name: &str) -> Result<Option<StoredCredential>> {
        let conn = self.conn()?;
        let credential = conn
            .query_row(
                "SELECT name, ciphertext, secret_fingerprint, updated_at
                 FROM credentials WHERE name=?1",
                params![name],
                |row| {
                    Ok(StoredCredential {
                        name: row.get(0)?,
                        ciphertext: row.get(1)?,
                        secret_fingerprint: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

struct RunRow {
    id: i64,
    trigger: String,
    target_date: NaiveDate,
    leagues_json: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    games_fetched: i64,
    games_upserted: i64,
    jobs_enqueued: i64,
    outcomes_json: String,
}

const SELECT_GAME: &str = "SELECT id, league, external_id, sport, home_team, away_team,
        home_abbrev, away_abbrev, home_score, away_score,
        start_time, status, created_at, last_synced_at
 FROM games";

fn map_game(row: &rusqlite::Row) -> rusqlite::Result<Game> {
    Ok(Game {
        id: row.get(0)?,
        league: row.get(1)?,
        external_id: row.get(2)?,
        sport: row.get(3)?,
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        home_abbrev: row.get(6)?,
        away_abbrev: row.get(7)?,
        home_score: row.get(8)?,
        away_score: row.get(9)?,
        start_time: row.get(10)?,
        status: row.get(11)?,
        created_at: row.get(12)?,
        last_synced_at: row.get(13)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    league         TEXT    NOT NULL,
    external_id    TEXT    NOT NULL,
    sport          TEXT    NOT NULL,
    home_team      TEXT    NOT NULL,
    away_team      TEXT    NOT NULL,
    home_abbrev    TEXT,
    away_abbrev    TEXT,
    home_score     INTEGER,
    away_score     INTEGER,
    start_time     TEXT    NOT NULL,
    status         TEXT    NOT NULL DEFAULT 'scheduled',
    created_at     TEXT    NOT NULL,
    last_synced_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS pick_jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    game_id     INTEGER NOT NULL,
    league      TEXT    NOT NULL,
    state       TEXT    NOT NULL DEFAULT 'pending',
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    result_json TEXT,
    claimed_by  TEXT,
    claimed_at  TEXT,
    enqueued_at TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL,
    finished_at TEXT,
    FOREIGN KEY (game_id) REFERENCES games(id)
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    run_trigger    TEXT    NOT NULL,
    target_date    TEXT    NOT NULL,
    leagues_json   TEXT    NOT NULL,
    started_at     TEXT    NOT NULL,
    finished_at    TEXT    NOT NULL,
    games_fetched  INTEGER NOT NULL,
    games_upserted INTEGER NOT NULL,
    jobs_enqueued  INTEGER NOT NULL,
    outcomes_json  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    name               TEXT PRIMARY KEY,
    ciphertext         TEXT NOT NULL,
    secret_fingerprint TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_games_league_external ON games(league, external_id);
CREATE INDEX IF NOT EXISTS idx_games_start ON games(start_time);
CREATE UNIQUE INDEX IF NOT EXISTS uq_pick_jobs_live_per_game
    ON pick_jobs(game_id) WHERE state IN ('pending', 'claimed', 'succeeded');
CREATE INDEX IF NOT EXISTS idx_pick_jobs_state_enqueued ON pick_jobs(state, enqueued_at, id);
"#;


#[cfg(test)]
mod tests {
    use super::test_support::scoreboard_game;
    use super::*;
    use chrono::{Duration, NaiveDate};

    #[test]
    fn test_upsert_is_idempotent_per_external_id() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now() + Duration::hours(1);
        let game = scoreboard_game(League::Nba, "401", start, GameStatus::Scheduled);

        let (first, outcome) = db.upsert_game(&game).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let (second, outcome) = db.upsert_game(&game).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(first.id, second.id);
        assert!(second.last_synced_at >= first.last_synced_at);
        assert_eq!(db.count_games().unwrap(), 1);
    }

    #[test]
    fn test_upsert_overwrites_mutable_fields() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now() + Duration::hours(1);
        let (first, _) = db
            .upsert_game(&scoreboard_game(League::Nba, "401", start, GameStatus::Scheduled))
            .unwrap();

        let mut corrected = scoreboard_game(
            League::Nba,
            "401",
            start + Duration::minutes(30),
            GameStatus::InProgress,
        );
        corrected.home_score = Some(12);
        let (second, outcome) = db.upsert_game(&corrected).unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, GameStatus::InProgress);
        assert_eq!(second.start_time, start + Duration::minutes(30));
        assert_eq!(second.home_score, Some(12));
    }

    #[test]
    fn test_same_external_id_in_different_leagues_is_distinct() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now();
        db.upsert_game(&scoreboard_game(League::Nba, "1", start, GameStatus::Scheduled))
            .unwrap();
        db.upsert_game(&scoreboard_game(League::Nhl, "1", start, GameStatus::Scheduled))
            .unwrap();
        assert_eq!(db.count_games().unwrap(), 2);
    }

    #[test]
    fn test_list_games_filters_by_range_and_league() {
        let db = Database::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        let midnight = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
        db.upsert_game(&scoreboard_game(League::Nba, "a", midnight + Duration::hours(3), GameStatus::Scheduled))
            .unwrap();
        db.upsert_game(&scoreboard_game(League::Nhl, "b", midnight + Duration::hours(4), GameStatus::Scheduled))
            .unwrap();
        db.upsert_game(&scoreboard_game(League::Nba, "c", midnight + Duration::hours(30), GameStatus::Scheduled))
            .unwrap();

        let all = db
            .list_games_starting_between(midnight, midnight + Duration::days(1), &[])
            .unwrap();
        assert_eq!(all.len(), 2);
        let nba = db
            .list_games_starting_between(midnight, midnight + Duration::days(1), &[League::Nba])
            .unwrap();
        assert_eq!(nba.len(), 1);
        assert_eq!(nba[0].external_id, "a");
    }

    #[test]
    fn test_ingestion_run_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let run = IngestionRun {
            id: None,
            trigger: "cli".into(),
            target_date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            leagues: vec![League::Nba, League::Nhl],
            started_at: now,
            finished_at: now,
            games_fetched: 3,
            games_upserted: 3,
            jobs_enqueued: 1,
            outcomes: vec![
                LeagueOutcome::Synced {
                    league: League::Nba,
                    fetched: 3,
                    inserted: 3,
                    updated: 0,
                    unchanged: 0,
                },
                LeagueOutcome::Failed {
                    league: League::Nhl,
                    kind: "unavailable".into(),
                    error: "timeout".into(),
                },
            ],
        };
        let id = db.record_ingestion_run(&run).unwrap();
        let runs = db.list_ingestion_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, Some(id));
        assert_eq!(runs[0].outcomes, run.outcomes);
        assert_eq!(runs[0].leagues, run.leagues);
    }

    #[test]
    fn test_store_credential_replaces_previous() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_credential("openai").unwrap().is_none());
        db.store_credential("openai", "v1:aaa", "fp1").unwrap();
        db.store_credential("openai", "v1:bbb", "fp2").unwrap();
        let stored = db.get_credential("openai").unwrap().unwrap();
        assert_eq!(stored.ciphertext, "v1:bbb");
        assert_eq!(stored.secret_fingerprint, "fp2");
    }
}
