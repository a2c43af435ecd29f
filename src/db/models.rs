use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Leagues the scoreboard source can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum League {
    Nba,
    Nhl,
    Nfl,
}

impl League {
    pub const ALL: [League; 3] = [League::Nba, League::Nhl, League::Nfl];

    pub fn as_str(&self) -> &'static str {
        match self {
            League::Nba => "NBA",
            League::Nhl => "NHL",
            League::Nfl => "NFL",
        }
    }

    /// (sport, league) path segments on the scoreboard API.
    pub fn scoreboard_path(&self) -> (&'static str, &'static str) {
        match self {
            League::Nba => ("basketball", "nba"),
            League::Nhl => ("hockey", "nhl"),
            League::Nfl => ("football", "nfl"),
        }
    }

    /// Parse a comma-separated list such as `"nba, NHL"`. Duplicates collapse.
    pub fn parse_list(raw: &str) -> Result<Vec<League>, ParseEnumError> {
        let mut leagues = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let league: League = part.parse()?;
            if !leagues.contains(&league) {
                leagues.push(league);
            }
        }
        Ok(leagues)
    }
}

impl FromStr for League {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NBA" => Ok(League::Nba),
            "NHL" => Ok(League::Nhl),
            "NFL" => Ok(League::Nfl),
            _ => Err(ParseEnumError {
                kind: "league",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
    Postponed,
    Canceled,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Final => "final",
            GameStatus::Postponed => "postponed",
            GameStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for GameStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" => Ok(GameStatus::InProgress),
            "final" => Ok(GameStatus::Final),
            "postponed" => Ok(GameStatus::Postponed),
            "canceled" => Ok(GameStatus::Canceled),
            _ => Err(ParseEnumError {
                kind: "game status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a pick job: `pending -> claimed -> {succeeded | pending | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Claimed,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "claimed" => Ok(JobState::Claimed),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(ParseEnumError {
                kind: "job state",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(League);
text_column!(GameStatus);
text_column!(JobState);

/// A game as normalized from the scoreboard source, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreboardGame {
    pub external_id: String,
    pub league: League,
    pub sport: String,
    pub start_time: DateTime<Utc>,
    pub status: GameStatus,
    pub home_team: String,
    pub away_team: String,
    pub home_abbrev: Option<String>,
    pub away_abbrev: Option<String>,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
}

/// A locally stored game. `(league, external_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub league: League,
    pub external_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub home_abbrev: Option<String>,
    pub away_abbrev: Option<String>,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub status: GameStatus,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// One unit of "generate a pick for game G" work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickJob {
    pub id: i64,
    pub game_id: i64,
    pub league: League,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Opaque JSON produced by the pick generator
    pub result_json: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created,
    AlreadyActive,
    AlreadyDone,
}

/// Counts per job state, for the diagnostics surface and idle logging.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub total: i64,
    pub pending: i64,
    pub claimed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Per-league result inside one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LeagueOutcome {
    Synced {
        league: League,
        fetched: usize,
        inserted: usize,
        updated: usize,
        unchanged: usize,
    },
    Failed {
        league: League,
        kind: String,
        error: String,
    },
}

impl LeagueOutcome {
    pub fn league(&self) -> League {
        match self {
            LeagueOutcome::Synced { league, .. } | LeagueOutcome::Failed { league, .. } => *league,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LeagueOutcome::Failed { .. })
    }
}

/// Append-only record of one ingestion cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Option<i64>,
    /// "scheduler" | "cli" | "api"
    pub trigger: String,
    pub target_date: NaiveDate,
    pub leagues: Vec<League>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub games_fetched: usize,
    pub games_upserted: usize,
    pub jobs_enqueued: usize,
    pub outcomes: Vec<LeagueOutcome>,
}

/// An API key as it rests in the database: ciphertext plus the fingerprint of
/// the secret that produced it.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub name: String,
    pub ciphertext: String,
    pub secret_fingerprint: String,
    pub updated_at: DateTime<Utc>,
}
