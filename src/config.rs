use anyhow::{bail, Context};
use chrono::{FixedOffset, NaiveDate};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::warn;

use crate::db::models::League;
use crate::ingestion::RetryPolicy;
use crate::picks::WorkerSettings;

const MAX_INTERVAL_MINUTES: u64 = 24 * 60;
const MAX_WINDOW_HOURS: i64 = 24;
const MAX_STALE_CLAIM_MINUTES: i64 = 7 * 24 * 60;

/// Auto-ingestion scheduler and pick-job worker for the bet tracker
#[derive(Parser, Debug, Clone)]
#[command(name = "bet-autopicks", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "autopicks.db")]
    pub database_path: String,

    /// Diagnostics API listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// Bearer token protecting the diagnostics API (required by `serve`)
    #[arg(long, env = "ADMIN_SECRET", hide_env_values = true)]
    pub admin_secret: Option<String>,

    /// Secret that encrypts stored API keys; an ephemeral one is generated if unset
    #[arg(long, env = "APP_SECRET", hide_env_values = true)]
    pub app_secret: Option<String>,

    /// Run the ingestion scheduler in `serve`
    #[arg(long, env = "AUTO_INGEST_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub auto_ingest_enabled: bool,

    /// Comma-separated leagues ingested on schedule
    #[arg(long, env = "AUTO_INGEST_LEAGUES", default_value = "NBA,NHL")]
    pub auto_ingest_leagues: String,

    /// Minutes between scheduled ingestion cycles
    #[arg(long, env = "AUTO_INGEST_INTERVAL_MINUTES", default_value = "15")]
    pub auto_ingest_interval_minutes: u64,

    /// UTC offset (hours) that defines "today"
    #[arg(long, env = "INGEST_UTC_OFFSET_HOURS", default_value = "0", allow_hyphen_values = true)]
    pub ingest_utc_offset_hours: i32,

    /// Scoreboard API base URL
    #[arg(long, env = "ESPN_BASE_URL", default_value = crate::scoreboard::espn::DEFAULT_BASE_URL)]
    pub espn_base_url: String,

    /// Per-request scoreboard timeout in seconds
    #[arg(long, env = "SCOREBOARD_TIMEOUT_SECS", default_value = "12")]
    pub scoreboard_timeout_secs: u64,

    /// Attempts per league and cycle for transient scoreboard failures
    #[arg(long, env = "FETCH_ATTEMPTS", default_value = "3")]
    pub fetch_attempts: u32,

    /// Hours before start during which a game gets a pick job
    #[arg(long, env = "PREGAME_WINDOW_HOURS", default_value = "2")]
    pub pregame_window_hours: i64,

    /// Run pick workers in `serve`
    #[arg(long, env = "AUTO_PICKS_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub auto_picks_enabled: bool,

    /// Number of concurrent pick workers
    #[arg(long, env = "AUTO_PICKS_CONCURRENCY", default_value = "2")]
    pub auto_picks_concurrency: usize,

    /// Seconds an idle worker waits before polling again
    #[arg(long, env = "AUTO_PICKS_POLL_SECONDS", default_value = "30")]
    pub auto_picks_poll_seconds: u64,

    /// Retries after a transient pick failure
    #[arg(long, env = "AUTO_PICKS_MAX_RETRIES", default_value = "2")]
    pub auto_picks_max_retries: u32,

    /// Minutes after which another worker may take over a claimed job
    #[arg(long, env = "STALE_CLAIM_MINUTES", default_value = "15")]
    pub stale_claim_minutes: i64,

    /// Pick generation API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = crate::picks::openai::DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-5")]
    pub openai_model: String,

    #[arg(long, env = "OPENAI_REASONING_EFFORT", default_value = "high")]
    pub openai_reasoning_effort: String,

    /// Timeout for one pick generation call in seconds
    #[arg(long, env = "PICK_TIMEOUT_SECS", default_value = "90")]
    pub pick_timeout_secs: u64,

    /// Let the generator suggest totals (over/under)
    #[arg(long, env = "ALLOW_TOTALS", default_value = "false", action = clap::ArgAction::Set)]
    pub allow_totals: bool,

    /// Seconds background tasks get to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "30")]
    pub shutdown_grace_secs: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the scheduler, the pick workers and the diagnostics API (default)
    Serve,
    /// Run one ingestion cycle now
    Ingest(DateArgs),
    /// Apply the enqueue policy to games already stored for a date
    Enqueue(DateArgs),
    /// Fetch and print one league's scoreboard without storing anything
    Probe {
        #[arg(long)]
        league: League,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Encrypt and store the pick generation API key
    SetApiKey {
        /// Read from stdin when omitted
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        key: Option<String>,
    },
    /// Print queue counts and the most recent jobs
    Jobs {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DateArgs {
    /// Use today's date (the default)
    #[arg(long, conflicts_with = "date")]
    pub today: bool,

    /// Date in YYYY-MM-DD
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Comma-separated leagues; defaults to AUTO_INGEST_LEAGUES
    #[arg(long)]
    pub leagues: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.leagues()?;
        self.utc_offset()?;
        if !(1..=MAX_INTERVAL_MINUTES).contains(&self.auto_ingest_interval_minutes) {
            bail!("auto_ingest_interval_minutes must be between 1 and {}", MAX_INTERVAL_MINUTES);
        }
        if !(1..=10).contains(&self.fetch_attempts) {
            bail!("fetch_attempts must be between 1 and 10");
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.pregame_window_hours) {
            bail!("pregame_window_hours must be between 1 and {}", MAX_WINDOW_HOURS);
        }
        if !(1..=16).contains(&self.auto_picks_concurrency) {
            bail!("auto_picks_concurrency must be between 1 and 16");
        }
        if !(1..=3600).contains(&self.auto_picks_poll_seconds) {
            bail!("auto_picks_poll_seconds must be between 1 and 3600");
        }
        if self.auto_picks_max_retries > 20 {
            bail!("auto_picks_max_retries must be at most 20");
        }
        if !(1..=MAX_STALE_CLAIM_MINUTES).contains(&self.stale_claim_minutes) {
            bail!("stale_claim_minutes must be between 1 and {}", MAX_STALE_CLAIM_MINUTES);
        }
        for (name, secs) in [
            ("scoreboard_timeout_secs", self.scoreboard_timeout_secs),
            ("pick_timeout_secs", self.pick_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ] {
            if !(1..=3600).contains(&secs) {
                bail!("{} must be between 1 and 3600", name);
            }
        }
        if matches!(self.command, None | Some(Command::Serve))
            && self.admin_secret.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            bail!("ADMIN_SECRET is required to serve the diagnostics API");
        }

        let window_minutes = self.pregame_window_hours.saturating_mul(60);
        if self.auto_ingest_interval_minutes as i64 >= window_minutes {
            warn!(
                "Ingestion interval ({} min) is not shorter than the pregame window ({} min); games may be missed",
                self.auto_ingest_interval_minutes, window_minutes
            );
        }
        Ok(())
    }

    pub fn leagues(&self) -> anyhow::Result<Vec<League>> {
        parse_leagues(&self.auto_ingest_leagues)
    }

    pub fn utc_offset(&self) -> anyhow::Result<FixedOffset> {
        self.ingest_utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("Invalid UTC offset {} hours", self.ingest_utc_offset_hours))
    }

    pub fn pregame_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.pregame_window_hours.clamp(1, MAX_WINDOW_HOURS))
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.auto_ingest_interval_minutes.clamp(1, MAX_INTERVAL_MINUTES) * 60)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.fetch_attempts)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            enabled: self.auto_picks_enabled,
            poll_interval: Duration::from_secs(self.auto_picks_poll_seconds),
            max_retries: self.auto_picks_max_retries,
            stale_after: chrono::Duration::minutes(self.stale_claim_minutes.clamp(1, MAX_STALE_CLAIM_MINUTES)),
            window: self.pregame_window(),
            pick_timeout: Duration::from_secs(self.pick_timeout_secs),
            allow_totals: self.allow_totals,
        }
    }
}

/// Parse a league list, rejecting unknown and empty lists.
pub fn parse_leagues(raw: &str) -> anyhow::Result<Vec<League>> {
    let leagues = League::parse_list(raw).with_context(|| {
        format!(
            "Unsupported league list {:?}; supported: {}",
            raw,
            League::ALL.map(|l| l.as_str()).join(", ")
        )
    })?;
    if leagues.is_empty() {
        bail!("No leagues given; use e.g. NBA,NHL");
    }
    Ok(leagues)
}
