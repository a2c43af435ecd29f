use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::provider::ScoreboardGateway;
use crate::db::models::{GameStatus, League, ScoreboardGame};
use crate::error::GatewayError;

pub const DEFAULT_BASE_URL: &str = "https://site.api.espn.com";

/// Scoreboard gateway backed by ESPN's public site API.
#[derive(Clone)]
pub struct EspnScoreboard {
    http: Client,
    /// Base URL, overridable for tests and mirrors
    base_url: Url,
}

impl EspnScoreboard {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid scoreboard base URL {:?}", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Scoreboard base URL {} cannot carry a path", base_url);
        }
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bet-autopicks/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(EspnScoreboard { http, base_url })
    }

    pub fn scoreboard_url(&self, league: League, date: NaiveDate) -> Url {
        let (sport, league_path) = league.scoreboard_path();
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["apis", "site", "v2", "sports", sport, league_path, "scoreboard"]);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("dates", &date.format("%Y%m%d").to_string());
        url
    }
}

#[async_trait]
impl ScoreboardGateway for EspnScoreboard {
    fn name(&self) -> &str {
        "ESPN"
    }

    async fn fetch(&self, league: League, date: NaiveDate) -> Result<Vec<ScoreboardGame>, GatewayError> {
        let url = self.scoreboard_url(league, date);
        debug!("Fetching scoreboard from {}", url);

        let resp = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("{} request failed: {}", league, e)))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited(format!("{} returned {}", url, status)));
        }
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::BadResponse(format!(
                "{} returned {}: {}",
                url,
                status,
                snippet(&body)
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("{} body read failed: {}", league, e)))?;
        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::BadResponse(format!("{} payload is not JSON: {}", league, e)))?;

        parse_scoreboard(&raw, league)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

/// Normalize a scoreboard payload into one record per competition.
///
/// Entries without an id or a parseable start time are skipped individually;
/// only a payload with no `events` array fails as a whole.
pub fn parse_scoreboard(raw: &Value, league: League) -> Result<Vec<ScoreboardGame>, GatewayError> {
    let events = raw
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::BadResponse(format!("{} payload has no events array", league)))?;

    let sport = extract_sport(raw, league);
    let mut seen: HashSet<String> = HashSet::new();
    let mut games = Vec::new();

    for event in events.iter().filter(|e| e.is_object()) {
        let competitions: Vec<&Value> = match event["competitions"].as_array() {
            Some(list) if !list.is_empty() => list.iter().filter(|c| c.is_object()).collect(),
            _ => vec![event],
        };

        for competition in competitions {
            let Some(external_id) = non_empty_str(&competition["id"]).or_else(|| non_empty_str(&event["id"])) else {
                continue;
            };
            if seen.contains(external_id) {
                continue;
            }

            let Some(start_time) = non_empty_str(&event["date"])
                .or_else(|| non_empty_str(&competition["date"]))
                .and_then(parse_start_time)
            else {
                debug!("Skipping {} event {}: no valid start time", league, external_id);
                continue;
            };
            seen.insert(external_id.to_string());

            let status_value = if competition["status"].is_object() {
                &competition["status"]
            } else {
                &event["status"]
            };

            let (mut home, mut away) = (&Value::Null, &Value::Null);
            for competitor in competition["competitors"].as_array().into_iter().flatten() {
                match competitor["homeAway"].as_str() {
                    Some("home") => home = competitor,
                    Some("away") => away = competitor,
                    _ => {}
                }
            }

            games.push(ScoreboardGame {
                external_id: external_id.to_string(),
                league,
                sport: sport.clone(),
                start_time,
                status: normalize_status(status_value),
                home_team: team_name(&home["team"]),
                away_team: team_name(&away["team"]),
                home_abbrev: non_empty_str(&home["team"]["abbreviation"]).map(str::to_string),
                away_abbrev: non_empty_str(&away["team"]["abbreviation"]).map(str::to_string),
                home_score: parse_score(&home["score"]),
                away_score: parse_score(&away["score"]),
            });
        }
    }

    Ok(games)
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn extract_sport(raw: &Value, league: League) -> String {
    non_empty_str(&raw["sports"][0]["name"])
        .map(str::to_lowercase)
        .unwrap_or_else(|| league.scoreboard_path().0.to_string())
}

fn team_name(team: &Value) -> String {
    non_empty_str(&team["displayName"])
        .or_else(|| non_empty_str(&team["name"]))
        .unwrap_or("TBD")
        .to_string()
}

fn parse_score(value: &Value) -> Option<i32> {
    value
        .as_str()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| value.as_i64().and_then(|v| i32::try_from(v).ok()))
}

/// Accepts RFC 3339 and the short `2026-02-10T03:00Z` form the API emits.
pub fn parse_start_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%MZ")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Map the source's status block onto our statuses; unknown → scheduled.
pub fn normalize_status(status: &Value) -> GameStatus {
    let status_type = &status["type"];
    let state = non_empty_str(&status_type["state"]).or_else(|| non_empty_str(&status_type["name"]));
    if let Some(state) = state {
        let state = state.to_lowercase();
        if state.contains("postpon") {
            return GameStatus::Postponed;
        }
        if state.contains("cancel") {
            return GameStatus::Canceled;
        }
        match state.as_str() {
            "pre" | "scheduled" | "status_scheduled" => return GameStatus::Scheduled,
            "in" | "in_progress" | "in progress" | "status_in_progress" => return GameStatus::InProgress,
            "post" | "final" | "finals" | "status_final" => return GameStatus::Final,
            _ => {}
        }
    }

    let description = status_type["description"].as_str().unwrap_or("").to_lowercase();
    if description.contains("postpon") {
        GameStatus::Postponed
    } else if description.contains("cancel") {
        GameStatus::Canceled
    } else if description.contains("final") {
        GameStatus::Final
    } else if description.contains("in progress") {
        GameStatus::InProgress
    } else {
        GameStatus::Scheduled
    }
}
