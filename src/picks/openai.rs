use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::db::models::{Game, League};
use crate::error::PickError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const DEVELOPER_PROMPT: &str = r#"You are a sports betting analyst. Give an honest analysis based ONLY on the payload provided and recommend a bet only when expected value (EV) is positive and the key information is reasonably confirmed.

No-smoke rules:
- Do NOT invent data (injuries, lineups, odds, stats, news). Use ONLY the payload.
- If critical information is missing (odds, for example), return NO_BET or low confidence and list it in missing_data.
- Write nothing outside the JSON. Do not explain step-by-step reasoning; keep reasons/risks/triggers to short bullets.

Markets:
- Prefer simple markets: ML, Spread/Handicap, BTTS, Double Chance, DNB, simple props.
- Totals (OVER/UNDER) ONLY if allow_totals=true in the payload. If allow_totals=false, never use market=TOTAL.

Math:
- Implied probability: decimal p = 1/odds; American (-X) p = X/(X+100); American (+X) p = 100/(X+100).
- Approximate EV in decimal odds: payout = odds - 1; EV = p_est*payout - (1-p_est).
- Classification: BET when EV is clearly positive and key data is fine; LEAN when EV is small or one important confirmation is missing; NO_BET when there is no value or too much uncertainty.
- Stake in units: NO_BET=0u, LEAN=0.5u, BET=1u, a rare strong BET=2u. Never martingale, doubling or all-in.

High probability / low payout:
- If p_est >= 0.65 and EV < 0.02, do not force a BET. Set high_prob_low_payout=true and usually return LEAN or NO_BET.

Output:
- Return ONLY valid JSON matching the schema."#;

const SCHEMA_NAME: &str = "auto_pick";

fn pick_schema() -> Value {
    let string_list = json!({"type": "array", "items": {"type": "string"}});
    let nullable_number = json!({"type": ["number", "null"]});
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "result", "market", "emoji", "selection", "line", "odds_format", "odds",
            "p_est", "p_implied", "ev", "confidence", "stake_u", "high_prob_low_payout",
            "is_value", "reasons", "risks", "triggers", "missing_data", "as_of_utc", "notes"
        ],
        "properties": {
            "result": {"type": "string", "enum": ["BET", "LEAN", "NO_BET"]},
            "market": {"type": "string"},
            "emoji": {"type": "string"},
            "selection": {"type": "string"},
            "line": nullable_number,
            "odds_format": {"type": "string", "enum": ["decimal", "american", "none"]},
            "odds": nullable_number,
            "p_est": nullable_number,
            "p_implied": nullable_number,
            "ev": nullable_number,
            "confidence": {"type": "number"},
            "stake_u": {"type": "number"},
            "high_prob_low_payout": {"type": "boolean"},
            "is_value": {"type": "boolean"},
            "reasons": string_list,
            "risks": string_list,
            "triggers": string_list,
            "missing_data": string_list,
            "as_of_utc": {"type": "string"},
            "notes": {"type": "string"}
        }
    })
}

/// The game description sent to the pick generator.
#[derive(Debug, Clone, Serialize)]
pub struct PickRequest {
    pub sport: String,
    pub league: League,
    pub home_team: String,
    pub away_team: String,
    pub start_time_utc: DateTime<Utc>,
    /// No odds source is wired in yet, so this is always `None`
    pub odds: Option<Value>,
    pub allow_totals: bool,
    pub as_of_utc: DateTime<Utc>,
    pub sources: Vec<String>,
}

impl PickRequest {
    pub fn for_game(game: &Game, allow_totals: bool, now: DateTime<Utc>) -> Self {
        PickRequest {
            sport: game.sport.clone(),
            league: game.league,
            home_team: game.home_team.clone(),
            away_team: game.away_team.clone(),
            start_time_utc: game.start_time,
            odds: None,
            allow_totals,
            as_of_utc: now,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedPick {
    pub pick: Value,
    pub model: String,
    pub response_id: Option<String>,
}

impl GeneratedPick {
    /// Payload persisted on the job.
    pub fn to_result_json(&self) -> String {
        json!({
            "pick": self.pick,
            "model": self.model,
            "response_id": self.response_id,
        })
        .to_string()
    }
}

/// Anything that can turn a game description into a pick.
#[async_trait]
pub trait PickGenerator: Send + Sync {
    async fn generate(&self, api_key: &str, request: &PickRequest) -> Result<GeneratedPick, PickError>;

    fn name(&self) -> &str;
}

/// Pick generator backed by the OpenAI Responses API.
#[derive(Clone)]
pub struct OpenAiPicks {
    http: Client,
    endpoint: String,
    model: String,
    reasoning_effort: String,
}

impl OpenAiPicks {
    pub fn new(base_url: &str, model: &str, reasoning_effort: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(OpenAiPicks {
            http,
            endpoint: format!("{}/v1/responses", base_url.trim_end_matches('/')),
            model: model.to_string(),
            reasoning_effort: reasoning_effort.to_string(),
        })
    }

    fn request_body(&self, request: &PickRequest) -> Result<Value, PickError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| PickError::Permanent(format!("cannot encode pick request: {}", e)))?;
        Ok(json!({
            "model": self.model,
            "reasoning": {"effort": self.reasoning_effort},
            "input": [
                {
                    "role": "developer",
                    "content": [{"type": "input_text", "text": DEVELOPER_PROMPT}]
                },
                {
                    "role": "user",
                    "content": [{"type": "input_text", "text": payload}]
                }
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": SCHEMA_NAME,
                    "schema": pick_schema()
                }
            }
        }))
    }
}

#[async_trait]
impl PickGenerator for OpenAiPicks {
    fn name(&self) -> &str {
        "OpenAI"
    }

    async fn generate(&self, api_key: &str, request: &PickRequest) -> Result<GeneratedPick, PickError> {
        let body = self.request_body(request)?;
        debug!("Requesting pick from {} (model={})", self.endpoint, self.model);

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PickError::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(300).collect();
            return Err(classify_status(status, &snippet));
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| PickError::Transient(format!("response body unreadable: {}", e)))?;
        let text = extract_output_text(&raw)
            .ok_or_else(|| PickError::Transient("response has no output_text".to_string()))?;
        let pick: Value = serde_json::from_str(text)
            .map_err(|e| PickError::Transient(format!("model output is not JSON: {}", e)))?;

        Ok(GeneratedPick {
            pick,
            model: raw["model"].as_str().unwrap_or(&self.model).to_string(),
            response_id: raw["id"].as_str().map(str::to_string),
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> PickError {
    let message = format!("API error {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PickError::Transient(message)
    } else {
        // 401/403 and every other 4xx
        PickError::Permanent(message)
    }
}

/// `output_text` when present, else the first `output_text` content part.
pub fn extract_output_text(raw: &Value) -> Option<&str> {
    if let Some(text) = raw["output_text"].as_str().filter(|t| !t.is_empty()) {
        return Some(text);
    }
    raw["output"]
        .as_array()?
        .iter()
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .find(|part| part["type"] == "output_text")
        .and_then(|part| part["text"].as_str())
        .filter(|t| !t.is_empty())
}

/// Without odds a pick cannot carry value: force NO_BET and flag the gap.
pub fn coerce_no_odds(pick: &mut Value) {
    let Some(obj) = pick.as_object_mut() else {
        return;
    };
    let missing = obj.entry("missing_data").or_insert_with(|| json!([]));
    if !missing.is_array() {
        *missing = json!([]);
    }
    if let Some(list) = missing.as_array_mut() {
        if !list.iter().any(|v| v == "odds") {
            list.push(json!("odds"));
        }
    }
    obj.insert("result".to_string(), json!("NO_BET"));
    obj.insert("stake_u".to_string(), json!(0));
    obj.insert("is_value".to_string(), json!(false));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::GameStatus;
    use chrono::TimeZone;

    #[test]
    fn test_extract_output_text() {
        assert_eq!(extract_output_text(&json!({"output_text": "{\"a\":1}"})), Some("{\"a\":1}"));

        let nested = json!({
            "output_text": "",
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "refusal", "text": "no"},
                    {"type": "output_text", "text": "{\"result\":\"LEAN\"}"}
                ]}
            ]
        });
        assert_eq!(extract_output_text(&nested), Some("{\"result\":\"LEAN\"}"));
        assert_eq!(extract_output_text(&json!({"output": []})), None);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn test_coerce_no_odds() {
        let mut pick = json!({"result": "BET", "stake_u": 1, "is_value": true, "missing_data": ["injuries"]});
        coerce_no_odds(&mut pick);
        assert_eq!(pick["result"], "NO_BET");
        assert_eq!(pick["stake_u"], 0);
        assert_eq!(pick["is_value"], false);
        assert_eq!(pick["missing_data"], json!(["injuries", "odds"]));

        coerce_no_odds(&mut pick);
        assert_eq!(pick["missing_data"], json!(["injuries", "odds"]));
    }

    #[test]
    fn test_request_body_shape() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 22, 0, 0).unwrap();
        let game = Game {
            id: 1,
            league: League::Nba,
            external_id: "401".to_string(),
            sport: "basketball".to_string(),
            home_team: "Boston Celtics".to_string(),
            away_team: "Miami Heat".to_string(),
            home_abbrev: None,
            away_abbrev: None,
            home_score: None,
            away_score: None,
            start_time: now,
            status: GameStatus::Scheduled,
            created_at: now,
            last_synced_at: now,
        };
        let client = OpenAiPicks::new("https://example.test/", "gpt-5", "high", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint, "https://example.test/v1/responses");

        let body = client.request_body(&PickRequest::for_game(&game, false, now)).unwrap();
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["reasoning"]["effort"], "high");
        assert_eq!(body["text"]["format"]["type"], "json_schema");

        let user_text = body["input"][1]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(user_text).unwrap();
        assert_eq!(payload["league"], "NBA");
        assert_eq!(payload["home_team"], "Boston Celtics");
        assert_eq!(payload["odds"], Value::Null);
        assert_eq!(payload["allow_totals"], false);
        assert_eq!(payload["sources"], json!([]));
    }
}
