use async_trait::async_trait;
use chrono::NaiveDate;

use crate::db::models::{League, ScoreboardGame};
use crate::error::GatewayError;

/// Trait that every scoreboard source must implement.
#[async_trait]
pub trait ScoreboardGateway: Send + Sync {
    /// Return every game the source lists for `league` on `date`.
    /// Implementations must not retry; that is the caller's policy.
    async fn fetch(&self, league: League, date: NaiveDate) -> Result<Vec<ScoreboardGame>, GatewayError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
