use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Game, OddsLine, StatProfile};

/// Source of team and player statistical profiles.
#[async_trait]
pub trait StatProvider: Send + Sync {
    async fn team_profile(&self, team_id: &str, as_of: DateTime<Utc>) -> Result<StatProfile>;

    async fn player_profile(&self, player_id: &str, as_of: DateTime<Utc>) -> Result<StatProfile>;
}

/// Source of current sportsbook quotes.
#[async_trait]
pub trait OddsProvider: Send + Sync {
    async fn odds_lines(&self, game_id: &str) -> Result<Vec<OddsLine>>;
}

#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    /// Games scheduled to start within `[from, to)`.
    async fn upcoming_games(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Game>>;
}

/// Trait that every final-result feed must implement.
#[async_trait]
pub trait ResultsProvider: Send + Sync {
    /// Snapshot of recently completed games, official results attached.
    async fn final_results(&self) -> Result<Vec<Game>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
