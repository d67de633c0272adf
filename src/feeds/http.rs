use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::parse_game;
use super::provider::{OddsProvider, ResultsProvider, ScheduleProvider, StatProvider};
use crate::db::models::{
    Game, MarketKind, OddsLine, ProfileSubject, Selection, Stat, StatMoments, StatProfile,
};

/// REST client for the stats/odds aggregator.
///
/// Endpoints (JSON):
/// - `GET /games?from=&to=`           → `{"games": [...]}`
/// - `GET /games/{id}/odds`           → `{"lines": [...]}`
/// - `GET /teams/{id}/profile?as_of=` → profile object
/// - `GET /players/{id}/profile?as_of=`
/// - `GET /results`                   → `{"games": [...]}`
#[derive(Clone)]
pub struct AggregatorClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl AggregatorClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url).with_context(|| format!("invalid aggregator url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("aggregator url '{}' cannot carry a path", base_url);
        }
        Ok(AggregatorClient {
            http,
            base_url,
            api_key,
        })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("aggregator url '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        debug!("GET {}", url);
        let mut req = self.http.get(url.clone()).query(query);
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key);
        }
        let resp = req.send().await.with_context(|| format!("request to {url} failed"))?;
        if !resp.status().is_success() {
            anyhow::bail!("aggregator error {} for {}", resp.status(), url);
        }
        resp.json().await.with_context(|| format!("failed to parse response from {url}"))
    }
}

#[async_trait]
impl StatProvider for AggregatorClient {
    async fn team_profile(&self, team_id: &str, as_of: DateTime<Utc>) -> Result<StatProfile> {
        let raw = self
            .get_json(&["teams", team_id, "profile"], &[("as_of", as_of.to_rfc3339())])
            .await?;
        Ok(parse_profile(&raw, ProfileSubject::Team { team_id: team_id.to_string() }, as_of))
    }

    async fn player_profile(&self, player_id: &str, as_of: DateTime<Utc>) -> Result<StatProfile> {
        let raw = self
            .get_json(&["players", player_id, "profile"], &[("as_of", as_of.to_rfc3339())])
            .await?;
        let team_id = raw["team_id"]
            .as_str()
            .with_context(|| format!("player {player_id} profile has no team_id"))?
            .to_string();
        let subject = ProfileSubject::Player {
            player_id: player_id.to_string(),
            team_id,
        };
        Ok(parse_profile(&raw, subject, as_of))
    }
}

#[async_trait]
impl OddsProvider for AggregatorClient {
    async fn odds_lines(&self, game_id: &str) -> Result<Vec<OddsLine>> {
        let raw = self.get_json(&["games", game_id, "odds"], &[]).await?;
        Ok(parse_odds_response(&raw, game_id))
    }
}

#[async_trait]
impl ScheduleProvider for AggregatorClient {
    async fn upcoming_games(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Game>> {
        let raw = self
            .get_json(&["games"], &[("from", from.to_rfc3339()), ("to", to.to_rfc3339())])
            .await?;
        Ok(parse_games_response(&raw))
    }
}

#[async_trait]
impl ResultsProvider for AggregatorClient {
    fn name(&self) -> &str {
        "aggregator"
    }

    async fn final_results(&self) -> Result<Vec<Game>> {
        let raw = self.get_json(&["results"], &[]).await?;
        Ok(parse_games_response(&raw))
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Each game is parsed on its own; malformed entries are dropped.
pub fn parse_games_response(raw: &Value) -> Vec<Game> {
    let Some(items) = raw["games"].as_array().or_else(|| raw.as_array()) else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|v| {
            let game = parse_game(v);
            if game.is_none() {
                warn!("Skipping malformed game entry: {}", v);
            }
            game
        })
        .collect()
}

/// Stats live under `"stats": {"points": {"mean": .., "variance": ..}}`.
/// Unknown stat names and incomplete moments are ignored.
pub fn parse_profile(raw: &Value, subject: ProfileSubject, fallback_as_of: DateTime<Utc>) -> StatProfile {
    let mut stats = BTreeMap::new();
    if let Some(obj) = raw["stats"].as_object() {
        for (name, m) in obj {
            let Some(stat) = Stat::parse(name) else {
                debug!("Ignoring unknown stat '{}'", name);
                continue;
            };
            let mean = m["mean"].as_f64();
            let variance = m["variance"]
                .as_f64()
                .or_else(|| m["stddev"].as_f64().map(|sd| sd * sd));
            if let (Some(mean), Some(variance)) = (mean, variance) {
                stats.insert(stat, StatMoments { mean, variance });
            }
        }
    }
    let as_of = raw["as_of"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(fallback_as_of);
    StatProfile {
        subject,
        stats,
        sample_size: raw["sample_size"].as_u64().unwrap_or(0).min(u32::MAX as u64) as u32,
        as_of,
    }
}

fn text_or_number(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        // Whole numbers below 100 are decimal odds, not American
        Value::Number(n) if n.is_i64() => {
            let i = n.as_i64()?;
            Some(if i >= 100 { format!("+{i}") } else { i.to_string() })
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lines keep the raw price text; a line that cannot even be shaped into an
/// [`OddsLine`] is dropped here, price validation happens in the evaluator.
pub fn parse_odds_response(raw: &Value, game_id: &str) -> Vec<OddsLine> {
    let Some(items) = raw["lines"].as_array().or_else(|| raw.as_array()) else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|v| {
            let line = parse_odds_line(v, game_id);
            if line.is_none() {
                warn!("Skipping malformed odds entry for game {}: {}", game_id, v);
            }
            line
        })
        .collect()
}

fn parse_odds_line(v: &Value, game_id: &str) -> Option<OddsLine> {
    let market = MarketKind::parse(v["market"].as_str()?)?;
    let selection = Selection::parse(v["selection"].as_str()?)?;
    let price = text_or_number(&v["price"])?;
    let timestamp = v["timestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(OddsLine {
        game_id: v["game_id"].as_str().unwrap_or(game_id).to_string(),
        market,
        selection,
        participant: v["participant"].as_str().map(str::to_string),
        stat: v["stat"].as_str().map(str::to_string),
        price,
        line: v["line"].as_f64(),
        timestamp,
    })
}
