pub mod http;
pub mod provider;
pub mod websocket;

pub use http::AggregatorClient;
pub use provider::{OddsProvider, ResultsProvider, ScheduleProvider, StatProvider};
pub use websocket::{ResultsPushProvider, ResultsPushConfig};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::models::{FinalResult, Game, GameStatus, Stat};

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn score(v: &Value) -> Option<i32> {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|s| i32::try_from(s).ok())
}

/// Parse one game object as sent by the aggregator or the results feed.
///
/// Scores may sit in a nested `final_result` or at the top level; both are
/// accepted. Box-score lines are `{"player_stats": {"p1": {"points": 31}}}`.
pub fn parse_game(v: &Value) -> Option<Game> {
    let id = id_string(&v["id"]).or_else(|| id_string(&v["game_id"]))?;
    let scheduled_at = v["scheduled_at"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);
    let home_team_id = id_string(&v["home_team_id"])?;
    let away_team_id = id_string(&v["away_team_id"])?;
    let status = GameStatus::from_str(v["status"].as_str().unwrap_or("scheduled"));

    let result_obj = if v["final_result"].is_object() { &v["final_result"] } else { v };
    let final_result = match (score(&result_obj["home_score"]), score(&result_obj["away_score"])) {
        (Some(home_score), Some(away_score)) => {
            let mut player_stats = BTreeMap::new();
            if let Some(players) = result_obj["player_stats"].as_object() {
                for (player_id, line) in players {
                    let Some(line) = line.as_object() else { continue };
                    let stats: BTreeMap<Stat, f64> = line
                        .iter()
                        .filter_map(|(name, value)| Some((Stat::parse(name)?, value.as_f64()?)))
                        .collect();
                    player_stats.insert(player_id.clone(), stats);
                }
            }
            Some(FinalResult {
                home_score,
                away_score,
                player_stats,
            })
        }
        _ => None,
    };

    Some(Game {
        id,
        scheduled_at,
        home_team_id,
        away_team_id,
        status,
        final_result,
    })
}

/// Games in `batch` with an official result that were not forwarded
/// before. Marks them as seen.
pub fn newly_final(seen: &mut HashMap<String, tokio::time::Instant>, batch: Vec<Game>) -> Vec<Game> {
    let now = tokio::time::Instant::now();
    let mut fresh = Vec::new();
    for game in batch {
        if game.official_result().is_none() || seen.contains_key(&game.id) {
            continue;
        }
        seen.insert(game.id.clone(), now);
        fresh.push(game);
    }
    fresh
}

/// Spawns a background task that polls every results provider
/// **concurrently** at the configured interval and forwards each game the
/// first time it is seen final.
pub fn start_results_monitor(
    providers: Vec<Arc<dyn ResultsProvider>>,
    poll_interval: Duration,
) -> mpsc::Receiver<Game> {
    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let provider_names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        info!(
            "Results monitor started ({} providers: {:?}, interval={:?})",
            providers.len(),
            provider_names,
            poll_interval
        );

        let mut seen: HashMap<String, tokio::time::Instant> = HashMap::new();
        let provider_timeout = poll_interval.min(Duration::from_secs(10));
        let forget_after = Duration::from_secs(72 * 60 * 60);
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let fetch_futures: Vec<_> = providers
                .iter()
                .map(|p| {
                    let p = Arc::clone(p);
                    async move {
                        let out = match tokio::time::timeout(provider_timeout, p.final_results()).await {
                            Ok(result) => result,
                            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", provider_timeout)),
                        };
                        (p.name().to_string(), out)
                    }
                })
                .collect();

            for (provider_name, result) in futures_util::future::join_all(fetch_futures).await {
                let games = match result {
                    Ok(games) => games,
                    Err(e) => {
                        warn!("Results provider '{}' failed: {}", provider_name, e);
                        continue;
                    }
                };
                for game in newly_final(&mut seen, games) {
                    info!("Final result from {}: game {}", provider_name, game.id);
                    if tx.send(game).await.is_err() {
                        info!("Results channel closed; monitor stopping");
                        return;
                    }
                }
            }

            seen.retain(|_, at| at.elapsed() < forget_after);
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    fn final_game(id: &str) -> Game {
        parse_game(&json!({
            "id": id, "scheduled_at": "2026-01-05T19:00:00Z",
            "home_team_id": "BOS", "away_team_id": "NYK", "status": "final",
            "final_result": {"home_score": 110, "away_score": 104,
                             "player_stats": {"p1": {"points": 31, "rebounds": 9, "steals": 2}}}
        }))
        .unwrap()
    }

    #[test]
    fn parses_nested_box_score() {
        let g = final_game("g1");
        let r = g.official_result().unwrap();
        assert_eq!(r.total(), 214);
        assert_eq!(r.player_stat("p1", Stat::Points), Some(31.0));
        assert_eq!(r.player_stats["p1"].len(), 2);
    }

    #[test]
    fn numeric_ids_and_string_scores() {
        let g = parse_game(&json!({
            "game_id": 401, "scheduled_at": "2026-01-05T19:00:00Z",
            "home_team_id": 1, "away_team_id": 2, "status": "FT",
            "home_score": "99", "away_score": "100"
        }))
        .unwrap();
        assert_eq!(g.id, "401");
        assert_eq!(g.official_result().unwrap().margin(), -1);
    }

    #[test]
    fn newly_final_forwards_each_game_once() {
        let mut seen = HashMap::new();
        let mut scheduled = final_game("g2");
        scheduled.status = GameStatus::Scheduled;
        let first = newly_final(&mut seen, vec![final_game("g1"), scheduled.clone()]);
        assert_eq!(first.len(), 1);
        let second = newly_final(&mut seen, vec![final_game("g1"), final_game("g2")]);
        assert_eq!(second.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(), vec!["g2"]);
    }

    struct Fixed(Vec<Game>);

    #[async_trait]
    impl ResultsProvider for Fixed {
        async fn final_results(&self) -> Result<Vec<Game>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct Broken;

    #[async_trait]
    impl ResultsProvider for Broken {
        async fn final_results(&self) -> Result<Vec<Game>> {
            anyhow::bail!("offline")
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn monitor_survives_failing_provider() {
        let providers: Vec<Arc<dyn ResultsProvider>> =
            vec![Arc::new(Broken), Arc::new(Fixed(vec![final_game("g1")]))];
        let mut rx = start_results_monitor(providers, Duration::from_millis(20));
        let game = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(game.id, "g1");
        // Not forwarded a second time
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
