//! WebSocket push feed for final results.
//!
//! ```text
//!  WS Server ──push──▶ ResultsPushProvider (background task)
//!                         │  parses messages → Game
//!                         │  keeps final games in a shared snapshot
//!                         ▼
//!              ResultsProvider::final_results()
//!                  reads the snapshot, no network call
//! ```

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::parse_game;
use super::provider::ResultsProvider;
use crate::db::models::Game;

/// Oldest games beyond this count are evicted from the snapshot.
const SNAPSHOT_LIMIT: usize = 2_000;

pub struct ResultsPushConfig {
    pub name: String,
    /// wss:// endpoint
    pub url: String,
    /// Sent once after every (re)connect
    pub subscribe_message: Option<String>,
    pub ping_interval_secs: u64,
}

pub struct ResultsPushProvider {
    name: String,
    snapshot: Arc<RwLock<HashMap<String, Game>>>,
}

impl ResultsPushProvider {
    /// Create the provider and spawn the background listener.
    pub fn new(config: ResultsPushConfig) -> Self {
        let snapshot = Arc::new(RwLock::new(HashMap::new()));
        let name = config.name.clone();
        let listener_snapshot = Arc::clone(&snapshot);
        tokio::spawn(async move { ws_connection_loop(&config, listener_snapshot).await });
        ResultsPushProvider { name, snapshot }
    }
}

#[async_trait]
impl ResultsProvider for ResultsPushProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn final_results(&self) -> Result<Vec<Game>> {
        Ok(self.snapshot.read().await.values().cloned().collect())
    }
}

async fn store_games(snapshot: &RwLock<HashMap<String, Game>>, games: Vec<Game>) {
    if games.is_empty() {
        return;
    }
    let mut snap = snapshot.write().await;
    for game in games {
        snap.insert(game.id.clone(), game);
    }
    if snap.len() > SNAPSHOT_LIMIT {
        let mut by_age: Vec<_> = snap.values().map(|g| (g.scheduled_at, g.id.clone())).collect();
        by_age.sort();
        let excess = snap.len() - SNAPSHOT_LIMIT;
        for (_, id) in by_age.into_iter().take(excess) {
            snap.remove(&id);
        }
    }
}

/// Whether the current connection should be kept after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Keep,
    Reconnect,
}

async fn on_frame<W>(
    name: &str,
    frame: Option<Result<Message, WsError>>,
    write: &mut W,
    snapshot: &RwLock<HashMap<String, Game>>,
) -> Flow
where
    W: Sink<Message> + Unpin,
{
    match frame {
        Some(Ok(Message::Text(text))) if text.trim().eq_ignore_ascii_case("ping") => {
            let _ = write.send(Message::Text("pong".into())).await;
        }
        Some(Ok(Message::Text(text))) => {
            let games = parse_results_message(&text);
            if !games.is_empty() {
                debug!("[{}] {} final result(s) pushed", name, games.len());
            }
            store_games(snapshot, games).await;
        }
        Some(Ok(Message::Ping(payload))) => {
            let _ = write.send(Message::Pong(payload)).await;
        }
        Some(Ok(Message::Close(frame))) => {
            warn!("[{}] Closed by server: {:?}", name, frame);
            return Flow::Reconnect;
        }
        Some(Ok(_)) => {}
        Some(Err(e)) => {
            error!("[{}] Read error: {}", name, e);
            return Flow::Reconnect;
        }
        None => {
            warn!("[{}] Stream ended", name);
            return Flow::Reconnect;
        }
    }
    Flow::Keep
}

/// Connect, listen until the connection drops, then retry with exponential
/// backoff (1s doubling up to 60s). Never returns.
async fn ws_connection_loop(config: &ResultsPushConfig, snapshot: Arc<RwLock<HashMap<String, Game>>>) {
    const MAX_BACKOFF_SECS: u64 = 60;
    let name = config.name.as_str();
    let mut backoff = 1u64;

    loop {
        info!("[{}] Connecting to {}", name, config.url);
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Err(e) => error!("[{}] Connect failed: {}", name, e),
            Ok((stream, _)) => {
                info!("[{}] Connected", name);
                backoff = 1;
                let (mut write, mut read) = stream.split();
                let subscribed = match &config.subscribe_message {
                    Some(msg) => write.send(Message::Text(msg.clone())).await.map_err(|e| {
                        error!("[{}] Subscribe failed: {}", name, e);
                    }),
                    None => Ok(()),
                };

                if subscribed.is_ok() {
                    let mut keepalive = tokio::time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
                    loop {
                        let flow = tokio::select! {
                            frame = read.next() => on_frame(name, frame, &mut write, &snapshot).await,
                            _ = keepalive.tick() => match write.send(Message::Ping(Vec::new())).await {
                                Ok(()) => Flow::Keep,
                                Err(e) => {
                                    error!("[{}] Keepalive failed: {}", name, e);
                                    Flow::Reconnect
                                }
                            },
                        };
                        if flow == Flow::Reconnect {
                            break;
                        }
                    }
                }
            }
        }

        warn!("[{}] Reconnecting in {}s", name, backoff);
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}

/// Parse a results message into the final games it carries.
///
/// Accepts a bare array, `{"games": [...]}`, `{"type": "final", "game": {...}}`
/// or a single game object. Non-final games are ignored.
pub fn parse_results_message(text: &str) -> Vec<Game> {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        return vec![];
    };
    let items: Vec<&Value> = if let Some(a) = val.as_array() {
        a.iter().collect()
    } else if let Some(a) = val["games"].as_array() {
        a.iter().collect()
    } else if val["game"].is_object() {
        vec![&val["game"]]
    } else if val.get("id").is_some() || val.get("game_id").is_some() {
        vec![&val]
    } else {
        return vec![];
    };
    items
        .into_iter()
        .filter_map(parse_game)
        .filter(|g| g.official_result().is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_final_game() {
        let msg = r#"{"type":"final","game":{"id":"g7","scheduled_at":"2026-01-05T19:00:00Z",
            "home_team_id":"DEN","away_team_id":"PHX","status":"final",
            "home_score":120,"away_score":111}}"#;
        let games = parse_results_message(msg);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, "g7");
    }

    #[test]
    fn ignores_live_games_and_noise() {
        let msg = r#"[{"id":"g1","scheduled_at":"2026-01-05T19:00:00Z","home_team_id":"A",
            "away_team_id":"B","status":"in progress","home_score":50,"away_score":48}]"#;
        assert!(parse_results_message(msg).is_empty());
        assert!(parse_results_message("not json").is_empty());
        assert!(parse_results_message(r#"{"type":"heartbeat"}"#).is_empty());
    }

    #[tokio::test]
    async fn frames_feed_the_snapshot() {
        let snapshot = RwLock::new(HashMap::new());
        let mut sink = futures_util::sink::drain();
        let text = r#"{"games":[{"id":"g1","scheduled_at":"2026-01-05T19:00:00Z","home_team_id":"A",
            "away_team_id":"B","status":"final","home_score":101,"away_score":99}]}"#;
        let flow = on_frame("test", Some(Ok(Message::Text(text.into()))), &mut sink, &snapshot).await;
        assert_eq!(flow, Flow::Keep);
        assert_eq!(
            on_frame("test", Some(Ok(Message::Text("ping".into()))), &mut sink, &snapshot).await,
            Flow::Keep
        );
        assert_eq!(snapshot.read().await.len(), 1);
        assert_eq!(on_frame("test", None, &mut sink, &snapshot).await, Flow::Reconnect);
    }

    #[tokio::test]
    async fn snapshot_is_bounded() {
        let snapshot = RwLock::new(HashMap::new());
        let base = r#"{"scheduled_at":"2026-01-05T19:00:00Z","home_team_id":"A","away_team_id":"B",
            "status":"final","home_score":1,"away_score":0"#;
        let games: Vec<Game> = (0..SNAPSHOT_LIMIT + 5)
            .flat_map(|i| parse_results_message(&format!(r#"{base},"id":"g{i}"}}"#)))
            .collect();
        store_games(&snapshot, games).await;
        assert_eq!(snapshot.read().await.len(), SNAPSHOT_LIMIT);
    }
}
