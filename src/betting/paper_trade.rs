//! Chronological replay of historical games through the full
//! simulate → evaluate → recommend → place → settle loop, against an
//! in-memory ledger.

use anyhow::{Context, Result};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::evaluator::{evaluate, EvaluatorConfig};
use super::pipeline::{build_matchup, game_seed, start_of_day};
use super::recommend::{recommend, BatchContext, SizingConfig};
use crate::db::models::{BetStatus, Game, GameStatus, OddsLine, StatProfile};
use crate::ledger::{EphemeralStore, Ledger, PlaceBet};
use crate::sim::{CancelToken, SimulationEngine};

/// One finished game with the inputs that were available before tip-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalGame {
    pub game: Game,
    pub home: StatProfile,
    pub away: StatProfile,
    #[serde(default)]
    pub players: Vec<StatProfile>,
    pub lines: Vec<OddsLine>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Games(Vec<HistoricalGame>),
    Wrapped { games: Vec<HistoricalGame> },
}

pub fn load_history(path: &str) -> Result<Vec<HistoricalGame>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let file: HistoryFile = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    Ok(match file {
        HistoryFile::Games(g) | HistoryFile::Wrapped { games: g } => g,
    })
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub evaluator: EvaluatorConfig,
    pub sizing: SizingConfig,
    pub seed: Option<u64>,
    pub initial_bankroll: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperTradeReport {
    pub games_replayed: usize,
    pub initial_bankroll: Decimal,
    pub final_bankroll: Decimal,
    pub total_staked: Decimal,
    pub n_bets: u64,
    pub wins: u64,
    pub losses: u64,
    pub pushes: u64,
    pub win_rate: f64,
    pub roi: f64,
}

pub fn replay(
    mut history: Vec<HistoricalGame>,
    simulator: &SimulationEngine,
    settings: &ReplaySettings,
) -> Result<PaperTradeReport> {
    history.sort_by_key(|h| h.game.scheduled_at);
    let start = history.first().map(|h| h.game.scheduled_at).unwrap_or_else(chrono::Utc::now);

    let ledger = Ledger::new(Arc::new(EphemeralStore));
    let wallet_id = ledger.open_wallet("paper", settings.initial_bankroll, start)?.id;
    let cancel = CancelToken::new();

    let mut report = PaperTradeReport {
        games_replayed: 0,
        initial_bankroll: settings.initial_bankroll,
        final_bankroll: settings.initial_bankroll,
        total_staked: Decimal::ZERO,
        n_bets: 0,
        wins: 0,
        losses: 0,
        pushes: 0,
        win_rate: 0.0,
        roi: 0.0,
    };

    for h in history {
        let game_id = h.game.id.clone();
        if h.game.official_result().is_none() {
            info!("Skipping game {} without a final result", game_id);
            continue;
        }
        let tip_off = h.game.scheduled_at;

        // The ledger sees the game as scheduled until its result is replayed.
        let mut scheduled = h.game.clone();
        scheduled.status = GameStatus::Scheduled;
        scheduled.final_result = None;
        ledger.register_game(scheduled.clone())?;

        let input = build_matchup(&scheduled, h.home, h.away, h.players, &h.lines);
        let seed = settings.seed.map(|s| game_seed(s, &game_id));
        let run = match simulator.simulate(&input, seed, &cancel) {
            Ok(run) => run,
            Err(e) => {
                warn!("Replay: {}", e);
                continue;
            }
        };
        report.games_replayed += 1;

        if run.quality.is_good() {
            let evaluation = evaluate(&run, &h.lines, &settings.evaluator);
            let ctx = BatchContext {
                bankroll: ledger.wallet(wallet_id)?.balance,
                committed_today: ledger.committed_since(wallet_id, start_of_day(tip_off))?,
                now: tip_off,
            };
            let markets: Vec<_> = evaluation.viable().cloned().collect();
            for rec in recommend(&markets, &ctx, &settings.sizing) {
                let req = PlaceBet {
                    wallet_id,
                    game_id: game_id.clone(),
                    wager: rec.market.wager.clone(),
                    stake: rec.stake,
                };
                match ledger.place(req, tip_off) {
                    Ok(bet) => report.total_staked += bet.stake,
                    Err(e) => warn!("Replay: bet on game {} rejected: {}", game_id, e),
                }
            }
        } else {
            debug!("Replay: game {} has low-confidence input", game_id);
        }

        let settlement = ledger.settle(&h.game, tip_off)?;
        for bet in &settlement.settled {
            report.n_bets += 1;
            match bet.status {
                BetStatus::Won => report.wins += 1,
                BetStatus::Lost => report.losses += 1,
                BetStatus::Push => report.pushes += 1,
                BetStatus::Pending => {}
            }
        }
    }

    report.final_bankroll = ledger.wallet(wallet_id)?.balance;
    if report.n_bets > 0 {
        report.win_rate = report.wins as f64 / report.n_bets as f64;
    }
    if settings.initial_bankroll > Decimal::ZERO {
        report.roi = ((report.final_bankroll - settings.initial_bankroll) / settings.initial_bankroll)
            .to_f64()
            .unwrap_or(0.0);
    }
    info!(
        "Paper trade: {} games, {} bets, win rate {:.1}%, bankroll {} → {} (ROI {:.2}%)",
        report.games_replayed,
        report.n_bets,
        report.win_rate * 100.0,
        report.initial_bankroll,
        report.final_bankroll,
        report.roi * 100.0
    );
    Ok(report)
}
