//! Periodic forecast cycle: schedule → odds + profiles → simulation →
//! evaluation → one recommendation batch for the house wallet.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::evaluator::{evaluate, EvaluatedMarket, EvaluatorConfig};
use super::odds::{parse_line, MarketSpec};
use super::recommend::{recommend, BatchContext, Recommendation, SizingConfig};
use crate::db::models::{Game, MarketKind, OddsLine, ProfileSubject, Selection, StatProfile};
use crate::db::Database;
use crate::feeds::{OddsProvider, ScheduleProvider, StatProvider};
use crate::ledger::{Ledger, SettlementReport};
use crate::sim::{CancelToken, MatchupInput, Metric, SimulationEngine, SimulationRun, SimulationSummary};

/// Upstream data sources for a cycle.
#[derive(Clone)]
pub struct ForecastProviders {
    pub stats: Arc<dyn StatProvider>,
    pub odds: Arc<dyn OddsProvider>,
    pub schedule: Arc<dyn ScheduleProvider>,
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    pub evaluator: EvaluatorConfig,
    pub sizing: SizingConfig,
    /// Base seed; each game derives its own from it
    pub seed: Option<u64>,
    pub lookahead: ChronoDuration,
    /// Budget for all simulations of one cycle
    pub simulation_timeout: Duration,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub games: usize,
    pub simulated: usize,
    pub failed: usize,
    pub low_confidence: usize,
    pub recommendations: Vec<Recommendation>,
}

/// In-memory view of the latest finished run per game, shared with the API.
#[derive(Clone, Default)]
pub struct PublishedRuns(Arc<RwLock<HashMap<String, SimulationSummary>>>);

impl PublishedRuns {
    pub fn get(&self, game_id: &str) -> Option<SimulationSummary> {
        self.0.read().ok()?.get(game_id).cloned()
    }

    pub(crate) fn publish(&self, summary: SimulationSummary) {
        if let Ok(mut runs) = self.0.write() {
            runs.insert(summary.game_id.clone(), summary);
        }
    }
}

struct PreparedGame {
    input: MatchupInput,
    lines: Vec<OddsLine>,
}

pub struct ForecastEngine {
    providers: ForecastProviders,
    simulator: Arc<SimulationEngine>,
    db: Database,
    ledger: Arc<Ledger>,
    house_wallet: Uuid,
    settings: ForecastSettings,
    published: PublishedRuns,
    /// Cancels the simulations of the cycle in flight
    running: Mutex<Option<CancelToken>>,
    /// Final results whose settlement failed, kept for the next retry pass
    unsettled: Mutex<HashMap<String, Game>>,
}

impl ForecastEngine {
    pub fn new(
        providers: ForecastProviders,
        simulator: Arc<SimulationEngine>,
        db: Database,
        ledger: Arc<Ledger>,
        house_wallet: Uuid,
        settings: ForecastSettings,
    ) -> Self {
        info!(
            "Forecast engine ready (trials={}, min_edge={:.3}, min_confidence={:.2}, kelly={:.2})",
            simulator.config().trials,
            settings.evaluator.min_edge,
            settings.evaluator.min_confidence,
            settings.sizing.kelly_multiplier
        );
        ForecastEngine {
            providers,
            simulator,
            db,
            ledger,
            house_wallet,
            settings,
            published: PublishedRuns::default(),
            running: Mutex::new(None),
            unsettled: Mutex::new(HashMap::new()),
        }
    }

    pub fn published(&self) -> PublishedRuns {
        self.published.clone()
    }

    /// Stop the simulations of the current cycle, if any.
    pub fn cancel_running(&self) {
        if let Ok(guard) = self.running.lock() {
            if let Some(token) = guard.as_ref() {
                token.cancel();
            }
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let games = self
            .providers
            .schedule
            .upcoming_games(now, now + self.settings.lookahead)
            .await
            .context("fetching schedule")?;

        let mut report = CycleReport::default();
        let mut upcoming = Vec::with_capacity(games.len());
        for game in games {
            if let Err(e) = self.ledger.register_game(game.clone()) {
                warn!("Could not register game {}: {}", game.id, e);
            }
            if game.is_final() {
                continue;
            }
            upcoming.push(game);
        }
        report.games = upcoming.len();
        if upcoming.is_empty() {
            info!("No upcoming games in the next {}h", self.settings.lookahead.num_hours());
            return Ok(report);
        }

        let prepare_futures: Vec<_> = upcoming.iter().map(|g| self.prepare(g, now)).collect();
        let mut prepared = Vec::new();
        for (game, result) in upcoming.iter().zip(futures_util::future::join_all(prepare_futures).await) {
            match result {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    warn!("Skipping game {}: {:#}", game.id, e);
                    report.failed += 1;
                }
            }
        }

        let runs = self.simulate_all(&prepared, &mut report).await;

        let mut markets: Vec<EvaluatedMarket> = Vec::new();
        for (run, lines) in runs {
            let summary = run.summary();
            if let Err(e) = self.db.insert_simulation(&summary) {
                warn!("Failed to store simulation for game {}: {:#}", run.game_id, e);
            }
            self.published.publish(summary);
            if !run.quality.is_good() {
                info!("Game {}: low-confidence input, no recommendations", run.game_id);
                report.low_confidence += 1;
                continue;
            }
            let evaluation = evaluate(&run, &lines, &self.settings.evaluator);
            for skipped in &evaluation.skipped {
                warn!("Game {}: skipped line ({})", run.game_id, skipped.error);
            }
            markets.extend(evaluation.viable().cloned());
        }

        let wallet = self.ledger.wallet(self.house_wallet)?;
        let ctx = BatchContext {
            bankroll: wallet.balance,
            committed_today: self.ledger.committed_since(self.house_wallet, start_of_day(now))?,
            now,
        };
        report.recommendations = recommend(&markets, &ctx, &self.settings.sizing);
        if !report.recommendations.is_empty() {
            self.db
                .insert_recommendations(self.house_wallet, &report.recommendations)
                .context("storing recommendations")?;
        }
        for rec in &report.recommendations {
            info!(
                "#{} game {}: {} stake {} (edge={:.3}, confidence={:.2})",
                rec.rank, rec.market.game_id, rec.market.wager, rec.stake, rec.market.edge, rec.market.confidence
            );
        }
        info!(
            "Cycle done: {} games, {} simulated, {} failed, {} low-confidence, {} recommendations",
            report.games,
            report.simulated,
            report.failed,
            report.low_confidence,
            report.recommendations.len()
        );
        Ok(report)
    }

    /// Settle every pending bet on a game that just went final. A delivery
    /// that fails, fully or for some wallets, is held for [`Self::retry_settlements`].
    pub fn on_final_result(&self, game: &Game) -> Result<SettlementReport> {
        let result = self.ledger.settle(game, Utc::now());
        let failed = result.as_ref().map_or(true, |r| !r.failures.is_empty());
        if let Ok(mut unsettled) = self.unsettled.lock() {
            if failed {
                unsettled.insert(game.id.clone(), game.clone());
            } else {
                unsettled.remove(&game.id);
            }
        }
        let report = result?;
        if report.deferred {
            debug!("Game {} has no official result yet; settlement deferred", game.id);
        } else if !report.failures.is_empty() {
            warn!(
                "Game {}: {} wallet(s) left pending after storage failures",
                game.id,
                report.failures.len()
            );
        }
        Ok(report)
    }

    /// Settle again every final game that still has pending bets: failed
    /// deliveries held in memory plus finals the ledger already knows.
    /// Returns the number of bets settled.
    pub fn retry_settlements(&self) -> usize {
        let mut games: HashMap<String, Game> = match self.unsettled.lock() {
            Ok(held) => held.clone(),
            Err(_) => HashMap::new(),
        };
        match self.ledger.final_games_with_pending_bets() {
            Ok(finals) => {
                for game in finals {
                    games.entry(game.id.clone()).or_insert(game);
                }
            }
            Err(e) => warn!("Could not list pending finals: {}", e),
        }

        let mut settled = 0;
        for game in games.values() {
            match self.on_final_result(game) {
                Ok(report) => settled += report.settled.len(),
                Err(e) => warn!("Retried settlement of game {} failed: {:#}", game.id, e),
            }
        }
        if settled > 0 {
            info!("Settlement retry: {} bet(s) settled across {} game(s)", settled, games.len());
        }
        settled
    }

    async fn prepare(&self, game: &Game, as_of: DateTime<Utc>) -> Result<PreparedGame> {
        let lines = self
            .providers
            .odds
            .odds_lines(&game.id)
            .await
            .context("fetching odds")?;
        if lines.is_empty() {
            anyhow::bail!("no odds lines");
        }
        let player_ids = prop_participants(&lines);

        let stats = &self.providers.stats;
        let (home, away) = tokio::try_join!(
            stats.team_profile(&game.home_team_id, as_of),
            stats.team_profile(&game.away_team_id, as_of),
        )
        .context("fetching team profiles")?;

        let player_futures: Vec<_> = player_ids.iter().map(|id| stats.player_profile(id, as_of)).collect();
        let mut players = Vec::with_capacity(player_ids.len());
        for (id, result) in player_ids.iter().zip(futures_util::future::join_all(player_futures).await) {
            match result {
                Ok(p) => players.push(p),
                // Props on this player are skipped by the evaluator
                Err(e) => warn!("No profile for player {} (game {}): {:#}", id, game.id, e),
            }
        }

        Ok(PreparedGame {
            input: build_matchup(game, home, away, players, &lines),
            lines,
        })
    }

    async fn simulate_all(
        &self,
        prepared: &[PreparedGame],
        report: &mut CycleReport,
    ) -> Vec<(SimulationRun, Vec<OddsLine>)> {
        let cancel = CancelToken::new();
        if let Ok(mut running) = self.running.lock() {
            *running = Some(cancel.clone());
        }
        let deadline = tokio::time::Instant::now() + self.settings.simulation_timeout;

        let handles: Vec<_> = prepared
            .iter()
            .map(|p| {
                let simulator = Arc::clone(&self.simulator);
                let input = p.input.clone();
                let seed = self.settings.seed.map(|s| game_seed(s, &input.game_id));
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || simulator.simulate(&input, seed, &cancel))
            })
            .collect();

        let mut runs = Vec::new();
        for (p, handle) in prepared.iter().zip(handles) {
            let game_id = &p.input.game_id;
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(run))) => {
                    report.simulated += 1;
                    runs.push((run, p.lines.clone()));
                }
                Ok(Ok(Err(e))) => {
                    warn!("Simulation failed: {}", e);
                    report.failed += 1;
                }
                Ok(Err(e)) => {
                    warn!("Simulation task for game {} panicked: {}", game_id, e);
                    report.failed += 1;
                }
                Err(_) => {
                    cancel.cancel();
                    warn!("Simulation for game {} timed out; cancelled", game_id);
                    report.failed += 1;
                }
            }
        }

        if let Ok(mut running) = self.running.lock() {
            *running = None;
        }
        runs
    }
}

pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_else(|| now.naive_utc());
    Utc.from_utc_datetime(&midnight)
}

/// Stable per-game seed so a fixed base seed reproduces every game's run.
pub fn game_seed(base: u64, game_id: &str) -> u64 {
    // FNV-1a
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in game_id.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    base ^ h
}

fn prop_participants(lines: &[OddsLine]) -> BTreeSet<String> {
    lines
        .iter()
        .filter(|l| l.market == MarketKind::PlayerProp)
        .filter_map(|l| l.participant.clone())
        .filter(|p| !p.trim().is_empty())
        .collect()
}

/// Threshold on the simulated metric that decides each quoted line.
pub fn thresholds_for(lines: &[OddsLine]) -> Vec<(Metric, f64)> {
    lines
        .iter()
        .filter_map(|l| {
            let wager = parse_line(l).ok()?;
            Some(match wager.market {
                MarketSpec::Moneyline => (Metric::Margin, 0.0),
                MarketSpec::Spread { line } if wager.selection == Selection::Home => (Metric::Margin, -line),
                MarketSpec::Spread { line } => (Metric::Margin, line),
                MarketSpec::Total { line } => (Metric::Total, line),
                MarketSpec::PlayerProp { player_id, stat, line } => (Metric::Player { player_id, stat }, line),
            })
        })
        .collect()
}

pub fn build_matchup(
    game: &Game,
    home: StatProfile,
    away: StatProfile,
    players: Vec<StatProfile>,
    lines: &[OddsLine],
) -> MatchupInput {
    debug!(
        "Matchup {}: {} vs {} with {} player profile(s)",
        game.id,
        game.home_team_id,
        game.away_team_id,
        players.len()
    );
    let players = players
        .into_iter()
        .filter(|p| matches!(p.subject, ProfileSubject::Player { .. }))
        .collect();
    MatchupInput {
        game_id: game.id.clone(),
        home,
        away,
        players,
        thresholds: thresholds_for(lines),
    }
}
