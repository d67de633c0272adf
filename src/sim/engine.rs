//! Monte Carlo game simulator.
//!
//! Trial model (all shocks standard normal):
//!
//! ```text
//!   z_pace                      shared by both teams
//!   shock_team = ρp·z_pace + √(1−ρp²)·z_team
//!   team_pts   = μ_team·pace_adj + σ_team·shock_team   (+ home advantage)
//!   player_x   = μ_x·pace_adj + σ_x·(ρt·shock_team + √(1−ρt²)·z_player)
//! ```
//!
//! `pace_adj = game_pace / team_pace` with `game_pace` the mean of both
//! teams' pace, when both are known. Outcomes are rounded to whole units and
//! floored at zero, then recorded per metric.

use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::distribution::{DataQuality, Histogram, Metric, MetricSummary, SimulationRun};
use super::rng::{ChaChaSource, RngSource, TrialRng};
use crate::db::models::{ProfileSubject, Stat, StatProfile};

/// Fixed block size; block boundaries never depend on the worker count.
const DEFAULT_BLOCK_SIZE: u32 = 500;
/// How often a block re-checks its cancellation flag.
const CANCEL_CHECK_EVERY: u32 = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("simulation diverged for game {game_id}: {detail}")]
    Divergence { game_id: String, detail: String },
    #[error("simulation for game {0} was cancelled")]
    Cancelled(String),
    #[error("trial count must be positive")]
    NoTrials,
    #[error("worker pool unavailable: {0}")]
    Pool(String),
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub trials: u32,
    pub block_size: u32,
    pub workers: usize,
    /// ρp: how strongly the shared pace shock drives both team scores
    pub pace_correlation: f64,
    /// ρt: how strongly a player's line follows his team's shock
    pub teammate_correlation: f64,
    /// Points added to the home mean
    pub home_advantage: f64,
    /// Profiles with fewer games than this are flagged low-confidence
    pub min_sample_size: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trials: 10_000,
            block_size: DEFAULT_BLOCK_SIZE,
            workers: 4,
            pace_correlation: 0.35,
            teammate_correlation: 0.30,
            home_advantage: 0.0,
            min_sample_size: 5,
        }
    }
}

/// Everything the engine needs for one game.
#[derive(Debug, Clone)]
pub struct MatchupInput {
    pub game_id: String,
    pub home: StatProfile,
    pub away: StatProfile,
    pub players: Vec<StatProfile>,
    /// Lines whose threshold masses go into the run summary
    pub thresholds: Vec<(Metric, f64)>,
}

/// Cooperative cancellation flag shared with in-flight runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Home,
    Away,
}

#[derive(Debug, Clone, Copy)]
struct Normal {
    mean: f64,
    sd: f64,
}

#[derive(Debug, Clone)]
struct PlayerLine {
    side: Side,
    dist: Normal,
    slot: usize,
}

/// Pre-resolved parameters for one game; slots 0..4 are the team metrics.
#[derive(Debug, Clone)]
struct TrialModel {
    home: Normal,
    away: Normal,
    players: Vec<PlayerLine>,
    metrics: Vec<Metric>,
    pace_rho: f64,
    pace_rest: f64,
    team_rho: f64,
    team_rest: f64,
}

fn round_count(v: f64) -> i64 {
    v.max(0.0).round() as i64
}

impl TrialModel {
    fn run_trial<R: TrialRng>(&self, rng: &mut R, out: &mut [i64]) {
        let z_pace = rng.standard_normal();
        let shock_home = self.pace_rho * z_pace + self.pace_rest * rng.standard_normal();
        let shock_away = self.pace_rho * z_pace + self.pace_rest * rng.standard_normal();
        let home = round_count(self.home.mean + self.home.sd * shock_home);
        let away = round_count(self.away.mean + self.away.sd * shock_away);
        out[0] = home;
        out[1] = away;
        out[2] = home - away;
        out[3] = home + away;
        for p in &self.players {
            let team_shock = match p.side {
                Side::Home => shock_home,
                Side::Away => shock_away,
            };
            let z = self.team_rho * team_shock + self.team_rest * rng.standard_normal();
            out[p.slot] = round_count(p.dist.mean + p.dist.sd * z);
        }
    }
}

/// Builds a [`TrialModel`], collecting low-confidence reasons on the way.
struct ModelBuilder<'a> {
    game_id: &'a str,
    config: &'a SimulationConfig,
    reasons: Vec<String>,
}

impl<'a> ModelBuilder<'a> {
    fn diverged(&self, detail: String) -> SimulationError {
        SimulationError::Divergence {
            game_id: self.game_id.to_string(),
            detail,
        }
    }

    fn check_sample(&mut self, label: &str, profile: &StatProfile) {
        if profile.sample_size == 0 {
            self.reasons.push(format!("{label}: empty sample"));
        } else if profile.sample_size < self.config.min_sample_size {
            self.reasons.push(format!(
                "{label}: sample size {} below {}",
                profile.sample_size, self.config.min_sample_size
            ));
        }
    }

    /// Mean and standard deviation of `stat`, or a flagged zero when missing.
    fn normal(&mut self, label: &str, profile: &StatProfile, stat: Stat) -> Result<Normal, SimulationError> {
        let Some(m) = profile.moments(stat) else {
            self.reasons.push(format!("{label}: no {} profile", stat.as_str()));
            return Ok(Normal { mean: 0.0, sd: 0.0 });
        };
        if !m.mean.is_finite() || !m.variance.is_finite() {
            return Err(self.diverged(format!("{label}: non-finite {} moments", stat.as_str())));
        }
        if m.variance <= 0.0 {
            self.reasons.push(format!("{label}: zero variance for {}", stat.as_str()));
            return Ok(Normal { mean: m.mean, sd: 0.0 });
        }
        Ok(Normal {
            mean: m.mean,
            sd: m.variance.sqrt(),
        })
    }

    fn pace_factors(&self, home: &StatProfile, away: &StatProfile) -> Result<(f64, f64), SimulationError> {
        let (Some(h), Some(a)) = (home.moments(Stat::Pace), away.moments(Stat::Pace)) else {
            return Ok((1.0, 1.0));
        };
        if !h.mean.is_finite() || !a.mean.is_finite() {
            return Err(self.diverged("non-finite pace".into()));
        }
        if h.mean <= 0.0 || a.mean <= 0.0 {
            return Ok((1.0, 1.0));
        }
        let game_pace = (h.mean + a.mean) / 2.0;
        Ok((game_pace / h.mean, game_pace / a.mean))
    }

    fn build(mut self, input: &MatchupInput) -> Result<(TrialModel, DataQuality), SimulationError> {
        self.check_sample("home", &input.home);
        self.check_sample("away", &input.away);
        let (home_pace, away_pace) = self.pace_factors(&input.home, &input.away)?;

        let mut home = self.normal("home", &input.home, Stat::Points)?;
        let mut away = self.normal("away", &input.away, Stat::Points)?;
        home.mean = home.mean * home_pace + self.config.home_advantage;
        away.mean *= away_pace;

        let mut metrics = vec![Metric::HomePoints, Metric::AwayPoints, Metric::Margin, Metric::Total];
        let mut seen = BTreeSet::new();
        let mut players = Vec::new();
        for profile in &input.players {
            let ProfileSubject::Player { player_id, team_id } = &profile.subject else {
                self.reasons.push("team profile supplied as a player".into());
                continue;
            };
            let (side, pace) = if team_id == input.home.team_id() {
                (Side::Home, home_pace)
            } else if team_id == input.away.team_id() {
                (Side::Away, away_pace)
            } else {
                self.reasons.push(format!("player {player_id}: team {team_id} not in this game"));
                continue;
            };
            if !seen.insert(player_id.clone()) {
                continue;
            }
            let label = format!("player {player_id}");
            self.check_sample(&label, profile);
            let mut lines = 0;
            for stat in Stat::PLAYER_LINES {
                if profile.moments(stat).is_none() {
                    continue;
                }
                let mut dist = self.normal(&label, profile, stat)?;
                dist.mean *= pace;
                players.push(PlayerLine {
                    side,
                    dist,
                    slot: metrics.len(),
                });
                metrics.push(Metric::Player {
                    player_id: player_id.clone(),
                    stat,
                });
                lines += 1;
            }
            if lines == 0 {
                self.reasons.push(format!("{label}: no stat lines"));
            }
        }

        for n in [home, away] {
            if !n.mean.is_finite() {
                return Err(self.diverged("non-finite adjusted mean".into()));
            }
        }

        let pace_rho = self.config.pace_correlation.clamp(0.0, 1.0);
        let team_rho = self.config.teammate_correlation.clamp(0.0, 1.0);
        let model = TrialModel {
            home,
            away,
            players,
            metrics,
            pace_rho,
            pace_rest: (1.0 - pace_rho * pace_rho).sqrt(),
            team_rho,
            team_rest: (1.0 - team_rho * team_rho).sqrt(),
        };
        Ok((model, DataQuality::from_reasons(self.reasons)))
    }
}

pub struct SimulationEngine {
    config: SimulationConfig,
    pool: rayon::ThreadPool,
}

impl SimulationEngine {
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("sim-worker-{i}"))
            .build()
            .map_err(|e| SimulationError::Pool(e.to_string()))?;
        Ok(SimulationEngine { config, pool })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run the configured number of trials with a ChaCha source.
    pub fn simulate(
        &self,
        input: &MatchupInput,
        seed: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<SimulationRun, SimulationError> {
        let source = ChaChaSource::new(seed);
        self.simulate_with(input, self.config.trials, &source, cancel)
    }

    pub fn simulate_with<S: RngSource>(
        &self,
        input: &MatchupInput,
        trials: u32,
        source: &S,
        cancel: &CancelToken,
    ) -> Result<SimulationRun, SimulationError> {
        if trials == 0 {
            return Err(SimulationError::NoTrials);
        }
        let builder = ModelBuilder {
            game_id: &input.game_id,
            config: &self.config,
            reasons: Vec::new(),
        };
        let (model, quality) = builder.build(input)?;
        let width = model.metrics.len();
        let block = self.config.block_size.max(1);
        let n_blocks = trials.div_ceil(block);
        let game_id = input.game_id.as_str();

        let merged = self.pool.install(|| {
            (0..n_blocks)
                .into_par_iter()
                .map(|b| {
                    let start = b * block;
                    let len = block.min(trials - start);
                    let mut rng = source.block_rng(b as u64);
                    let mut counts = vec![Histogram::default(); width];
                    let mut out = vec![0i64; width];
                    for i in 0..len {
                        if i % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                            return Err(SimulationError::Cancelled(game_id.to_string()));
                        }
                        model.run_trial(&mut rng, &mut out);
                        for (h, v) in counts.iter_mut().zip(&out) {
                            h.record(*v);
                        }
                    }
                    Ok(counts)
                })
                .try_reduce(
                    || vec![Histogram::default(); width],
                    |mut acc, part| {
                        for (a, p) in acc.iter_mut().zip(&part) {
                            a.merge(p);
                        }
                        Ok(acc)
                    },
                )
        })?;

        // A flag raised after the last block still discards the run.
        if cancel.is_cancelled() {
            return Err(SimulationError::Cancelled(input.game_id.clone()));
        }

        let mut lines: BTreeMap<&Metric, Vec<f64>> = BTreeMap::new();
        for (metric, line) in &input.thresholds {
            lines.entry(metric).or_default().push(*line);
        }

        let mut distributions = BTreeMap::new();
        let mut summaries = Vec::with_capacity(width);
        for (metric, hist) in model.metrics.iter().zip(merged) {
            let mean = hist.mean();
            let median = hist.median();
            let stddev = hist.stddev();
            if !(mean.is_finite() && median.is_finite() && stddev.is_finite()) {
                return Err(SimulationError::Divergence {
                    game_id: input.game_id.clone(),
                    detail: format!("non-finite summary for {metric:?}"),
                });
            }
            let mut requested = lines.get(metric).cloned().unwrap_or_default();
            requested.sort_by(f64::total_cmp);
            requested.dedup();
            let thresholds = requested.into_iter().map(|l| hist.mass(l)).collect();
            summaries.push(MetricSummary {
                metric: metric.clone(),
                mean,
                median,
                stddev,
                thresholds,
            });
            distributions.insert(metric.clone(), hist);
        }

        debug!(
            "Simulated {} trials for game {} ({} metrics, quality={:?})",
            trials, input.game_id, width, quality
        );

        Ok(SimulationRun {
            game_id: input.game_id.clone(),
            trials,
            seed: Some(source.seed()),
            quality,
            distributions,
            summaries,
            completed_at: Utc::now(),
        })
    }
}

/// Standard error of a probability estimated from `trials` samples.
pub fn standard_error(p: f64, trials: u32) -> f64 {
    if trials == 0 {
        return f64::INFINITY;
    }
    let p = p.clamp(0.0, 1.0);
    (p * (1.0 - p) / trials as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::betting::odds::MarketSpec;
    use crate::db::models::{Selection, StatMoments};
    use approx::assert_relative_eq;

    fn team(id: &str, points: (f64, f64), pace: Option<f64>, n: u32) -> StatProfile {
        let mut stats = BTreeMap::new();
        stats.insert(Stat::Points, StatMoments { mean: points.0, variance: points.1 });
        if let Some(p) = pace {
            stats.insert(Stat::Pace, StatMoments { mean: p, variance: 4.0 });
        }
        StatProfile {
            subject: ProfileSubject::Team { team_id: id.into() },
            stats,
            sample_size: n,
            as_of: Utc::now(),
        }
    }

    fn player(id: &str, team_id: &str, points: (f64, f64)) -> StatProfile {
        let mut stats = BTreeMap::new();
        stats.insert(Stat::Points, StatMoments { mean: points.0, variance: points.1 });
        StatProfile {
            subject: ProfileSubject::Player { player_id: id.into(), team_id: team_id.into() },
            stats,
            sample_size: 30,
            as_of: Utc::now(),
        }
    }

    fn engine(workers: usize, pace_correlation: f64) -> SimulationEngine {
        SimulationEngine::new(SimulationConfig {
            workers,
            pace_correlation,
            ..Default::default()
        })
        .unwrap()
    }

    fn matchup(home: StatProfile, away: StatProfile) -> MatchupInput {
        MatchupInput {
            game_id: "g1".into(),
            home,
            away,
            players: vec![],
            thresholds: vec![(Metric::Margin, 3.5), (Metric::Total, 216.0), (Metric::Total, 216.5)],
        }
    }

    #[test]
    fn spread_cover_matches_normal_margin() {
        // margin ~ N(4, 10): variances 50 + 50, no shared pace shock
        let input = matchup(team("H", (110.0, 50.0), None, 40), team("A", (106.0, 50.0), None, 40));
        let run = engine(4, 0.0).simulate(&input, Some(7), &CancelToken::new()).unwrap();
        let p = run
            .selection_probability(&MarketSpec::Spread { line: -3.5 }, Selection::Home)
            .unwrap();
        // Φ(0.05)
        assert!((p.win - 0.519_938_8).abs() < 0.02, "P(cover) = {}", p.win);
        assert!(run.quality.is_good());
    }

    #[test]
    fn same_seed_is_bit_identical_across_worker_counts() {
        let input = MatchupInput {
            players: vec![player("p1", "H", (25.0, 36.0)), player("p2", "A", (18.0, 25.0))],
            ..matchup(team("H", (112.0, 120.0), Some(100.0), 40), team("A", (108.0, 110.0), Some(98.0), 40))
        };
        let a = engine(1, 0.35).simulate(&input, Some(99), &CancelToken::new()).unwrap();
        let b = engine(4, 0.35).simulate(&input, Some(99), &CancelToken::new()).unwrap();
        assert_eq!(a.summaries, b.summaries);
        assert_eq!(a.distributions, b.distributions);
        assert_eq!(a.seed, Some(99));
    }

    #[test]
    fn unseeded_runs_agree_within_standard_error() {
        let input = matchup(team("H", (110.0, 100.0), None, 40), team("A", (108.0, 100.0), None, 40));
        let eng = engine(2, 0.35);
        let a = eng.simulate(&input, None, &CancelToken::new()).unwrap();
        let b = eng.simulate(&input, None, &CancelToken::new()).unwrap();
        let pa = a.selection_probability(&MarketSpec::Moneyline, Selection::Home).unwrap().win;
        let pb = b.selection_probability(&MarketSpec::Moneyline, Selection::Home).unwrap().win;
        let se = standard_error(pa, a.trials);
        assert!((pa - pb).abs() < 6.0 * se, "{pa} vs {pb}");
        assert!(a.seed.is_some());
    }

    #[test]
    fn unseeded_run_replays_from_its_recorded_seed() {
        let input = matchup(team("H", (110.0, 100.0), None, 40), team("A", (108.0, 100.0), None, 40));
        let eng = engine(2, 0.35);
        let first = eng.simulate(&input, None, &CancelToken::new()).unwrap();
        let replayed = eng.simulate(&input, first.seed, &CancelToken::new()).unwrap();
        assert_eq!(first.summaries, replayed.summaries);
        assert_eq!(first.distributions, replayed.distributions);
    }

    #[test]
    fn threshold_masses_sum_to_one() {
        let input = matchup(team("H", (110.0, 90.0), None, 40), team("A", (106.0, 90.0), None, 40));
        let run = engine(2, 0.35).simulate(&input, Some(3), &CancelToken::new()).unwrap();
        let mut checked = 0;
        for s in &run.summaries {
            for t in &s.thresholds {
                assert_relative_eq!(t.over + t.under + t.push, 1.0, epsilon = 1e-12);
                checked += 1;
            }
        }
        assert_eq!(checked, 3);
        let total = run.summaries.iter().find(|s| s.metric == Metric::Total).unwrap();
        assert!(total.thresholds[0].push > 0.0, "integer line should carry push mass");
        assert_eq!(total.thresholds[1].push, 0.0);
    }

    #[test]
    fn shared_pace_widens_total_distribution() {
        let input = matchup(team("H", (110.0, 100.0), None, 40), team("A", (110.0, 100.0), None, 40));
        let loose = engine(2, 0.0).simulate(&input, Some(11), &CancelToken::new()).unwrap();
        let tight = engine(2, 0.8).simulate(&input, Some(11), &CancelToken::new()).unwrap();
        let sd = |run: &SimulationRun| run.distribution(&Metric::Total).unwrap().stddev();
        // var(total) = 200 + 2ρ²·100
        assert!(sd(&tight) > sd(&loose) + 2.0, "{} vs {}", sd(&tight), sd(&loose));
    }

    #[test]
    fn pace_adjustment_rescales_means() {
        let input = matchup(team("H", (105.0, 0.0), Some(105.0), 40), team("A", (95.0, 0.0), Some(95.0), 40));
        let run = engine(1, 0.35).simulate(&input, Some(1), &CancelToken::new()).unwrap();
        assert_relative_eq!(run.distribution(&Metric::HomePoints).unwrap().median(), 100.0);
        assert_relative_eq!(run.distribution(&Metric::AwayPoints).unwrap().median(), 100.0);
    }

    #[test]
    fn zero_variance_is_flagged_not_fatal() {
        let input = matchup(team("H", (100.0, 0.0), None, 40), team("A", (98.0, 25.0), None, 40));
        let run = engine(1, 0.35).simulate(&input, Some(5), &CancelToken::new()).unwrap();
        assert!(!run.quality.is_good());
        assert_relative_eq!(run.distribution(&Metric::HomePoints).unwrap().stddev(), 0.0);
    }

    #[test]
    fn empty_profile_is_flagged_not_fatal() {
        let away = StatProfile::empty(ProfileSubject::Team { team_id: "A".into() }, Utc::now());
        let input = matchup(team("H", (100.0, 80.0), None, 40), away);
        let run = engine(1, 0.35).simulate(&input, Some(5), &CancelToken::new()).unwrap();
        match &run.quality {
            DataQuality::LowConfidence { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("empty sample")));
            }
            DataQuality::Good => panic!("expected low confidence"),
        }
    }

    #[test]
    fn non_finite_input_diverges() {
        let input = matchup(team("H", (f64::NAN, 80.0), None, 40), team("A", (100.0, 80.0), None, 40));
        let err = engine(1, 0.35).simulate(&input, Some(5), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SimulationError::Divergence { .. }));
    }

    #[test]
    fn cancelled_run_is_never_published() {
        let input = matchup(team("H", (110.0, 80.0), None, 40), team("A", (100.0, 80.0), None, 40));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine(2, 0.35).simulate(&input, Some(5), &cancel).unwrap_err();
        assert_eq!(err, SimulationError::Cancelled("g1".into()));
    }

    #[test]
    fn player_lines_are_simulated_per_side() {
        let input = MatchupInput {
            players: vec![player("p1", "H", (25.0, 36.0)), player("ghost", "X", (10.0, 4.0))],
            ..matchup(team("H", (110.0, 90.0), None, 40), team("A", (106.0, 90.0), None, 40))
        };
        let run = engine(2, 0.35).simulate(&input, Some(8), &CancelToken::new()).unwrap();
        let metric = Metric::Player { player_id: "p1".into(), stat: Stat::Points };
        let mean = run.distribution(&metric).unwrap().mean();
        assert!((mean - 25.0).abs() < 0.5, "mean {mean}");
        assert!(run
            .distribution(&Metric::Player { player_id: "ghost".into(), stat: Stat::Points })
            .is_none());
        assert!(!run.quality.is_good());
    }

    #[test]
    fn doubling_trials_shrinks_standard_error() {
        for p in [0.1, 0.5, 0.73] {
            assert!(standard_error(p, 20_000) < standard_error(p, 10_000));
        }
    }

    #[test]
    fn zero_trials_rejected() {
        let input = matchup(team("H", (110.0, 80.0), None, 40), team("A", (100.0, 80.0), None, 40));
        let eng = engine(1, 0.35);
        let err = eng
            .simulate_with(&input, 0, &ChaChaSource::new(Some(1)), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err, SimulationError::NoTrials);
    }
}
