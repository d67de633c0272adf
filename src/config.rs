use clap::Parser;
use rust_decimal::Decimal;

use crate::betting::{EvaluatorConfig, SizingConfig};
use crate::sim::SimulationConfig;

/// Game simulator, market evaluator and virtual-wallet ledger
#[derive(Parser, Debug, Clone)]
#[command(name = "sports-intel", version, about)]
pub struct Config {
    /// API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "sports-intel.db")]
    pub database_path: String,

    /// Owner name of the wallet recommendations are sized against
    #[arg(long, env = "HOUSE_WALLET", default_value = "house")]
    pub house_wallet: String,

    /// Opening balance of a newly created house wallet
    #[arg(long, env = "INITIAL_BALANCE", default_value = "1000")]
    pub initial_balance: Decimal,

    /// Stats / odds / schedule aggregator base URL
    #[arg(long, env = "AGGREGATOR_URL", default_value = "http://localhost:9000/api")]
    pub aggregator_url: String,

    /// Aggregator API key
    #[arg(long, env = "AGGREGATOR_API_KEY")]
    pub aggregator_api_key: Option<String>,

    /// Results push feed (wss://...); polling only when unset
    #[arg(long, env = "RESULTS_WS_URL")]
    pub results_ws_url: Option<String>,

    // ── Simulation ───────────────────────────────────────────────────────────

    /// Monte Carlo trials per game
    #[arg(long, env = "TRIALS", default_value = "10000")]
    pub trials: u32,

    /// Fixed seed for reproducible runs
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,

    /// Simulation worker threads
    #[arg(long, env = "SIM_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Weight of the shared pace shock on both team scores (0.0–1.0)
    #[arg(long, env = "PACE_CORRELATION", default_value = "0.35", allow_negative_numbers = true)]
    pub pace_correlation: f64,

    /// Weight of the team shock on each player's line (0.0–1.0)
    #[arg(long, env = "TEAMMATE_CORRELATION", default_value = "0.30")]
    pub teammate_correlation: f64,

    /// Points added to the home scoring mean
    #[arg(long, env = "HOME_ADVANTAGE", default_value = "0.0")]
    pub home_advantage: f64,

    /// Profiles with fewer games are flagged low-confidence
    #[arg(long, env = "MIN_SAMPLE_SIZE", default_value = "5")]
    pub min_sample_size: u32,

    /// Per-cycle simulation timeout in seconds
    #[arg(long, env = "SIMULATION_TIMEOUT_SECS", default_value = "120")]
    pub simulation_timeout_secs: u64,

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Minimum edge required for a market to be viable (e.g. 0.03 = 3%)
    #[arg(long, env = "MIN_EDGE", default_value = "0.03")]
    pub min_edge: f64,

    /// Minimum confidence score (0.0–1.0)
    #[arg(long, env = "MIN_CONFIDENCE", default_value = "0.5")]
    pub min_confidence: f64,

    /// Trial count at which the confidence size factor is one half
    #[arg(long, env = "CONFIDENCE_HALF_TRIALS", default_value = "1000")]
    pub confidence_half_trials: f64,

    /// Standard error at which confidence reaches zero
    #[arg(long, env = "MAX_STANDARD_ERROR", default_value = "0.05")]
    pub max_standard_error: f64,

    // ── Sizing ───────────────────────────────────────────────────────────────

    /// Fractional Kelly multiplier (0.0–1.0)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,

    /// Maximum stake as a fraction of bankroll
    #[arg(long, env = "MAX_STAKE_FRACTION", default_value = "0.05")]
    pub max_stake_fraction: Decimal,

    /// Minimum recommended stake
    #[arg(long, env = "MIN_STAKE", default_value = "5")]
    pub min_stake: Decimal,

    /// Maximum recommended stake
    #[arg(long, env = "MAX_STAKE", default_value = "250")]
    pub max_stake: Decimal,

    /// Maximum total stake recommended per UTC day
    #[arg(long, env = "DAILY_RISK_CAP", default_value = "500")]
    pub daily_risk_cap: Decimal,

    // ── Scheduling ───────────────────────────────────────────────────────────

    /// Seconds between forecast cycles
    #[arg(long, env = "PIPELINE_INTERVAL_SECS", default_value = "900")]
    pub pipeline_interval_secs: u64,

    /// Results polling interval in seconds
    #[arg(long, env = "RESULTS_POLL_SECS", default_value = "60")]
    pub results_poll_secs: u64,

    /// Seconds between retries of settlements that failed to persist
    #[arg(long, env = "SETTLEMENT_RETRY_SECS", default_value = "300")]
    pub settlement_retry_secs: u64,

    /// How far ahead to look for upcoming games
    #[arg(long, env = "LOOKAHEAD_HOURS", default_value = "36")]
    pub lookahead_hours: i64,

    /// Replay a JSON file of historical games and exit
    #[arg(long, env = "PAPER_TRADE", value_name = "FILE")]
    pub paper_trade: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trials == 0 {
            anyhow::bail!("trials must be positive");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pace_correlation) {
            anyhow::bail!("pace_correlation must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.teammate_correlation) {
            anyhow::bail!("teammate_correlation must be between 0.0 and 1.0");
        }
        if !self.home_advantage.is_finite() {
            anyhow::bail!("home_advantage must be finite");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("min_confidence must be between 0.0 and 1.0");
        }
        if !(-1.0..=1.0).contains(&self.min_edge) {
            anyhow::bail!("min_edge must be between -1.0 and 1.0");
        }
        if self.confidence_half_trials < 0.0 || self.max_standard_error <= 0.0 {
            anyhow::bail!("confidence_half_trials must be >= 0 and max_standard_error > 0");
        }
        if !(0.0..=1.0).contains(&self.kelly_fraction) || self.kelly_fraction == 0.0 {
            anyhow::bail!("kelly_fraction must be in (0.0, 1.0]");
        }
        if self.max_stake_fraction <= Decimal::ZERO || self.max_stake_fraction > Decimal::ONE {
            anyhow::bail!("max_stake_fraction must be in (0, 1]");
        }
        if self.min_stake <= Decimal::ZERO || self.min_stake > self.max_stake {
            anyhow::bail!("min_stake must be positive and not above max_stake");
        }
        if self.daily_risk_cap < Decimal::ZERO {
            anyhow::bail!("daily_risk_cap must not be negative");
        }
        if self.initial_balance < Decimal::ZERO {
            anyhow::bail!("initial_balance must not be negative");
        }
        if self.pipeline_interval_secs == 0
            || self.results_poll_secs == 0
            || self.settlement_retry_secs == 0
            || self.simulation_timeout_secs == 0
        {
            anyhow::bail!("intervals and timeouts must be positive");
        }
        if self.lookahead_hours <= 0 {
            anyhow::bail!("lookahead_hours must be positive");
        }
        Ok(())
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            trials: self.trials,
            workers: self.workers,
            pace_correlation: self.pace_correlation,
            teammate_correlation: self.teammate_correlation,
            home_advantage: self.home_advantage,
            min_sample_size: self.min_sample_size,
            ..SimulationConfig::default()
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            min_edge: self.min_edge,
            min_confidence: self.min_confidence,
            confidence_half_trials: self.confidence_half_trials,
            max_standard_error: self.max_standard_error,
        }
    }

    pub fn sizing_config(&self) -> SizingConfig {
        SizingConfig {
            kelly_multiplier: self.kelly_fraction,
            max_stake_fraction: self.max_stake_fraction,
            min_stake: self.min_stake,
            max_stake: self.max_stake,
            daily_risk_cap: self.daily_risk_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["sports-intel"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn defaults_are_valid() {
        let c = parse(&[]);
        assert!(c.validate().is_ok());
        assert_eq!(c.trials, 10_000);
        assert_eq!(c.sizing_config().max_stake_fraction, dec!(0.05));
        assert_eq!(c.simulation_config().block_size, SimulationConfig::default().block_size);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--kelly-fraction", "1.5"]).validate().is_err());
        assert!(parse(&["--min-stake", "300", "--max-stake", "250"]).validate().is_err());
        assert!(parse(&["--pace-correlation", "-0.1"]).validate().is_err());
        assert!(parse(&["--trials", "0"]).validate().is_err());
        assert!(parse(&["--settlement-retry-secs", "0"]).validate().is_err());
    }

    #[test]
    fn decimal_flags_parse_exactly() {
        let c = parse(&["--max-stake-fraction", "0.10", "--seed", "42"]);
        assert_eq!(c.max_stake_fraction, dec!(0.10));
        assert_eq!(c.seed, Some(42));
    }
}
