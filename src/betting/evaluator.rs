//! Market evaluation: simulated probability vs market-implied probability.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::odds::{is_complement, no_vig, parse_line, OddsError, Wager};
use crate::db::models::OddsLine;
use crate::sim::engine::standard_error;
use crate::sim::{DataQuality, SimulationRun};

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Minimum edge (model − fair implied) for a market to be viable
    pub min_edge: f64,
    /// Minimum confidence score in [0, 1]
    pub min_confidence: f64,
    /// Trial count at which the sample-size factor reaches one half
    pub confidence_half_trials: f64,
    /// Standard error at which confidence falls to zero
    pub max_standard_error: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.03,
            min_confidence: 0.5,
            confidence_half_trials: 1_000.0,
            max_standard_error: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonViableReason {
    LowConfidenceInput,
    EdgeBelowMinimum,
    ConfidenceBelowMinimum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedMarket {
    pub game_id: String,
    pub line: OddsLine,
    pub wager: Wager,
    /// P(selection wins) from the simulation; push mass excluded
    pub model_probability: f64,
    pub push_probability: f64,
    /// Raw implied probability of the quoted price
    pub implied_probability: f64,
    /// Implied probability after margin removal (raw when no complement)
    pub fair_probability: f64,
    pub edge: f64,
    pub standard_error: f64,
    pub confidence: f64,
    pub viable: bool,
    pub rejection: Option<NonViableReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedLine {
    pub line: OddsLine,
    pub error: OddsError,
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub game_id: String,
    pub markets: Vec<EvaluatedMarket>,
    pub skipped: Vec<SkippedLine>,
}

impl Evaluation {
    pub fn viable(&self) -> impl Iterator<Item = &EvaluatedMarket> {
        self.markets.iter().filter(|m| m.viable)
    }
}

/// `q × N/(N + n_half) × max(0, 1 − se/se_max)`.
pub fn confidence(se: f64, trials: u32, quality: &DataQuality, cfg: &EvaluatorConfig) -> f64 {
    if !quality.is_good() || trials == 0 || !se.is_finite() {
        return 0.0;
    }
    let n = trials as f64;
    let size_factor = n / (n + cfg.confidence_half_trials.max(0.0));
    let precision = if cfg.max_standard_error > 0.0 {
        (1.0 - se / cfg.max_standard_error).max(0.0)
    } else {
        0.0
    };
    (size_factor * precision).clamp(0.0, 1.0)
}

/// Evaluate every line of one game against its finished run. Lines that do
/// not parse or cannot be read off the simulation are skipped individually.
pub fn evaluate(run: &SimulationRun, lines: &[OddsLine], cfg: &EvaluatorConfig) -> Evaluation {
    let mut skipped = Vec::new();
    let mut parsed: Vec<(&OddsLine, Wager)> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.game_id != run.game_id {
            skipped.push(SkippedLine {
                line: line.clone(),
                error: OddsError::InvalidOddsLine(format!(
                    "line for game {} evaluated against game {}",
                    line.game_id, run.game_id
                )),
            });
            continue;
        }
        match parse_line(line) {
            Ok(w) => parsed.push((line, w)),
            Err(error) => skipped.push(SkippedLine {
                line: line.clone(),
                error,
            }),
        }
    }

    let mut markets = Vec::with_capacity(parsed.len());
    for (line, wager) in &parsed {
        let side = match run.selection_probability(&wager.market, wager.selection) {
            Ok(p) => p,
            Err(error) => {
                skipped.push(SkippedLine {
                    line: (*line).clone(),
                    error,
                });
                continue;
            }
        };

        let implied = wager.price.implied_probability();
        // Latest quote for the other side, if any.
        let complement = parsed
            .iter()
            .filter(|(_, other)| is_complement(wager, other))
            .max_by_key(|(l, _)| l.timestamp)
            .map(|(_, other)| other.price.implied_probability());
        let fair = match complement {
            Some(other) => no_vig(implied, other),
            None => implied,
        };

        let model = side.win;
        let edge = model - fair;
        let se = standard_error(model, run.trials);
        let conf = confidence(se, run.trials, &run.quality, cfg);
        let rejection = if !run.quality.is_good() {
            Some(NonViableReason::LowConfidenceInput)
        } else if edge < cfg.min_edge {
            Some(NonViableReason::EdgeBelowMinimum)
        } else if conf < cfg.min_confidence {
            Some(NonViableReason::ConfidenceBelowMinimum)
        } else {
            None
        };

        markets.push(EvaluatedMarket {
            game_id: run.game_id.clone(),
            line: (*line).clone(),
            wager: wager.clone(),
            model_probability: model,
            push_probability: side.push,
            implied_probability: implied,
            fair_probability: fair,
            edge,
            standard_error: se,
            confidence: conf,
            viable: rejection.is_none(),
            rejection,
        });
    }

    debug!(
        "Evaluated {} market(s) for game {} ({} viable, {} skipped)",
        markets.len(),
        run.game_id,
        markets.iter().filter(|m| m.viable).count(),
        skipped.len()
    );

    Evaluation {
        game_id: run.game_id.clone(),
        markets,
        skipped,
    }
}
