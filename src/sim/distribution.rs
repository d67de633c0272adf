//! Empirical distributions built from accumulated trials.
//!
//! Every simulated metric is integral (points, rebounds, margin...), so a
//! distribution is an exact histogram of counts. Merging partitions is a
//! plain sum of counts, and every derived statistic is computed from the
//! merged histogram in key order, which keeps results bit-identical no
//! matter how trials were split across workers.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::betting::odds::{MarketSpec, OddsError};
use crate::db::models::{Selection, Stat};

const MASS_TOLERANCE: f64 = 1e-9;

/// A simulated outcome dimension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    HomePoints,
    AwayPoints,
    /// Home minus away
    Margin,
    Total,
    Player { player_id: String, stat: Stat },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    counts: BTreeMap<i64, u64>,
    total: u64,
}

/// Share of trials strictly above, strictly below, and exactly on a line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMass {
    pub line: f64,
    pub over: f64,
    pub under: f64,
    pub push: f64,
}

impl Histogram {
    pub fn record(&mut self, value: i64) {
        *self.counts.entry(value).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (v, c) in &other.counts {
            *self.counts.entry(*v).or_insert(0) += c;
        }
        self.total += other.total;
    }

    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            return f64::NAN;
        }
        let sum: f64 = self.counts.iter().map(|(v, c)| *v as f64 * *c as f64).sum();
        sum / self.total as f64
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        if self.total == 0 {
            return f64::NAN;
        }
        let mean = self.mean();
        let ss: f64 = self
            .counts
            .iter()
            .map(|(v, c)| (*v as f64 - mean).powi(2) * *c as f64)
            .sum();
        (ss / self.total as f64).sqrt()
    }

    /// Median; the mean of the two middle values for an even count.
    pub fn median(&self) -> f64 {
        if self.total == 0 {
            return f64::NAN;
        }
        let lo_rank = (self.total - 1) / 2; // 0-based ranks
        let hi_rank = self.total / 2;
        let mut lo = None;
        let mut seen = 0u64;
        for (v, c) in &self.counts {
            let next = seen + c;
            if lo.is_none() && lo_rank < next {
                lo = Some(*v);
            }
            if hi_rank < next {
                let lo = lo.unwrap_or(*v);
                return (lo as f64 + *v as f64) / 2.0;
            }
            seen = next;
        }
        f64::NAN
    }

    pub fn mass(&self, line: f64) -> ThresholdMass {
        let mut over = 0u64;
        let mut under = 0u64;
        let mut push = 0u64;
        for (v, c) in &self.counts {
            let v = *v as f64;
            if v > line {
                over += c;
            } else if v < line {
                under += c;
            } else {
                push += c;
            }
        }
        let n = self.total.max(1) as f64;
        ThresholdMass {
            line,
            over: over as f64 / n,
            under: under as f64 / n,
            push: push as f64 / n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: Metric,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    #[serde(default)]
    pub thresholds: Vec<ThresholdMass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum DataQuality {
    Good,
    LowConfidence { reasons: Vec<String> },
}

impl DataQuality {
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            DataQuality::Good
        } else {
            DataQuality::LowConfidence { reasons }
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, DataQuality::Good)
    }
}

/// Probability that a selection wins, pushes, or loses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SideProbability {
    pub win: f64,
    pub push: f64,
    pub lose: f64,
}

/// A finished simulation for one game. Only ever constructed from a fully
/// merged set of trial counts.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRun {
    pub game_id: String,
    pub trials: u32,
    pub seed: Option<u64>,
    pub quality: DataQuality,
    pub distributions: BTreeMap<Metric, Histogram>,
    pub summaries: Vec<MetricSummary>,
    pub completed_at: DateTime<Utc>,
}

impl SimulationRun {
    pub fn distribution(&self, metric: &Metric) -> Option<&Histogram> {
        self.distributions.get(metric)
    }

    fn required(&self, metric: &Metric) -> Result<&Histogram, OddsError> {
        self.distribution(metric).ok_or_else(|| {
            OddsError::InvalidOddsLine(format!("no simulated distribution for {metric:?}"))
        })
    }

    /// Read the probability of one selection off the simulated distribution.
    pub fn selection_probability(
        &self,
        market: &MarketSpec,
        selection: Selection,
    ) -> Result<SideProbability, OddsError> {
        let (hist, line) = match market {
            MarketSpec::Moneyline => (self.required(&Metric::Margin)?, 0.0),
            // Home covers when margin + line > 0, away when line - margin > 0.
            MarketSpec::Spread { line } => match selection {
                Selection::Home => (self.required(&Metric::Margin)?, -line),
                _ => (self.required(&Metric::Margin)?, *line),
            },
            MarketSpec::Total { line } => (self.required(&Metric::Total)?, *line),
            MarketSpec::PlayerProp { player_id, stat, line } => (
                self.required(&Metric::Player {
                    player_id: player_id.clone(),
                    stat: *stat,
                })?,
                *line,
            ),
        };
        let m = hist.mass(line);
        Ok(match selection {
            Selection::Home | Selection::Over => SideProbability {
                win: m.over,
                push: m.push,
                lose: m.under,
            },
            Selection::Away | Selection::Under => SideProbability {
                win: m.under,
                push: m.push,
                lose: m.over,
            },
        })
    }

    pub fn summary(&self) -> SimulationSummary {
        SimulationSummary {
            game_id: self.game_id.clone(),
            trials: self.trials,
            seed: self.seed,
            quality: self.quality.clone(),
            metrics: self.summaries.clone(),
            completed_at: self.completed_at,
        }
    }
}

/// Persisted, query-facing form of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub game_id: String,
    pub trials: u32,
    pub seed: Option<u64>,
    pub quality: DataQuality,
    pub metrics: Vec<MetricSummary>,
    pub completed_at: DateTime<Utc>,
}

impl SimulationSummary {
    /// Checked whenever a summary crosses the storage boundary.
    pub fn validate(&self) -> Result<()> {
        if self.trials == 0 {
            bail!("summary for {} has no trials", self.game_id);
        }
        if self.metrics.is_empty() {
            bail!("summary for {} has no metrics", self.game_id);
        }
        for m in &self.metrics {
            if !(m.mean.is_finite() && m.median.is_finite() && m.stddev.is_finite()) {
                bail!("non-finite statistic for {:?}", m.metric);
            }
            if m.stddev < 0.0 {
                bail!("negative stddev for {:?}", m.metric);
            }
            for t in &m.thresholds {
                for p in [t.over, t.under, t.push] {
                    if !(0.0..=1.0).contains(&p) {
                        bail!("probability {} outside [0,1] for {:?}", p, m.metric);
                    }
                }
                if (t.over + t.under + t.push - 1.0).abs() > MASS_TOLERANCE {
                    bail!("threshold masses for {:?} at {} do not sum to 1", m.metric, t.line);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn hist(values: &[i64]) -> Histogram {
        let mut h = Histogram::default();
        for v in values {
            h.record(*v);
        }
        h
    }

    #[test]
    fn moments_are_exact() {
        let h = hist(&[1, 2, 3, 4]);
        assert_relative_eq!(h.mean(), 2.5);
        assert_relative_eq!(h.median(), 2.5);
        assert_relative_eq!(h.stddev(), 1.25f64.sqrt());
        assert_relative_eq!(hist(&[5, 1, 3]).median(), 3.0);
    }

    #[test]
    fn mass_splits_ties_into_push() {
        let h = hist(&[2, 3, 3, 4]);
        let m = h.mass(3.0);
        assert_relative_eq!(m.over, 0.25);
        assert_relative_eq!(m.under, 0.25);
        assert_relative_eq!(m.push, 0.5);
        let half = h.mass(3.5);
        assert_relative_eq!(half.push, 0.0);
        assert_relative_eq!(half.over + half.under, 1.0);
    }

    #[test]
    fn merge_equals_single_pass() {
        let mut a = hist(&[1, 5, 5]);
        a.merge(&hist(&[2, 5, 9]));
        assert_eq!(a, hist(&[1, 2, 5, 5, 5, 9]));
    }

    #[test]
    fn empty_histogram_statistics_are_nan() {
        let h = Histogram::default();
        assert!(h.mean().is_nan());
        assert!(h.median().is_nan());
    }

    #[test]
    fn validate_rejects_inconsistent_masses() {
        let mut summary = SimulationSummary {
            game_id: "g".into(),
            trials: 10,
            seed: None,
            quality: DataQuality::Good,
            metrics: vec![MetricSummary {
                metric: Metric::Total,
                mean: 200.0,
                median: 200.0,
                stddev: 10.0,
                thresholds: vec![ThresholdMass { line: 200.5, over: 0.5, under: 0.5, push: 0.0 }],
            }],
            completed_at: Utc::now(),
        };
        assert!(summary.validate().is_ok());
        summary.metrics[0].thresholds[0].over = 0.7;
        assert!(summary.validate().is_err());
        summary.metrics[0].thresholds[0].over = 0.5;
        summary.metrics[0].mean = f64::NAN;
        assert!(summary.validate().is_err());
    }

    #[test]
    fn summary_round_trips_through_json_with_tags() {
        let m = MetricSummary {
            metric: Metric::Player { player_id: "p1".into(), stat: Stat::Rebounds },
            mean: 8.0,
            median: 8.0,
            stddev: 2.0,
            thresholds: vec![],
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["metric"]["kind"], "player");
        assert_eq!(json["metric"]["stat"], "rebounds");
        let quality = serde_json::to_value(DataQuality::LowConfidence { reasons: vec!["x".into()] }).unwrap();
        assert_eq!(quality["flag"], "low_confidence");
    }
}
