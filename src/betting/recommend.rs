//! Sized, ranked and budget-capped stake recommendations.
//!
//! Everything here is a pure function of its inputs. The batch time and the
//! stake already committed today are passed in by the caller.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::evaluator::EvaluatedMarket;
use super::kelly::{capped_fraction, expected_value_per_unit};

#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Fractional Kelly multiplier (0, 1]
    pub kelly_multiplier: f64,
    /// Hard cap on stake as a fraction of bankroll
    pub max_stake_fraction: Decimal,
    pub min_stake: Decimal,
    pub max_stake: Decimal,
    /// Maximum total stake recommended per UTC day
    pub daily_risk_cap: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.25,
            max_stake_fraction: Decimal::new(5, 2),
            min_stake: Decimal::new(5, 0),
            max_stake: Decimal::new(250, 0),
            daily_risk_cap: Decimal::new(500, 0),
        }
    }
}

/// Caller-supplied state for one batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub bankroll: Decimal,
    /// Stake already placed since the start of the current day
    pub committed_today: Decimal,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub market: EvaluatedMarket,
    pub stake: Decimal,
    /// Bankroll fraction after the multiplier and cap
    pub kelly_fraction: f64,
    pub expected_value: f64,
    /// 1-based position in the batch
    pub rank: u32,
    pub created_at: DateTime<Utc>,
}

/// Stake for a single market, rounded down to cents.
///
/// Returns `None` when there is no positive Kelly fraction or when the
/// bounds leave no room for a stake of at least `min_stake`.
pub fn size_stake(
    win_prob: f64,
    payout_multiplier: Decimal,
    bankroll: Decimal,
    cfg: &SizingConfig,
) -> Option<(Decimal, f64)> {
    if bankroll <= Decimal::ZERO {
        return None;
    }
    let max_fraction = cfg.max_stake_fraction.to_f64()?;
    let d = payout_multiplier.to_f64()?;
    let f = capped_fraction(win_prob, d, cfg.kelly_multiplier, max_fraction);
    if f <= 0.0 {
        return None;
    }

    let upper = cfg
        .max_stake
        .min(cfg.max_stake_fraction * bankroll)
        .min(bankroll)
        .round_dp_with_strategy(2, RoundingStrategy::ToZero);
    if upper < cfg.min_stake {
        return None;
    }
    // Eight places absorbs float noise such as 0.6 - 0.4 = 0.19999...
    let amount = Decimal::from_f64(f)?.round_dp(8) * bankroll;
    let stake = amount
        .clamp(cfg.min_stake, upper)
        .round_dp_with_strategy(2, RoundingStrategy::ToZero);
    if stake <= Decimal::ZERO {
        return None;
    }
    Some((stake, f))
}

fn tie_key(m: &EvaluatedMarket) -> (String, String) {
    (m.game_id.clone(), m.wager.to_string())
}

fn rank_order(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.market
        .confidence
        .total_cmp(&a.market.confidence)
        .then_with(|| b.market.edge.total_cmp(&a.market.edge))
        .then_with(|| b.expected_value.total_cmp(&a.expected_value))
        .then_with(|| tie_key(&a.market).cmp(&tie_key(&b.market)))
}

/// Turn viable markets into an ordered batch.
///
/// Stakes are accumulated in rank order; the first recommendation that would
/// push the day's total past the risk cap ends the batch.
pub fn recommend(markets: &[EvaluatedMarket], ctx: &BatchContext, cfg: &SizingConfig) -> Vec<Recommendation> {
    let mut candidates: Vec<Recommendation> = markets
        .iter()
        .filter(|m| m.viable)
        .filter_map(|m| {
            let (stake, fraction) = size_stake(m.model_probability, m.wager.payout_multiplier(), ctx.bankroll, cfg)?;
            let ev = stake.to_f64()? * expected_value_per_unit(m.model_probability, m.wager.price.decimal_odds());
            Some(Recommendation {
                market: m.clone(),
                stake,
                kelly_fraction: fraction,
                expected_value: ev,
                rank: 0,
                created_at: ctx.now,
            })
        })
        .collect();
    candidates.sort_by(rank_order);

    let mut remaining = (cfg.daily_risk_cap - ctx.committed_today).max(Decimal::ZERO);
    let mut batch = Vec::with_capacity(candidates.len());
    for mut rec in candidates {
        if rec.stake > remaining {
            break;
        }
        remaining -= rec.stake;
        rec.rank = batch.len() as u32 + 1;
        batch.push(rec);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::betting::odds::{parse_line, Price};
    use crate::db::models::{MarketKind, OddsLine, Selection};
    use rust_decimal_macros::dec;

    fn market(game: &str, price: &str, p: f64, edge: f64, confidence: f64) -> EvaluatedMarket {
        let line = OddsLine {
            game_id: game.into(),
            market: MarketKind::Moneyline,
            selection: Selection::Home,
            participant: None,
            stat: None,
            price: price.into(),
            line: None,
            timestamp: Utc::now(),
        };
        let wager = parse_line(&line).unwrap();
        EvaluatedMarket {
            game_id: game.into(),
            implied_probability: wager.price.implied_probability(),
            fair_probability: wager.price.implied_probability(),
            line,
            wager,
            model_probability: p,
            push_probability: 0.0,
            edge,
            standard_error: 0.005,
            confidence,
            viable: true,
            rejection: None,
        }
    }

    fn ctx(bankroll: Decimal) -> BatchContext {
        BatchContext {
            bankroll,
            committed_today: Decimal::ZERO,
            now: Utc::now(),
        }
    }

    #[test]
    fn stake_respects_every_bound() {
        let cfg = SizingConfig::default();
        for bankroll in [dec!(50), dec!(1000), dec!(100000)] {
            for p in [0.52, 0.6, 0.8, 0.95] {
                if let Some((stake, _)) = size_stake(p, dec!(2.10), bankroll, &cfg) {
                    assert!(stake >= cfg.min_stake, "{stake}");
                    assert!(stake <= cfg.max_stake);
                    assert!(stake <= cfg.max_stake_fraction * bankroll);
                    assert!(stake <= bankroll);
                    assert_eq!(stake, stake.round_dp(2));
                }
            }
        }
    }

    #[test]
    fn stake_follows_fractional_kelly() {
        // p = 0.6 at evens: f* = 0.2, quarter Kelly = 0.05 → 50 of 1000
        let cfg = SizingConfig {
            max_stake_fraction: dec!(0.10),
            ..Default::default()
        };
        let (stake, f) = size_stake(0.6, dec!(2.0), dec!(1000), &cfg).unwrap();
        assert_eq!(stake, dec!(50.00));
        assert!((f - 0.05).abs() < 1e-12);
    }

    #[test]
    fn stake_is_raised_to_minimum() {
        // Kelly suggests 2.50 of 1000, the floor is 5
        let (stake, _) = size_stake(0.505, dec!(2.0), dec!(1000), &SizingConfig::default()).unwrap();
        assert_eq!(stake, dec!(5));
    }

    #[test]
    fn no_stake_without_edge_or_room() {
        let cfg = SizingConfig::default();
        assert!(size_stake(0.45, dec!(2.0), dec!(1000), &cfg).is_none());
        // 5% of 40 is 2, below the 5 minimum
        assert!(size_stake(0.7, dec!(2.0), dec!(40), &cfg).is_none());
        assert!(size_stake(0.7, dec!(2.0), Decimal::ZERO, &cfg).is_none());
    }

    #[test]
    fn ranking_is_confidence_then_edge_then_ev() {
        let markets = vec![
            market("g1", "+100", 0.60, 0.10, 0.70),
            market("g2", "+100", 0.60, 0.10, 0.90),
            market("g3", "+100", 0.65, 0.15, 0.70),
            market("g4", "+120", 0.60, 0.10, 0.70),
        ];
        let cfg = SizingConfig {
            daily_risk_cap: dec!(10000),
            ..Default::default()
        };
        let batch = recommend(&markets, &ctx(dec!(1000)), &cfg);
        let order: Vec<&str> = batch.iter().map(|r| r.market.game_id.as_str()).collect();
        // g4 and g1 tie on confidence and edge; g4 pays more so its EV is higher
        assert_eq!(order, vec!["g2", "g3", "g4", "g1"]);
        let ranks: Vec<u32> = batch.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn daily_cap_truncates_lower_ranked() {
        let markets = vec![
            market("g1", "+100", 0.60, 0.10, 0.90),
            market("g2", "+100", 0.60, 0.10, 0.80),
            market("g3", "+100", 0.60, 0.10, 0.70),
        ];
        let cfg = SizingConfig {
            max_stake_fraction: dec!(0.10),
            daily_risk_cap: dec!(120),
            ..Default::default()
        };
        // Each stake is 50; 20 already committed leaves room for two
        let mut context = ctx(dec!(1000));
        context.committed_today = dec!(20);
        let batch = recommend(&markets, &context, &cfg);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.stake == dec!(50.00)));
        let total: Decimal = batch.iter().map(|r| r.stake).sum();
        assert!(total + context.committed_today <= cfg.daily_risk_cap);
    }

    #[test]
    fn non_viable_markets_are_excluded() {
        let mut m = market("g1", "+100", 0.60, 0.10, 0.90);
        m.viable = false;
        assert!(recommend(&[m], &ctx(dec!(1000)), &SizingConfig::default()).is_empty());
    }

    #[test]
    fn identical_inputs_give_identical_batches() {
        let markets = vec![
            market("g2", "-120", 0.62, 0.08, 0.80),
            market("g1", "+150", 0.45, 0.05, 0.80),
        ];
        let context = ctx(dec!(2500));
        let a = recommend(&markets, &context, &SizingConfig::default());
        let b = recommend(&markets, &context, &SizingConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn expected_value_uses_decimal_odds() {
        let cfg = SizingConfig {
            max_stake_fraction: dec!(0.10),
            ..Default::default()
        };
        let batch = recommend(&[market("g1", "+100", 0.6, 0.1, 0.9)], &ctx(dec!(1000)), &cfg);
        // 50 × (0.6 × 2 − 1)
        assert!((batch[0].expected_value - 10.0).abs() < 1e-9);
        assert_eq!(batch[0].market.wager.price, Price::American(100));
    }
}
