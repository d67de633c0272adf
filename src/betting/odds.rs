//! Prices, market descriptions and the implied-probability formulas.
//!
//! American odds `p` convert to an implied probability as
//!   `100 / (p + 100)` when `p > 0`, and `-p / (-p + 100)` otherwise.
//! Decimal odds `d` convert as `1 / d`.
//!
//! When both sides of a two-way market are quoted, the bookmaker margin is
//! removed proportionally: each side's raw implied probability is divided by
//! the sum of both sides' raw implied probabilities ([`no_vig`]).

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::db::models::{MarketKind, OddsLine, Selection, Stat};

const LINE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OddsError {
    #[error("invalid odds line: {0}")]
    InvalidOddsLine(String),
}

fn invalid(msg: impl Into<String>) -> OddsError {
    OddsError::InvalidOddsLine(msg.into())
}

/// A validated quoted price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum Price {
    /// American odds, |p| ≥ 100
    American(i32),
    /// Decimal odds, d > 1
    Decimal(Decimal),
}

impl Price {
    pub fn american(p: i32) -> Result<Price, OddsError> {
        if p.checked_abs().map_or(true, |a| a < 100) {
            return Err(invalid(format!("american price {p} must satisfy |p| >= 100")));
        }
        Ok(Price::American(p))
    }

    pub fn decimal(d: Decimal) -> Result<Price, OddsError> {
        if d <= Decimal::ONE {
            return Err(invalid(format!("decimal price {d} must exceed 1.0")));
        }
        Ok(Price::Decimal(d))
    }

    /// Re-check the range of a price that bypassed the constructors, e.g.
    /// one deserialized from storage.
    pub fn validate(&self) -> Result<(), OddsError> {
        match *self {
            Price::American(p) => Price::american(p).map(drop),
            Price::Decimal(d) => Price::decimal(d).map(drop),
        }
    }

    /// Parse a quoted price. Signed or integer quotes with |p| ≥ 100 are
    /// American; anything else must be a decimal price above 1.0.
    pub fn parse(raw: &str) -> Result<Price, OddsError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(invalid("empty price"));
        }
        let signed = s.starts_with('+') || s.starts_with('-');
        if let Ok(v) = s.parse::<i32>() {
            if signed || v.abs() >= 100 {
                return Price::american(v);
            }
        } else if signed {
            return Err(invalid(format!("unparseable american price '{s}'")));
        }
        let d = Decimal::from_str(s).map_err(|_| invalid(format!("unparseable price '{s}'")))?;
        Price::decimal(d)
    }

    /// Raw (vigged) implied probability of the quote.
    pub fn implied_probability(&self) -> f64 {
        match *self {
            Price::American(p) if p > 0 => 100.0 / (p as f64 + 100.0),
            Price::American(p) => {
                let p = -(p as f64);
                p / (p + 100.0)
            }
            Price::Decimal(d) => 1.0 / d.to_f64().unwrap_or(f64::INFINITY),
        }
    }

    /// Amount returned per unit staked on a win, stake included
    /// (+110 → 2.10, -150 → 1.666…).
    pub fn payout_multiplier(&self) -> Decimal {
        match *self {
            Price::American(p) if p > 0 => Decimal::ONE + Decimal::from(p) / Decimal::ONE_HUNDRED,
            Price::American(p) => Decimal::ONE + Decimal::ONE_HUNDRED / Decimal::from(-p),
            Price::Decimal(d) => d,
        }
    }

    pub fn decimal_odds(&self) -> f64 {
        self.payout_multiplier().to_f64().unwrap_or(1.0)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::American(p) if *p > 0 => write!(f, "+{p}"),
            Price::American(p) => write!(f, "{p}"),
            Price::Decimal(d) => write!(f, "{d}"),
        }
    }
}

/// A fully typed market, discriminated per market type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketSpec {
    Moneyline,
    /// Line is the selected side's handicap (home −3.5 ↔ away +3.5)
    Spread { line: f64 },
    Total { line: f64 },
    PlayerProp { player_id: String, stat: Stat, line: f64 },
}

impl MarketSpec {
    pub fn kind(&self) -> MarketKind {
        match self {
            MarketSpec::Moneyline => MarketKind::Moneyline,
            MarketSpec::Spread { .. } => MarketKind::Spread,
            MarketSpec::Total { .. } => MarketKind::Total,
            MarketSpec::PlayerProp { .. } => MarketKind::PlayerProp,
        }
    }

    pub fn line(&self) -> Option<f64> {
        match self {
            MarketSpec::Moneyline => None,
            MarketSpec::Spread { line } | MarketSpec::Total { line } => Some(*line),
            MarketSpec::PlayerProp { line, .. } => Some(*line),
        }
    }

    pub fn participant(&self) -> Option<&str> {
        match self {
            MarketSpec::PlayerProp { player_id, .. } => Some(player_id),
            _ => None,
        }
    }
}

/// Market description of a bet: what was backed and at which price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wager {
    pub market: MarketSpec,
    pub selection: Selection,
    pub price: Price,
}

impl Wager {
    /// Reject selection/market combinations that cannot be graded.
    pub fn validate(&self) -> Result<(), OddsError> {
        self.price.validate()?;
        let two_team = matches!(self.selection, Selection::Home | Selection::Away);
        match &self.market {
            MarketSpec::Moneyline | MarketSpec::Spread { .. } if !two_team => {
                return Err(invalid(format!(
                    "{} market cannot take selection {}",
                    self.market.kind().as_str(),
                    self.selection.as_str()
                )));
            }
            MarketSpec::Total { .. } | MarketSpec::PlayerProp { .. } if two_team => {
                return Err(invalid(format!(
                    "{} market cannot take selection {}",
                    self.market.kind().as_str(),
                    self.selection.as_str()
                )));
            }
            _ => {}
        }
        if let Some(line) = self.market.line() {
            if !line.is_finite() {
                return Err(invalid("non-finite line"));
            }
        }
        if let MarketSpec::PlayerProp { player_id, stat, .. } = &self.market {
            if player_id.trim().is_empty() {
                return Err(invalid("player prop without participant"));
            }
            if *stat == Stat::Pace {
                return Err(invalid("pace is not a player prop statistic"));
            }
        }
        Ok(())
    }

    pub fn payout_multiplier(&self) -> Decimal {
        self.price.payout_multiplier()
    }
}

impl fmt::Display for Wager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.market {
            MarketSpec::Moneyline => write!(f, "moneyline {}", self.selection.as_str())?,
            MarketSpec::Spread { line } => write!(f, "spread {} {:+}", self.selection.as_str(), line)?,
            MarketSpec::Total { line } => write!(f, "total {} {}", self.selection.as_str(), line)?,
            MarketSpec::PlayerProp { player_id, stat, line } => write!(
                f,
                "{} {} {} {}",
                player_id,
                stat.as_str(),
                self.selection.as_str(),
                line
            )?,
        }
        write!(f, " @ {}", self.price)
    }
}

/// Parse a raw quote into a typed wager.
pub fn parse_line(line: &OddsLine) -> Result<Wager, OddsError> {
    let price = Price::parse(&line.price)?;
    let require_line = || {
        line.line
            .ok_or_else(|| invalid(format!("{} line without a line value", line.market.as_str())))
    };
    let market = match line.market {
        MarketKind::Moneyline => MarketSpec::Moneyline,
        MarketKind::Spread => MarketSpec::Spread { line: require_line()? },
        MarketKind::Total => MarketSpec::Total { line: require_line()? },
        MarketKind::PlayerProp => {
            let player_id = line
                .participant
                .clone()
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| invalid("player prop without participant"))?;
            let stat_name = line.stat.as_deref().unwrap_or_default();
            let stat = Stat::parse(stat_name)
                .ok_or_else(|| invalid(format!("unknown prop statistic '{stat_name}'")))?;
            MarketSpec::PlayerProp {
                player_id,
                stat,
                line: require_line()?,
            }
        }
    };
    let wager = Wager {
        market,
        selection: line.selection,
        price,
    };
    wager.validate()?;
    Ok(wager)
}

/// Whether `b` is the other side of the same two-way market as `a`.
pub fn is_complement(a: &Wager, b: &Wager) -> bool {
    if b.selection != a.selection.opposite() {
        return false;
    }
    match (&a.market, &b.market) {
        (MarketSpec::Moneyline, MarketSpec::Moneyline) => true,
        (MarketSpec::Spread { line: la }, MarketSpec::Spread { line: lb }) => (la + lb).abs() < LINE_EPS,
        (MarketSpec::Total { line: la }, MarketSpec::Total { line: lb }) => (la - lb).abs() < LINE_EPS,
        (
            MarketSpec::PlayerProp { player_id: pa, stat: sa, line: la },
            MarketSpec::PlayerProp { player_id: pb, stat: sb, line: lb },
        ) => pa == pb && sa == sb && (la - lb).abs() < LINE_EPS,
        _ => false,
    }
}

/// Proportional margin removal across a two-way market.
pub fn no_vig(own_raw: f64, other_raw: f64) -> f64 {
    let sum = own_raw + other_raw;
    if sum <= 0.0 || !sum.is_finite() {
        return own_raw;
    }
    own_raw / sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn raw(market: MarketKind, selection: Selection, price: &str, line: Option<f64>) -> OddsLine {
        OddsLine {
            game_id: "g1".into(),
            market,
            selection,
            participant: None,
            stat: None,
            price: price.into(),
            line,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn parses_american_and_decimal_quotes() {
        assert_eq!(Price::parse("+110").unwrap(), Price::American(110));
        assert_eq!(Price::parse("-150").unwrap(), Price::American(-150));
        assert_eq!(Price::parse("150").unwrap(), Price::American(150));
        assert_eq!(Price::parse("2.10").unwrap(), Price::Decimal(dec!(2.10)));
        assert_eq!(Price::parse(" 3 ").unwrap(), Price::Decimal(dec!(3)));
    }

    #[test]
    fn wager_rejects_out_of_range_prices() {
        let wager = |price| Wager {
            market: MarketSpec::Moneyline,
            selection: Selection::Home,
            price,
        };
        assert!(wager(Price::American(0)).validate().is_err());
        assert!(wager(Price::American(-99)).validate().is_err());
        assert!(wager(Price::Decimal(dec!(1.0))).validate().is_err());
        assert!(wager(Price::Decimal(dec!(0.5))).validate().is_err());
        assert!(wager(Price::American(-100)).validate().is_ok());
        assert!(wager(Price::Decimal(dec!(1.01))).validate().is_ok());
    }

    #[test]
    fn rejects_malformed_quotes() {
        assert!(Price::parse("").is_err());
        assert!(Price::parse("abc").is_err());
        assert!(Price::parse("+50").is_err());
        assert!(Price::parse("-1.5").is_err());
        assert!(Price::parse("0.95").is_err());
    }

    #[test]
    fn american_implied_probability() {
        assert_relative_eq!(Price::American(110).implied_probability(), 100.0 / 210.0, epsilon = 1e-12);
        assert_relative_eq!(Price::American(-150).implied_probability(), 0.6, epsilon = 1e-12);
        assert_relative_eq!(Price::American(100).implied_probability(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(Price::Decimal(dec!(2.5)).implied_probability(), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn payout_multiplier_matches_quote() {
        assert_eq!(Price::American(110).payout_multiplier(), dec!(2.10));
        assert_eq!(Price::American(-200).payout_multiplier(), dec!(1.5));
        assert_eq!(Price::Decimal(dec!(1.91)).payout_multiplier(), dec!(1.91));
    }

    #[test]
    fn no_vig_normalises_two_way_market() {
        let side = Price::American(-110).implied_probability();
        assert_relative_eq!(no_vig(side, side), 0.5, epsilon = 1e-12);
        let a = Price::American(150).implied_probability();
        let b = Price::American(-180).implied_probability();
        assert_relative_eq!(no_vig(a, b) + no_vig(b, a), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn parse_line_requires_line_values() {
        assert!(parse_line(&raw(MarketKind::Spread, Selection::Home, "-110", None)).is_err());
        let w = parse_line(&raw(MarketKind::Spread, Selection::Home, "-110", Some(-3.5))).unwrap();
        assert_eq!(w.market, MarketSpec::Spread { line: -3.5 });
    }

    #[test]
    fn parse_line_rejects_mismatched_selection() {
        assert!(parse_line(&raw(MarketKind::Total, Selection::Home, "-110", Some(220.5))).is_err());
        assert!(parse_line(&raw(MarketKind::Moneyline, Selection::Over, "+120", None)).is_err());
    }

    #[test]
    fn parse_player_prop() {
        let mut line = raw(MarketKind::PlayerProp, Selection::Over, "-115", Some(24.5));
        line.participant = Some("p23".into());
        line.stat = Some("Player Points".into());
        let w = parse_line(&line).unwrap();
        assert_eq!(
            w.market,
            MarketSpec::PlayerProp { player_id: "p23".into(), stat: Stat::Points, line: 24.5 }
        );
        line.stat = Some("steals".into());
        assert!(parse_line(&line).is_err());
    }

    #[test]
    fn complements_pair_opposite_sides() {
        let home = parse_line(&raw(MarketKind::Spread, Selection::Home, "-110", Some(-3.5))).unwrap();
        let away = parse_line(&raw(MarketKind::Spread, Selection::Away, "-110", Some(3.5))).unwrap();
        let away_other = parse_line(&raw(MarketKind::Spread, Selection::Away, "-110", Some(4.5))).unwrap();
        assert!(is_complement(&home, &away));
        assert!(!is_complement(&home, &away_other));
        assert!(!is_complement(&home, &home));
    }

    #[test]
    fn wager_display_is_readable() {
        let w = parse_line(&raw(MarketKind::Spread, Selection::Home, "+110", Some(-3.5))).unwrap();
        assert_eq!(w.to_string(), "spread home -3.5 @ +110");
    }
}
