//! Grading a wager against an official final result.

use rust_decimal::prelude::*;
use std::cmp::Ordering;

use crate::betting::odds::{MarketSpec, Wager};
use crate::db::models::{BetStatus, FinalResult, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost,
    Push,
}

impl Outcome {
    pub fn status(&self) -> BetStatus {
        match self {
            Outcome::Won => BetStatus::Won,
            Outcome::Lost => BetStatus::Lost,
            Outcome::Push => BetStatus::Push,
        }
    }
}

fn from_cmp(ord: Option<Ordering>) -> Outcome {
    match ord {
        Some(Ordering::Greater) => Outcome::Won,
        Some(Ordering::Less) => Outcome::Lost,
        _ => Outcome::Push,
    }
}

/// Over wins above the line, under below it, exact hits push.
fn over_under(value: f64, line: f64, selection: Selection) -> Outcome {
    match selection {
        Selection::Under => from_cmp(line.partial_cmp(&value)),
        _ => from_cmp(value.partial_cmp(&line)),
    }
}

pub fn grade(wager: &Wager, result: &FinalResult) -> Outcome {
    let margin = result.margin() as f64;
    match &wager.market {
        MarketSpec::Moneyline => match wager.selection {
            Selection::Away => from_cmp((-margin).partial_cmp(&0.0)),
            _ => from_cmp(margin.partial_cmp(&0.0)),
        },
        MarketSpec::Spread { line } => {
            let covered_by = match wager.selection {
                Selection::Away => line - margin,
                _ => margin + line,
            };
            from_cmp(covered_by.partial_cmp(&0.0))
        }
        MarketSpec::Total { line } => over_under(result.total() as f64, *line, wager.selection),
        MarketSpec::PlayerProp { player_id, stat, line } => match result.player_stat(player_id, *stat) {
            Some(value) => over_under(value, *line, wager.selection),
            // Did not play
            None => Outcome::Push,
        },
    }
}

/// Stake times the payout multiplier, to the cent (half away from zero).
pub fn potential_payout(stake: Decimal, wager: &Wager) -> Decimal {
    (stake * wager.payout_multiplier()).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
