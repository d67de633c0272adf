//! Kelly stake fractions.
//!
//! With `d` the decimal price and `b = d - 1` the net payout per unit, the
//! growth-optimal fraction of bankroll is `f* = (b·p - (1 - p)) / b`. The
//! sizing layer scales it by a fractional multiplier and caps the result.

/// Full Kelly fraction for win probability `win_prob` at decimal odds
/// `decimal_odds` (stake included, e.g. +110 → 2.10).
///
/// Returns `0.0` when the expected value is non-positive.
pub fn kelly_fraction(win_prob: f64, decimal_odds: f64) -> f64 {
    if !win_prob.is_finite() || !decimal_odds.is_finite() || decimal_odds <= 1.0 {
        return 0.0;
    }
    let p = win_prob.clamp(0.0, 1.0);
    let net = decimal_odds - 1.0;
    let full = (net * p - (1.0 - p)) / net;
    full.clamp(0.0, 1.0)
}

/// `min(multiplier · f*, max_fraction)`, never negative.
pub fn capped_fraction(win_prob: f64, decimal_odds: f64, multiplier: f64, max_fraction: f64) -> f64 {
    let f = kelly_fraction(win_prob, decimal_odds) * multiplier.max(0.0);
    f.min(max_fraction.max(0.0))
}

/// Expected profit per unit staked: `p·d − 1`.
///
/// A push returns the stake, so only the win probability earns the odds.
pub fn expected_value_per_unit(win_prob: f64, decimal_odds: f64) -> f64 {
    win_prob * decimal_odds - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fair_coin_at_even_money_stakes_nothing() {
        let f = kelly_fraction(0.5, 2.0);
        assert_relative_eq!(f, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn sixty_percent_at_even_money() {
        let f = kelly_fraction(0.6, 2.0);
        assert_relative_eq!(f, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn plus_money_price() {
        // +110: b = 1.1, p = 0.55 → (0.605 - 0.45)/1.1
        let f = kelly_fraction(0.55, 2.10);
        assert_relative_eq!(f, 0.155 / 1.1, epsilon = 1e-9);
    }

    #[test]
    fn quarter_kelly() {
        let f = capped_fraction(0.6, 2.0, 0.25, 1.0);
        assert_relative_eq!(f, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn cap_binds_before_multiplier() {
        let f = capped_fraction(0.9, 3.0, 1.0, 0.05);
        assert_relative_eq!(f, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn negative_edge_clamps_to_zero() {
        let f = kelly_fraction(0.3, 2.0);
        assert_relative_eq!(f, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_prices() {
        assert_relative_eq!(kelly_fraction(0.9, 1.0), 0.0);
        assert_relative_eq!(kelly_fraction(0.9, f64::NAN), 0.0);
    }

    #[test]
    fn expected_value_sign() {
        assert_relative_eq!(expected_value_per_unit(0.6, 2.0), 0.2, epsilon = 1e-9);
        assert!(expected_value_per_unit(0.45, 2.0) < 0.0);
    }
}
