use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::betting::odds::Wager;

/// A tracked per-game statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stat {
    Points,
    Rebounds,
    Assists,
    Threes,
    /// Possessions per game; used for the matchup pace adjustment only.
    Pace,
}

impl Stat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stat::Points => "points",
            Stat::Rebounds => "rebounds",
            Stat::Assists => "assists",
            Stat::Threes => "threes",
            Stat::Pace => "pace",
        }
    }

    /// Lenient parse of the stat names used by odds feeds ("Player Points",
    /// "three-pointers", "3PM", ...).
    pub fn parse(s: &str) -> Option<Stat> {
        let s = s.trim().to_lowercase();
        let s = s.strip_prefix("player ").unwrap_or(&s);
        match s {
            "points" | "pts" => Some(Stat::Points),
            "rebounds" | "reb" => Some(Stat::Rebounds),
            "assists" | "ast" => Some(Stat::Assists),
            "threes" | "three-pointers" | "three pointers" | "3pm" => Some(Stat::Threes),
            "pace" => Some(Stat::Pace),
            _ => None,
        }
    }

    /// Stats that produce a simulated box-score line for a player.
    pub const PLAYER_LINES: [Stat; 4] = [Stat::Points, Stat::Rebounds, Stat::Assists, Stat::Threes];
}

/// Rolling mean and variance of one statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatMoments {
    pub mean: f64,
    pub variance: f64,
}

/// Whose statistics a profile describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileSubject {
    Team { team_id: String },
    Player { player_id: String, team_id: String },
}

/// Statistical profile of a team or player, as supplied by the stat provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatProfile {
    pub subject: ProfileSubject,
    #[serde(default)]
    pub stats: BTreeMap<Stat, StatMoments>,
    #[serde(default)]
    pub sample_size: u32,
    pub as_of: DateTime<Utc>,
}

impl StatProfile {
    /// Placeholder profile for a subject the provider had no data for.
    pub fn empty(subject: ProfileSubject, as_of: DateTime<Utc>) -> Self {
        StatProfile {
            subject,
            stats: BTreeMap::new(),
            sample_size: 0,
            as_of,
        }
    }

    pub fn moments(&self, stat: Stat) -> Option<StatMoments> {
        self.stats.get(&stat).copied()
    }

    pub fn team_id(&self) -> &str {
        match &self.subject {
            ProfileSubject::Team { team_id } => team_id,
            ProfileSubject::Player { team_id, .. } => team_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    Final,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::Final => "final",
        }
    }

    pub fn from_str(s: &str) -> GameStatus {
        match s.to_lowercase().as_str() {
            "final" | "finished" | "ft" | "closed" => GameStatus::Final,
            _ => GameStatus::Scheduled,
        }
    }
}

/// Official box score of a completed game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub home_score: i32,
    pub away_score: i32,
    /// player_id → stat → value
    #[serde(default)]
    pub player_stats: BTreeMap<String, BTreeMap<Stat, f64>>,
}

impl FinalResult {
    /// Home minus away.
    pub fn margin(&self) -> i32 {
        self.home_score - self.away_score
    }

    pub fn total(&self) -> i32 {
        self.home_score + self.away_score
    }

    pub fn player_stat(&self, player_id: &str, stat: Stat) -> Option<f64> {
        self.player_stats.get(player_id)?.get(&stat).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub home_team_id: String,
    pub away_team_id: String,
    pub status: GameStatus,
    #[serde(default)]
    pub final_result: Option<FinalResult>,
}

impl Game {
    pub fn is_final(&self) -> bool {
        self.status == GameStatus::Final
    }

    /// The result only counts once the game is officially final.
    pub fn official_result(&self) -> Option<&FinalResult> {
        if self.is_final() {
            self.final_result.as_ref()
        } else {
            None
        }
    }
}

/// Market type as quoted by the odds provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Moneyline,
    Spread,
    Total,
    PlayerProp,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Moneyline => "moneyline",
            MarketKind::Spread => "spread",
            MarketKind::Total => "total",
            MarketKind::PlayerProp => "player_prop",
        }
    }

    /// Accepts the common feed spellings ("h2h", "spreads", "totals", ...).
    pub fn parse(s: &str) -> Option<MarketKind> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "moneyline" | "h2h" | "ml" => Some(MarketKind::Moneyline),
            "spread" | "spreads" | "handicap" => Some(MarketKind::Spread),
            "total" | "totals" | "over_under" => Some(MarketKind::Total),
            "player_prop" | "prop" | "props" => Some(MarketKind::PlayerProp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Home,
    Away,
    Over,
    Under,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::Home => "home",
            Selection::Away => "away",
            Selection::Over => "over",
            Selection::Under => "under",
        }
    }

    pub fn parse(s: &str) -> Option<Selection> {
        match s.trim().to_lowercase().as_str() {
            "home" | "h" => Some(Selection::Home),
            "away" | "a" | "visitor" => Some(Selection::Away),
            "over" | "o" => Some(Selection::Over),
            "under" | "u" => Some(Selection::Under),
            _ => None,
        }
    }

    /// The other side of a two-way market.
    pub fn opposite(&self) -> Selection {
        match self {
            Selection::Home => Selection::Away,
            Selection::Away => Selection::Home,
            Selection::Over => Selection::Under,
            Selection::Under => Selection::Over,
        }
    }
}

/// A sportsbook quote, exactly as received. Parsing into a typed
/// [`Wager`] happens per line in the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsLine {
    pub game_id: String,
    pub market: MarketKind,
    pub selection: Selection,
    /// Player id for player props
    #[serde(default)]
    pub participant: Option<String>,
    /// Prop statistic, e.g. "points"
    #[serde(default)]
    pub stat: Option<String>,
    /// Quoted price: American ("+110", "-150") or decimal ("2.10")
    pub price: String,
    /// Spread / total / prop line for this selection
    #[serde(default)]
    pub line: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Push,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "PENDING",
            BetStatus::Won => "WON",
            BetStatus::Lost => "LOST",
            BetStatus::Push => "PUSH",
        }
    }

    pub fn parse(s: &str) -> Option<BetStatus> {
        match s {
            "PENDING" => Some(BetStatus::Pending),
            "WON" => Some(BetStatus::Won),
            "LOST" => Some(BetStatus::Lost),
            "PUSH" => Some(BetStatus::Push),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Pending)
    }
}

/// A virtual wallet. Every ledger operation names its wallet explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    /// Owning account (exactly one)
    pub owner: String,
    pub balance: Decimal,
    pub total_wagered: Decimal,
    /// Sum of payouts credited by winning bets (stake included)
    pub total_winnings: Decimal,
    /// Sum of stakes forfeited by losing bets
    pub total_losses: Decimal,
    pub total_bets: u64,
    pub won_bets: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner: &str, initial_balance: Decimal, now: DateTime<Utc>) -> Self {
        Wallet {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            balance: initial_balance,
            total_wagered: Decimal::ZERO,
            total_winnings: Decimal::ZERO,
            total_losses: Decimal::ZERO,
            total_bets: 0,
            won_bets: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A wager funded by one wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub game_id: String,
    /// Market, selection and price at placement
    pub wager: Wager,
    pub stake: Decimal,
    /// Credited on a win (stake × payout multiplier)
    pub potential_payout: Decimal,
    pub status: BetStatus,
    /// Amount credited back at settlement (payout, refund, or zero)
    pub settled_amount: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}
