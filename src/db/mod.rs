use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

pub mod models;
use models::*;

use crate::betting::recommend::Recommendation;
use crate::ledger::LedgerStore;
use crate::sim::SimulationSummary;

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Query filter for recommendation history.
#[derive(Debug, Clone, Default)]
pub struct RecommendationFilter {
    pub game_id: Option<String>,
    /// Player id for prop markets
    pub player: Option<String>,
    /// Market kind ("moneyline", "spread", "total", "player_prop")
    pub market: Option<String>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database lock poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Ledger state ─────────────────────────────────────────────────────────

    pub fn load_wallets(&self) -> Result<Vec<Wallet>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner, balance, total_wagered, total_winnings, total_losses,
                    total_bets, won_bets, created_at, updated_at
             FROM wallets ORDER BY created_at",
        )?;
        let wallets = stmt
            .query_map([], map_wallet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(wallets)
    }

    pub fn load_bets(&self) -> Result<Vec<Bet>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, wallet_id, game_id, wager, stake, potential_payout, status,
                    settled_amount, placed_at, settled_at
             FROM bets ORDER BY placed_at",
        )?;
        let bets = skip_bad_rows(stmt.query_map([], map_bet)?, "bet");
        Ok(bets)
    }

    pub fn load_games(&self) -> Result<Vec<Game>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, scheduled_at, home_team_id, away_team_id, status, final_result
             FROM games ORDER BY scheduled_at",
        )?;
        let games = skip_bad_rows(stmt.query_map([], map_game)?, "game");
        Ok(games)
    }

    /// Wallet with the given owner, if one was opened before.
    pub fn find_wallet_by_owner(&self, owner: &str) -> Result<Option<Uuid>> {
        let conn = self.lock()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM wallets WHERE owner=?1 ORDER BY created_at LIMIT 1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|s| Uuid::parse_str(&s).context("stored wallet id"))
            .transpose()
    }

    // ── Simulations ──────────────────────────────────────────────────────────

    /// Persist a finished run summary. Invalid summaries are refused.
    pub fn insert_simulation(&self, summary: &SimulationSummary) -> Result<i64> {
        summary.validate()?;
        let payload = serde_json::to_string(summary)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO simulations (game_id, trials, seed, low_confidence, summary, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                summary.game_id,
                summary.trials,
                summary.seed.map(|s| s as i64),
                !summary.quality.is_good(),
                payload,
                summary.completed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest summary per game, optionally for a single game.
    pub fn list_simulations(&self, game_id: Option<&str>) -> Result<Vec<SimulationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.summary FROM simulations s
             WHERE s.id = (SELECT MAX(id) FROM simulations WHERE game_id = s.game_id)
               AND (?1 IS NULL OR s.game_id = ?1)
             ORDER BY s.completed_at DESC",
        )?;
        let rows = stmt
            .query_map(params![game_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .iter()
            .filter_map(|raw| decode_checked(raw, "simulation", |s: &SimulationSummary| s.validate()))
            .collect())
    }

    pub fn get_simulation(&self, game_id: &str) -> Result<Option<SimulationSummary>> {
        Ok(self.list_simulations(Some(game_id))?.into_iter().next())
    }

    // ── Recommendations ──────────────────────────────────────────────────────

    pub fn insert_recommendations(&self, wallet_id: Uuid, batch: &[Recommendation]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for rec in batch {
            let wager = &rec.market.wager;
            tx.execute(
                "INSERT INTO recommendations (
                    wallet_id, game_id, market_kind, participant, stake, rank, payload, created_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    wallet_id.to_string(),
                    rec.market.game_id,
                    wager.market.kind().as_str(),
                    wager.market.participant(),
                    rec.stake.to_string(),
                    rec.rank,
                    serde_json::to_string(rec)?,
                    rec.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_recommendations(&self, filter: &RecommendationFilter, limit: i64) -> Result<Vec<Recommendation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM recommendations
             WHERE (?1 IS NULL OR game_id = ?1)
               AND (?2 IS NULL OR participant = ?2)
               AND (?3 IS NULL OR market_kind = ?3)
             ORDER BY created_at DESC, rank ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![filter.game_id, filter.player, filter.market, limit],
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .iter()
            .filter_map(|raw| {
                decode_checked(raw, "recommendation", |r: &Recommendation| {
                    r.market.wager.validate()?;
                    Ok(())
                })
            })
            .collect())
    }
}

// ── Ledger store ───────────────────────────────────────────────────────────────

impl LedgerStore for Database {
    fn save_wallet(&self, wallet: &Wallet) -> Result<()> {
        let conn = self.lock()?;
        upsert_wallet(&conn, wallet)
    }

    fn save_placement(&self, wallet: &Wallet, bet: &Bet) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert_wallet(&tx, wallet)?;
        upsert_bet(&tx, bet)?;
        tx.commit()?;
        Ok(())
    }

    fn save_settlement(&self, wallet: &Wallet, bets: &[Bet]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert_wallet(&tx, wallet)?;
        for bet in bets {
            upsert_bet(&tx, bet)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_game(&self, game: &Game) -> Result<()> {
        let conn = self.lock()?;
        let result = game.final_result.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO games (id, scheduled_at, home_team_id, away_team_id, status, final_result)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(id) DO UPDATE SET
                scheduled_at=excluded.scheduled_at,
                status=excluded.status,
                final_result=excluded.final_result",
            params![
                game.id,
                game.scheduled_at,
                game.home_team_id,
                game.away_team_id,
                game.status.as_str(),
                result,
            ],
        )?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn upsert_wallet(conn: &Connection, w: &Wallet) -> Result<()> {
    conn.execute(
        "INSERT INTO wallets (id, owner, balance, total_wagered, total_winnings, total_losses,
                              total_bets, won_bets, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
         ON CONFLICT(id) DO UPDATE SET
            balance=excluded.balance,
            total_wagered=excluded.total_wagered,
            total_winnings=excluded.total_winnings,
            total_losses=excluded.total_losses,
            total_bets=excluded.total_bets,
            won_bets=excluded.won_bets,
            updated_at=excluded.updated_at",
        params![
            w.id.to_string(),
            w.owner,
            w.balance.to_string(),
            w.total_wagered.to_string(),
            w.total_winnings.to_string(),
            w.total_losses.to_string(),
            w.total_bets as i64,
            w.won_bets as i64,
            w.created_at,
            w.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_bet(conn: &Connection, b: &Bet) -> Result<()> {
    conn.execute(
        "INSERT INTO bets (id, wallet_id, game_id, wager, stake, potential_payout, status,
                           settled_amount, placed_at, settled_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
         ON CONFLICT(id) DO UPDATE SET
            status=excluded.status,
            settled_amount=excluded.settled_amount,
            settled_at=excluded.settled_at",
        params![
            b.id.to_string(),
            b.wallet_id.to_string(),
            b.game_id,
            serde_json::to_string(&b.wager)?,
            b.stake.to_string(),
            b.potential_payout.to_string(),
            b.status.as_str(),
            b.settled_amount.map(|d| d.to_string()),
            b.placed_at,
            b.settled_at,
        ],
    )?;
    Ok(())
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn text_decimal(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn text_uuid(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e))
}

fn text_json<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

/// Decode a JSON payload and run its validity check; bad rows are logged
/// and dropped.
/// Decoded rows; rows that fail to decode are logged and left out.
fn skip_bad_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>, what: &str) -> Vec<T> {
    rows.filter_map(|row| match row {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping undecodable {} row: {}", what, e);
            None
        }
    })
    .collect()
}

fn decode_checked<T, F>(raw: &str, what: &str, check: F) -> Option<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<()>,
{
    let value: T = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping undecodable {} row: {}", what, e);
            return None;
        }
    };
    if let Err(e) = check(&value) {
        warn!("Skipping invalid {} row: {:#}", what, e);
        return None;
    }
    Some(value)
}

fn map_wallet(row: &rusqlite::Row) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: text_uuid(row, 0)?,
        owner: row.get(1)?,
        balance: text_decimal(row, 2)?,
        total_wagered: text_decimal(row, 3)?,
        total_winnings: text_decimal(row, 4)?,
        total_losses: text_decimal(row, 5)?,
        total_bets: row.get::<_, i64>(6)? as u64,
        won_bets: row.get::<_, i64>(7)? as u64,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_bet(row: &rusqlite::Row) -> rusqlite::Result<Bet> {
    let wager: crate::betting::odds::Wager = text_json(row, 3)?;
    wager.validate().map_err(|e| conversion(3, e))?;
    let status: String = row.get(6)?;
    let status = BetStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, format!("unknown bet status {status}").into())
    })?;
    let settled_amount: Option<String> = row.get(7)?;
    let settled_amount = settled_amount
        .map(|s| Decimal::from_str(&s).map_err(|e| conversion(7, e)))
        .transpose()?;
    Ok(Bet {
        id: text_uuid(row, 0)?,
        wallet_id: text_uuid(row, 1)?,
        game_id: row.get(2)?,
        wager,
        stake: text_decimal(row, 4)?,
        potential_payout: text_decimal(row, 5)?,
        status,
        settled_amount,
        placed_at: row.get(8)?,
        settled_at: row.get(9)?,
    })
}

fn map_game(row: &rusqlite::Row) -> rusqlite::Result<Game> {
    let status: String = row.get(4)?;
    let final_result: Option<String> = row.get(5)?;
    let final_result = final_result
        .map(|s| serde_json::from_str::<FinalResult>(&s).map_err(|e| conversion(5, e)))
        .transpose()?;
    Ok(Game {
        id: row.get(0)?,
        scheduled_at: row.get(1)?,
        home_team_id: row.get(2)?,
        away_team_id: row.get(3)?,
        status: GameStatus::from_str(&status),
        final_result,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
///
/// Money columns hold decimal strings; tagged payloads are JSON text.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    id             TEXT    PRIMARY KEY,
    owner          TEXT    NOT NULL,
    balance        TEXT    NOT NULL,
    total_wagered  TEXT    NOT NULL,
    total_winnings TEXT    NOT NULL,
    total_losses   TEXT    NOT NULL,
    total_bets     INTEGER NOT NULL DEFAULT 0,
    won_bets       INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT    NOT NULL,
    updated_at     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS games (
    id           TEXT PRIMARY KEY,
    scheduled_at TEXT NOT NULL,
    home_team_id TEXT NOT NULL,
    away_team_id TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'scheduled',
    final_result TEXT
);

CREATE TABLE IF NOT EXISTS bets (
    id               TEXT PRIMARY KEY,
    wallet_id        TEXT NOT NULL,
    game_id          TEXT NOT NULL,
    wager            TEXT NOT NULL,
    stake            TEXT NOT NULL,
    potential_payout TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    settled_amount   TEXT,
    placed_at        TEXT NOT NULL,
    settled_at       TEXT,
    FOREIGN KEY (wallet_id) REFERENCES wallets(id)
);

CREATE TABLE IF NOT EXISTS simulations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    game_id        TEXT    NOT NULL,
    trials         INTEGER NOT NULL,
    seed           INTEGER,
    low_confidence INTEGER NOT NULL DEFAULT 0,
    summary        TEXT    NOT NULL,
    completed_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS recommendations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id   TEXT    NOT NULL,
    game_id     TEXT    NOT NULL,
    market_kind TEXT    NOT NULL,
    participant TEXT,
    stake       TEXT    NOT NULL,
    rank        INTEGER NOT NULL,
    payload     TEXT    NOT NULL,
    created_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bets_wallet ON bets(wallet_id);
CREATE INDEX IF NOT EXISTS idx_bets_game ON bets(game_id);
CREATE INDEX IF NOT EXISTS idx_simulations_game ON simulations(game_id);
CREATE INDEX IF NOT EXISTS idx_recommendations_game ON recommendations(game_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::betting::odds::{MarketSpec, Price, Wager};
    use crate::ledger::Ledger;
    use crate::sim::distribution::{MetricSummary, ThresholdMass};
    use crate::sim::{DataQuality, Metric};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn summary(game_id: &str, mean: f64) -> SimulationSummary {
        SimulationSummary {
            game_id: game_id.into(),
            trials: 10_000,
            seed: Some(u64::MAX),
            quality: DataQuality::Good,
            metrics: vec![MetricSummary {
                metric: Metric::Margin,
                mean,
                median: mean,
                stddev: 10.0,
                thresholds: vec![ThresholdMass { line: 3.5, over: 0.52, under: 0.48, push: 0.0 }],
            }],
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn ledger_state_survives_reopen() {
        let db = Database::open_in_memory().unwrap();
        let ledger = Ledger::new(Arc::new(db.clone()));
        let wallet = ledger.open_wallet("house", dec!(1000), Utc::now()).unwrap();
        ledger
            .register_game(Game {
                id: "g1".into(),
                scheduled_at: Utc::now(),
                home_team_id: "H".into(),
                away_team_id: "A".into(),
                status: GameStatus::Scheduled,
                final_result: None,
            })
            .unwrap();
        let wager = Wager {
            market: MarketSpec::Spread { line: -3.5 },
            selection: Selection::Home,
            price: Price::American(110),
        };
        let bet = ledger
            .place(
                crate::ledger::PlaceBet { wallet_id: wallet.id, game_id: "g1".into(), wager, stake: dec!(50) },
                Utc::now(),
            )
            .unwrap();

        let wallets = db.load_wallets().unwrap();
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].balance, dec!(950));
        let bets = db.load_bets().unwrap();
        assert_eq!(bets, vec![bet.clone()]);
        assert_eq!(db.load_games().unwrap()[0].id, "g1");
        assert_eq!(db.find_wallet_by_owner("house").unwrap(), Some(wallet.id));
        assert_eq!(db.find_wallet_by_owner("nobody").unwrap(), None);

        let game = Game {
            status: GameStatus::Final,
            final_result: Some(FinalResult { home_score: 110, away_score: 100, player_stats: BTreeMap::new() }),
            ..db.load_games().unwrap().remove(0)
        };
        ledger.settle(&game, Utc::now()).unwrap();
        let bets = db.load_bets().unwrap();
        assert_eq!(bets[0].status, BetStatus::Won);
        assert_eq!(bets[0].settled_amount, Some(dec!(105.00)));
        assert!(db.load_games().unwrap()[0].is_final());
        assert_eq!(db.load_wallets().unwrap()[0].balance, dec!(1055.00));
    }

    #[test]
    fn latest_simulation_per_game() {
        let db = Database::open_in_memory().unwrap();
        db.insert_simulation(&summary("g1", 3.0)).unwrap();
        db.insert_simulation(&summary("g1", 4.0)).unwrap();
        db.insert_simulation(&summary("g2", 1.0)).unwrap();
        assert_eq!(db.list_simulations(None).unwrap().len(), 2);
        let g1 = db.get_simulation("g1").unwrap().unwrap();
        assert_eq!(g1.metrics[0].mean, 4.0);
        assert_eq!(g1.seed, Some(u64::MAX));
        assert!(db.get_simulation("g3").unwrap().is_none());
    }

    #[test]
    fn invalid_summaries_never_cross_the_boundary() {
        let db = Database::open_in_memory().unwrap();
        let mut bad = summary("g1", 3.0);
        bad.metrics[0].thresholds[0].over = 0.9;
        assert!(db.insert_simulation(&bad).is_err());

        // A corrupted row written behind our back is skipped on read.
        {
            let conn = db.lock().unwrap();
            let payload = serde_json::to_string(&bad).unwrap();
            conn.execute(
                "INSERT INTO simulations (game_id, trials, seed, low_confidence, summary, completed_at)
                 VALUES ('g1', 10000, NULL, 0, ?1, ?2)",
                params![payload, Utc::now()],
            )
            .unwrap();
        }
        assert!(db.get_simulation("g1").unwrap().is_none());
    }

    #[test]
    fn undecodable_ledger_rows_are_skipped_on_load() {
        let db = Database::open_in_memory().unwrap();
        let ledger = Ledger::new(Arc::new(db.clone()));
        let wallet = ledger.open_wallet("house", dec!(1000), Utc::now()).unwrap();
        for id in ["g1", "g2"] {
            ledger
                .register_game(Game {
                    id: id.into(),
                    scheduled_at: Utc::now(),
                    home_team_id: "H".into(),
                    away_team_id: "A".into(),
                    status: GameStatus::Scheduled,
                    final_result: None,
                })
                .unwrap();
        }
        let place = |game_id: &str| {
            let wager = Wager {
                market: MarketSpec::Moneyline,
                selection: Selection::Away,
                price: Price::American(-120),
            };
            ledger
                .place(
                    crate::ledger::PlaceBet { wallet_id: wallet.id, game_id: game_id.into(), wager, stake: dec!(10) },
                    Utc::now(),
                )
                .unwrap()
        };
        let good = place("g1");
        let corrupt = place("g2");

        {
            let conn = db.lock().unwrap();
            let zero_price = serde_json::to_string(&Wager {
                market: MarketSpec::Moneyline,
                selection: Selection::Away,
                price: Price::American(0),
            })
            .unwrap();
            conn.execute(
                "UPDATE bets SET wager=?1 WHERE id=?2",
                params![zero_price, corrupt.id.to_string()],
            )
            .unwrap();
            conn.execute("UPDATE games SET final_result='{not json' WHERE id='g2'", [])
                .unwrap();
        }

        assert_eq!(db.load_bets().unwrap(), vec![good]);
        let games = db.load_games().unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, "g1");
    }
}
