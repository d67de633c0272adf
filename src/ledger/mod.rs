//! Virtual-wallet ledger and bet settlement state machine.
//!
//! Each wallet sits behind its own mutex together with the bets it funded, so
//! balance-changing operations on one wallet are serialized while different
//! wallets proceed in parallel. Every mutation is computed on a copy, written
//! through the [`LedgerStore`], and only then committed to memory.
//!
//! Lock order: a wallet lock may be held while briefly taking the games or
//! bet-index locks, never the other way round.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod settlement;
pub mod store;

use crate::betting::odds::{OddsError, Wager};
use crate::db::models::{Bet, BetStatus, Game, Wallet};
use settlement::{grade, potential_payout, Outcome};
pub use store::{EphemeralStore, LedgerStore};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("insufficient balance: stake {stake} exceeds balance {balance}")]
    InsufficientBalance { balance: Decimal, stake: Decimal },
    #[error("game {0} is already final")]
    GameAlreadyFinal(String),
    #[error("game {0} is not known to the ledger")]
    GameNotFound(String),
    #[error("wallet {0} not found")]
    WalletNotFound(Uuid),
    #[error("bet {0} not found")]
    BetNotFound(Uuid),
    #[error("bet {0} is already settled")]
    AlreadySettled(Uuid),
    #[error("stake must be positive, got {0}")]
    InvalidStake(Decimal),
    #[error("opening balance must not be negative, got {0}")]
    NegativeBalance(Decimal),
    #[error(transparent)]
    InvalidWager(#[from] OddsError),
    #[error("storage failure: {0}")]
    Storage(String),
}

fn storage(err: anyhow::Error) -> LedgerError {
    LedgerError::Storage(format!("{err:#}"))
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("ledger lock poisoned".into())
}

/// Request to place a bet from a specific wallet.
#[derive(Debug, Clone)]
pub struct PlaceBet {
    pub wallet_id: Uuid,
    pub game_id: String,
    pub wager: Wager,
    pub stake: Decimal,
}

/// What one `settle` call did.
#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub game_id: String,
    /// The game had no official result yet; nothing was graded
    pub deferred: bool,
    pub settled: Vec<Bet>,
    /// Wallets whose batch could not be written; their bets stay pending
    pub failures: Vec<(Uuid, LedgerError)>,
}

#[derive(Debug)]
struct WalletBook {
    wallet: Wallet,
    bets: Vec<Bet>,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    wallets: RwLock<HashMap<Uuid, Arc<Mutex<WalletBook>>>>,
    games: RwLock<HashMap<String, Game>>,
    /// bet id → funding wallet id
    bet_index: RwLock<HashMap<Uuid, Uuid>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Ledger {
            store,
            wallets: RwLock::new(HashMap::new()),
            games: RwLock::new(HashMap::new()),
            bet_index: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild in-memory state from previously persisted rows.
    pub fn restore(store: Arc<dyn LedgerStore>, wallets: Vec<Wallet>, bets: Vec<Bet>, games: Vec<Game>) -> Self {
        let mut books: HashMap<Uuid, WalletBook> = wallets
            .into_iter()
            .map(|w| (w.id, WalletBook { wallet: w, bets: Vec::new() }))
            .collect();
        let mut index = HashMap::new();
        for bet in bets {
            match books.get_mut(&bet.wallet_id) {
                Some(book) => {
                    index.insert(bet.id, bet.wallet_id);
                    book.bets.push(bet);
                }
                None => warn!("Dropping bet {} for unknown wallet {}", bet.id, bet.wallet_id),
            }
        }
        let wallets = books
            .into_iter()
            .map(|(id, book)| (id, Arc::new(Mutex::new(book))))
            .collect();
        Ledger {
            store,
            wallets: RwLock::new(wallets),
            games: RwLock::new(games.into_iter().map(|g| (g.id.clone(), g)).collect()),
            bet_index: RwLock::new(index),
        }
    }

    fn book(&self, wallet_id: Uuid) -> Result<Arc<Mutex<WalletBook>>, LedgerError> {
        self.wallets
            .read()
            .map_err(poisoned)?
            .get(&wallet_id)
            .cloned()
            .ok_or(LedgerError::WalletNotFound(wallet_id))
    }

    fn lock(book: &Mutex<WalletBook>) -> Result<MutexGuard<'_, WalletBook>, LedgerError> {
        book.lock().map_err(poisoned)
    }

    pub fn open_wallet(&self, owner: &str, initial_balance: Decimal, now: DateTime<Utc>) -> Result<Wallet, LedgerError> {
        if initial_balance < Decimal::ZERO {
            return Err(LedgerError::NegativeBalance(initial_balance));
        }
        let wallet = Wallet::new(owner, initial_balance, now);
        self.store.save_wallet(&wallet).map_err(storage)?;
        self.wallets.write().map_err(poisoned)?.insert(
            wallet.id,
            Arc::new(Mutex::new(WalletBook {
                wallet: wallet.clone(),
                bets: Vec::new(),
            })),
        );
        info!("Opened wallet {} for {} with balance {}", wallet.id, owner, initial_balance);
        Ok(wallet)
    }

    /// Add or refresh a game. A game already seen as final stays final.
    pub fn register_game(&self, game: Game) -> Result<(), LedgerError> {
        let mut games = self.games.write().map_err(poisoned)?;
        if games.get(&game.id).is_some_and(|g| g.is_final() && !game.is_final()) {
            return Ok(());
        }
        if games.get(&game.id) == Some(&game) {
            return Ok(());
        }
        self.store.save_game(&game).map_err(storage)?;
        games.insert(game.id.clone(), game);
        Ok(())
    }

    #[cfg(test)]
    pub fn game(&self, game_id: &str) -> Option<Game> {
        self.games.read().ok()?.get(game_id).cloned()
    }

    pub fn place(&self, req: PlaceBet, now: DateTime<Utc>) -> Result<Bet, LedgerError> {
        if req.stake <= Decimal::ZERO {
            return Err(LedgerError::InvalidStake(req.stake));
        }
        req.wager.validate()?;

        let book = self.book(req.wallet_id)?;
        let mut book = Self::lock(&book)?;
        {
            let games = self.games.read().map_err(poisoned)?;
            let game = games
                .get(&req.game_id)
                .ok_or_else(|| LedgerError::GameNotFound(req.game_id.clone()))?;
            if game.is_final() {
                return Err(LedgerError::GameAlreadyFinal(req.game_id.clone()));
            }
        }
        if req.stake > book.wallet.balance {
            return Err(LedgerError::InsufficientBalance {
                balance: book.wallet.balance,
                stake: req.stake,
            });
        }

        let mut wallet = book.wallet.clone();
        wallet.balance -= req.stake;
        wallet.total_wagered += req.stake;
        wallet.total_bets += 1;
        wallet.updated_at = now;
        let bet = Bet {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            game_id: req.game_id,
            potential_payout: potential_payout(req.stake, &req.wager),
            wager: req.wager,
            stake: req.stake,
            status: BetStatus::Pending,
            settled_amount: None,
            placed_at: now,
            settled_at: None,
        };
        self.store.save_placement(&wallet, &bet).map_err(storage)?;

        book.wallet = wallet;
        book.bets.push(bet.clone());
        self.bet_index.write().map_err(poisoned)?.insert(bet.id, bet.wallet_id);
        info!(
            "Placed bet {} on game {}: {} stake {} (balance {})",
            bet.id, bet.game_id, bet.wager, bet.stake, book.wallet.balance
        );
        Ok(bet)
    }

    /// Grade every pending bet on a final game. Safe to call repeatedly.
    pub fn settle(&self, game: &Game, now: DateTime<Utc>) -> Result<SettlementReport, LedgerError> {
        let mut report = SettlementReport {
            game_id: game.id.clone(),
            ..Default::default()
        };
        let Some(result) = game.official_result() else {
            report.deferred = true;
            return Ok(report);
        };

        // Marking the game final first closes it to new placements before any
        // wallet is graded.
        {
            let mut games = self.games.write().map_err(poisoned)?;
            if games.get(&game.id) != Some(game) {
                self.store.save_game(game).map_err(storage)?;
                games.insert(game.id.clone(), game.clone());
            }
        }

        let books: Vec<(Uuid, Arc<Mutex<WalletBook>>)> = self
            .wallets
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(id, b)| (*id, b.clone()))
            .collect();

        for (wallet_id, book) in books {
            let mut book = Self::lock(&book)?;
            let pending: Vec<usize> = book
                .bets
                .iter()
                .enumerate()
                .filter(|(_, b)| b.game_id == game.id && b.status == BetStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                continue;
            }

            let mut wallet = book.wallet.clone();
            let mut graded = Vec::with_capacity(pending.len());
            for &i in &pending {
                let mut bet = book.bets[i].clone();
                let outcome = grade(&bet.wager, result);
                apply_outcome(&mut wallet, &mut bet, outcome, now);
                graded.push(bet);
            }
            wallet.updated_at = now;

            if let Err(e) = self.store.save_settlement(&wallet, &graded) {
                warn!("Settlement of game {} failed for wallet {}: {:#}", game.id, wallet_id, e);
                report.failures.push((wallet_id, storage(e)));
                continue;
            }
            book.wallet = wallet;
            for (&i, bet) in pending.iter().zip(&graded) {
                book.bets[i] = bet.clone();
            }
            report.settled.extend(graded);
        }

        if !report.settled.is_empty() {
            info!("Settled {} bet(s) on game {}", report.settled.len(), game.id);
        }
        Ok(report)
    }

    /// Refund a single pending bet, e.g. for a postponed game.
    pub fn void_bet(&self, bet_id: Uuid, now: DateTime<Utc>) -> Result<Bet, LedgerError> {
        let wallet_id = self
            .bet_index
            .read()
            .map_err(poisoned)?
            .get(&bet_id)
            .copied()
            .ok_or(LedgerError::BetNotFound(bet_id))?;
        let book = self.book(wallet_id)?;
        let mut book = Self::lock(&book)?;
        let i = book
            .bets
            .iter()
            .position(|b| b.id == bet_id)
            .ok_or(LedgerError::BetNotFound(bet_id))?;
        if book.bets[i].status.is_terminal() {
            return Err(LedgerError::AlreadySettled(bet_id));
        }

        let mut wallet = book.wallet.clone();
        let mut bet = book.bets[i].clone();
        apply_outcome(&mut wallet, &mut bet, Outcome::Push, now);
        wallet.updated_at = now;
        self.store
            .save_settlement(&wallet, std::slice::from_ref(&bet))
            .map_err(storage)?;
        book.wallet = wallet;
        book.bets[i] = bet.clone();
        info!("Voided bet {} (refunded {})", bet.id, bet.stake);
        Ok(bet)
    }

    pub fn wallet(&self, wallet_id: Uuid) -> Result<Wallet, LedgerError> {
        let book = self.book(wallet_id)?;
        let book = Self::lock(&book)?;
        Ok(book.wallet.clone())
    }

    pub fn wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        let books: Vec<_> = self.wallets.read().map_err(poisoned)?.values().cloned().collect();
        books
            .iter()
            .map(|b| Self::lock(b).map(|g| g.wallet.clone()))
            .collect()
    }

    /// Bets funded by a wallet, newest first.
    pub fn bets(&self, wallet_id: Uuid) -> Result<Vec<Bet>, LedgerError> {
        let book = self.book(wallet_id)?;
        let book = Self::lock(&book)?;
        let mut bets = book.bets.clone();
        bets.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        Ok(bets)
    }

    pub fn bet(&self, bet_id: Uuid) -> Result<Bet, LedgerError> {
        let wallet_id = self
            .bet_index
            .read()
            .map_err(poisoned)?
            .get(&bet_id)
            .copied()
            .ok_or(LedgerError::BetNotFound(bet_id))?;
        let book = self.book(wallet_id)?;
        let book = Self::lock(&book)?;
        book.bets
            .iter()
            .find(|b| b.id == bet_id)
            .cloned()
            .ok_or(LedgerError::BetNotFound(bet_id))
    }

    /// Total stake a wallet placed at or after `since`.
    pub fn committed_since(&self, wallet_id: Uuid, since: DateTime<Utc>) -> Result<Decimal, LedgerError> {
        let book = self.book(wallet_id)?;
        let book = Self::lock(&book)?;
        Ok(book
            .bets
            .iter()
            .filter(|b| b.placed_at >= since)
            .map(|b| b.stake)
            .sum())
    }

    /// Final games that still carry pending bets, e.g. after a settlement
    /// write failed or the process stopped mid-settlement.
    pub fn final_games_with_pending_bets(&self) -> Result<Vec<Game>, LedgerError> {
        let books: Vec<_> = self.wallets.read().map_err(poisoned)?.values().cloned().collect();
        let mut ids = Vec::new();
        for book in &books {
            let book = Self::lock(book)?;
            for bet in book.bets.iter().filter(|b| b.status == BetStatus::Pending) {
                if !ids.contains(&bet.game_id) {
                    ids.push(bet.game_id.clone());
                }
            }
        }
        let games = self.games.read().map_err(poisoned)?;
        let mut finals: Vec<Game> = ids
            .iter()
            .filter_map(|id| games.get(id))
            .filter(|g| g.official_result().is_some())
            .cloned()
            .collect();
        finals.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(finals)
    }
}

fn apply_outcome(wallet: &mut Wallet, bet: &mut Bet, outcome: Outcome, now: DateTime<Utc>) {
    let credited = match outcome {
        Outcome::Won => {
            wallet.total_winnings += bet.potential_payout;
            wallet.won_bets += 1;
            bet.potential_payout
        }
        Outcome::Push => bet.stake,
        Outcome::Lost => {
            wallet.total_losses += bet.stake;
            Decimal::ZERO
        }
    };
    wallet.balance += credited;
    bet.status = outcome.status();
    bet.settled_amount = Some(credited);
    bet.settled_at = Some(now);
}
