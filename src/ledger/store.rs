use anyhow::Result;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::db::models::{Bet, Game, Wallet};

/// Durable side of the ledger. Each call is one transaction: either every
/// row it names is written or none is.
pub trait LedgerStore: Send + Sync {
    fn save_wallet(&self, wallet: &Wallet) -> Result<()>;

    /// New bet plus the debited wallet.
    fn save_placement(&self, wallet: &Wallet, bet: &Bet) -> Result<()>;

    /// Graded (or voided) bets plus the credited wallet.
    fn save_settlement(&self, wallet: &Wallet, bets: &[Bet]) -> Result<()>;

    fn save_game(&self, game: &Game) -> Result<()>;
}

/// Store that keeps nothing; used by paper-trade replays.
#[derive(Debug, Default)]
pub struct EphemeralStore;

impl LedgerStore for EphemeralStore {
    fn save_wallet(&self, _wallet: &Wallet) -> Result<()> {
        Ok(())
    }

    fn save_placement(&self, _wallet: &Wallet, _bet: &Bet) -> Result<()> {
        Ok(())
    }

    fn save_settlement(&self, _wallet: &Wallet, _bets: &[Bet]) -> Result<()> {
        Ok(())
    }

    fn save_game(&self, _game: &Game) -> Result<()> {
        Ok(())
    }
}

/// Store whose writes can be switched to fail, for exercising rollback.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub failing: AtomicBool,
}

#[cfg(test)]
impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }

    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl LedgerStore for FlakyStore {
    fn save_wallet(&self, _wallet: &Wallet) -> Result<()> {
        self.check()
    }

    fn save_placement(&self, _wallet: &Wallet, _bet: &Bet) -> Result<()> {
        self.check()
    }

    fn save_settlement(&self, _wallet: &Wallet, _bets: &[Bet]) -> Result<()> {
        self.check()
    }

    fn save_game(&self, _game: &Game) -> Result<()> {
        self.check()
    }
}
