use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::db::Store;
use crate::error::{Error, Result};
use crate::models::{RankResult, RankedWallet, Wallet};

/// Upper bound of a top-N query.
pub const MAX_TOP: usize = 6000;

#[derive(Debug, Clone)]
struct Entry {
    total: Decimal,
    wallet: Wallet,
}

/// Wallets with an active total, best first. Ties keep store order.
#[derive(Debug, Clone, Default)]
pub struct RankingView {
    entries: Vec<Entry>,
}

impl RankingView {
    pub fn from_wallets(wallets: impl IntoIterator<Item = Wallet>) -> Self {
        let mut view = RankingView {
            entries: wallets
                .into_iter()
                .filter_map(|wallet| wallet.total.map(|total| Entry { total, wallet }))
                .collect(),
        };
        view.sort();
        view
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.total.cmp(&a.total).then(a.wallet.id.cmp(&b.wallet.id)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copy of the view with one wallet's new state applied.
    pub fn with_wallet(&self, wallet: &Wallet) -> RankingView {
        let mut next = self.clone();
        next.entries.retain(|e| !e.wallet.is_address(&wallet.address));
        if let Some(total) = wallet.total {
            next.entries.push(Entry { total, wallet: wallet.clone() });
            next.sort();
        }
        next
    }

    pub fn top(&self, n: usize) -> Vec<RankedWallet> {
        self.entries
            .iter()
            .take(n)
            .enumerate()
            .map(|(i, e)| RankedWallet { rank: i + 1, wallet: e.wallet.clone() })
            .collect()
    }

    /// Rank of `address` and the value gaps to its neighbors, costed at `price`.
    pub fn rank(&self, address: &str, price: Decimal) -> Result<RankResult> {
        let mut better: Option<&Entry> = None;
        let mut found = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.wallet.is_address(address) {
                found = Some((i, entry));
                break;
            }
            better = Some(entry);
        }
        let (index, own) = found.ok_or_else(|| {
            Error::NotFound(format!(
                "{address} was not found, it may be too new to be ranked yet; try again after the next sync"
            ))
        })?;
        let worse = self.entries.get(index + 1);

        let distance_to_better = better.map_or(Decimal::ZERO, |b| (b.total - own.total).round_dp(2));
        let distance_to_worse = worse.map(|w| (own.total - w.total).round_dp(2));

        Ok(RankResult {
            address: own.wallet.address.clone(),
            rank: index + 1,
            out_of: self.entries.len(),
            total: own.total,
            distance_to_better,
            distance_to_worse,
            cost_to_better: (distance_to_better * price).round_dp(2),
            cost_to_worse: distance_to_worse.map(|d| (d * price).round_dp(2)),
            price,
        })
    }
}

/// Shared ranking view. Readers take a snapshot, writers swap in a new one.
#[derive(Default)]
pub struct RankingEngine {
    view: RwLock<Arc<RankingView>>,
}

impl RankingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RankingView> {
        self.view.read().clone()
    }

    #[cfg(test)]
    pub fn replace(&self, view: RankingView) {
        *self.view.write() = Arc::new(view);
    }

    /// Rebuild the view from the store. Returns the number of ranked wallets.
    ///
    /// The store is read under the write lock: an `apply` racing with the
    /// reload either lands in the loaded rows or runs after the swap.
    pub fn reload(&self, store: &Store) -> Result<usize> {
        let mut guard = self.view.write();
        let view = RankingView::from_wallets(store.load_wallets()?);
        let ranked = view.len();
        *guard = Arc::new(view);
        Ok(ranked)
    }

    /// Apply one wallet's freshly synchronized state.
    pub fn apply(&self, wallet: &Wallet) {
        let mut guard = self.view.write();
        let next = guard.with_wallet(wallet);
        *guard = Arc::new(next);
    }

    pub fn rank(&self, address: &str, price: Decimal) -> Result<RankResult> {
        self.snapshot().rank(address, price)
    }

    pub fn top(&self, n: usize) -> Result<Vec<RankedWallet>> {
        if n == 0 || n > MAX_TOP {
            return Err(Error::InvalidInput(format!(
                "{n} is either too high (above {MAX_TOP}) or too low (0 or less)"
            )));
        }
        Ok(self.snapshot().top(n))
    }
}
