//! A minimal mempool surface: the pending buffer reorged transactions are
//! re-admitted through, and the recent-rejects filter that suppresses
//! repeated work for transactions that recently failed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use quagga_chain::transaction::{self, Transaction};

use crate::block::check::transaction_is_well_formed;

/// How many recently rejected transaction ids are remembered.
const RECENT_REJECTS_CAPACITY: usize = 120_000;

/// A two-generation rolling set: inserts go into the active generation,
/// lookups consult both, and filling the active generation retires the
/// older one.
struct RollingRejects {
    generations: [HashSet<transaction::Hash>; 2],
    active: usize,
    capacity: usize,
}

impl RollingRejects {
    fn new(capacity: usize) -> RollingRejects {
        RollingRejects {
            generations: [HashSet::new(), HashSet::new()],
            active: 0,
            capacity,
        }
    }

    fn insert(&mut self, hash: transaction::Hash) {
        if self.generations[self.active].len() >= self.capacity / 2 {
            self.active ^= 1;
            self.generations[self.active].clear();
        }
        self.generations[self.active].insert(hash);
    }

    fn contains(&self, hash: &transaction::Hash) -> bool {
        self.generations[0].contains(hash) || self.generations[1].contains(hash)
    }

    fn clear(&mut self) {
        self.generations[0].clear();
        self.generations[1].clear();
    }
}

/// The transaction pool the engine hands disconnected transactions back to.
pub struct Mempool {
    transactions: Mutex<HashMap<transaction::Hash, Arc<Transaction>>>,
    recent_rejects: Mutex<RollingRejects>,
}

impl Mempool {
    pub fn new() -> Mempool {
        Mempool {
            transactions: Mutex::new(HashMap::new()),
            recent_rejects: Mutex::new(RollingRejects::new(RECENT_REJECTS_CAPACITY)),
        }
    }

    /// Re-admit a transaction that fell out of a disconnected block.
    ///
    /// Runs the structural transaction checks and consults the
    /// recent-rejects filter; coinbase transactions are never admitted.
    pub fn re_admit(&self, tx: Arc<Transaction>) -> bool {
        if tx.is_coinbase() {
            return false;
        }
        let hash = tx.hash();
        if self.was_recently_rejected(&hash) {
            return false;
        }
        if transaction_is_well_formed(&tx).is_err() {
            self.reject(hash);
            return false;
        }
        self.transactions
            .lock()
            .expect("mempool lock poisoned")
            .insert(hash, tx);
        metrics::gauge!("mempool.transactions", self.len() as _);
        true
    }

    /// Remove the transactions confirmed by a newly connected block.
    pub fn remove_confirmed(&self, hashes: impl Iterator<Item = transaction::Hash>) {
        let mut transactions = self.transactions.lock().expect("mempool lock poisoned");
        for hash in hashes {
            transactions.remove(&hash);
        }
    }

    /// Record a rejected transaction id.
    pub fn reject(&self, hash: transaction::Hash) {
        self.recent_rejects
            .lock()
            .expect("recent-rejects lock poisoned")
            .insert(hash);
    }

    /// Whether this id recently failed validation.
    pub fn was_recently_rejected(&self, hash: &transaction::Hash) -> bool {
        self.recent_rejects
            .lock()
            .expect("recent-rejects lock poisoned")
            .contains(hash)
    }

    /// Forget all recent rejections. Called when the tip advances, since a
    /// new chain context can make old failures valid.
    pub fn clear_recent_rejects(&self) {
        self.recent_rejects
            .lock()
            .expect("recent-rejects lock poisoned")
            .clear();
    }

    pub fn contains(&self, hash: &transaction::Hash) -> bool {
        self.transactions
            .lock()
            .expect("mempool lock poisoned")
            .contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.transactions
            .lock()
            .expect("mempool lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Mempool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quagga_chain::{
        amount::Amount,
        transaction::LockTime,
        transparent::{Input, OutPoint, Output, Script},
    };
    use std::convert::TryFrom;

    fn spending_tx(salt: u8) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            1,
            vec![Input::PrevOut {
                outpoint: OutPoint {
                    hash: transaction::Hash([salt; 32]),
                    index: 0,
                },
                unlock_script: Script(vec![]),
                sequence: 0xffff_ffff,
            }],
            vec![Output {
                value: Amount::try_from(1000).unwrap(),
                lock_script: Script(vec![0x51]),
            }],
            LockTime::unlocked(),
        ))
    }

    #[test]
    fn re_admission_and_confirmation() {
        quagga_test::init();

        let mempool = Mempool::new();
        let tx = spending_tx(1);
        assert!(mempool.re_admit(tx.clone()));
        assert!(mempool.contains(&tx.hash()));

        mempool.remove_confirmed(std::iter::once(tx.hash()));
        assert!(!mempool.contains(&tx.hash()));
    }

    #[test]
    fn recent_rejects_suppress_re_admission() {
        quagga_test::init();

        let mempool = Mempool::new();
        let tx = spending_tx(2);
        mempool.reject(tx.hash());
        assert!(!mempool.re_admit(tx.clone()));

        mempool.clear_recent_rejects();
        assert!(mempool.re_admit(tx));
    }

    #[test]
    fn rolling_rejects_retire_old_generations() {
        quagga_test::init();

        let mut rejects = RollingRejects::new(4);
        let hash = |n: u8| transaction::Hash([n; 32]);
        rejects.insert(hash(1));
        rejects.insert(hash(2));
        // Generation rolls; the oldest entries survive one more roll.
        rejects.insert(hash(3));
        rejects.insert(hash(4));
        rejects.insert(hash(5));
        assert!(rejects.contains(&hash(5)));
        // Entry 1 was retired by now.
        assert!(!rejects.contains(&hash(1)));
    }
}
