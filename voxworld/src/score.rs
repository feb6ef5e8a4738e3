//! Territory scoring with continuous exponential decay.
//!
//! Each territory owner accumulates a score and a score balance. The score
//! decays toward zero with a long half life; the balance decays toward a
//! fixed baseline with a shorter one, and is what activator rewards are paid
//! out of. A handicap proportional to territory size scales points added to
//! the score but not to the balance.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Half life of the score, in seconds (30 days).
const HALF_LIFE_SCORE: f64 = 30.0 * 24.0 * 3600.0;
/// Half life of the balance, in seconds (5 days).
const HALF_LIFE_BALANCE: f64 = 5.0 * 24.0 * 3600.0;
/// The balance decays toward this value rather than zero.
const BALANCE_ZERO: f64 = 10.0;
/// Owning more chunks than this imposes a score handicap.
const HANDICAP_LIMIT: f64 = 10.0;

/// Persisted form of one owner's score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDoc {
    pub score: f64,
    pub balance: f64,
    /// Unix timestamp of the last decay application.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
struct TerritoryScore {
    score: f64,
    balance: f64,
    handicap: f64,
    timestamp: f64,
    modified: bool,
    name: String,
}

impl TerritoryScore {

    /// Apply decay from the stored timestamp up to `now` (unix seconds).
    fn decay(&mut self, now: f64) {
        let dt = (now - self.timestamp).max(0.0);
        self.timestamp = now;
        self.modified = true;
        self.score *= (-dt / HALF_LIFE_SCORE).exp2();
        self.balance = (self.balance - BALANCE_ZERO) * (-dt / HALF_LIFE_BALANCE).exp2() + BALANCE_ZERO;
    }

}

/// The handicap factor for a player owning `chunks` chunks: 1 up to the
/// limit, then shrinking proportionally.
pub fn handicap_factor(chunks: usize) -> f64 {
    HANDICAP_LIMIT / (chunks as f64).max(HANDICAP_LIMIT)
}

/// Unix time as fractional seconds.
fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The score table for every known territory owner.
#[derive(Default)]
pub struct ScoreBoard {
    inner: RwLock<HashMap<u32, TerritoryScore>>,
}

impl ScoreBoard {

    pub fn new() -> Self {
        Self::default()
    }

    /// Register an owner, typically at login, seeding from the persisted
    /// document when there is one.
    pub fn initialize(&self, uid: u32, name: &str, chunks: usize, doc: Option<ScoreDoc>) {
        let mut inner = self.inner.write().expect("poisoned");
        let entry = inner.entry(uid).or_insert_with(|| {
            let mut ts = match doc {
                Some(doc) => TerritoryScore {
                    score: doc.score,
                    balance: doc.balance,
                    handicap: 1.0,
                    timestamp: doc.timestamp as f64,
                    modified: false,
                    name: name.to_string(),
                },
                None => TerritoryScore {
                    score: 0.0,
                    balance: BALANCE_ZERO,
                    handicap: 1.0,
                    timestamp: unix_now(),
                    modified: true,
                    name: name.to_string(),
                },
            };
            ts.decay(unix_now());
            ts
        });
        entry.handicap = handicap_factor(chunks);
    }

    /// Update the handicap after a territory change.
    pub fn set_chunk_count(&self, uid: u32, chunks: usize) {
        let mut inner = self.inner.write().expect("poisoned");
        if let Some(ts) = inner.get_mut(&uid) {
            ts.handicap = handicap_factor(chunks);
        }
    }

    /// Add points: the score gets them scaled by the handicap, the balance
    /// gets them in full.
    pub fn add(&self, uid: u32, points: f64) {
        let mut inner = self.inner.write().expect("poisoned");
        let entry = inner.entry(uid).or_insert_with(|| TerritoryScore {
            score: 0.0,
            balance: BALANCE_ZERO,
            handicap: 1.0,
            timestamp: unix_now(),
            modified: true,
            name: String::new(),
        });
        entry.score += points * entry.handicap;
        entry.balance += points;
        entry.modified = true;
    }

    /// Pay `cost` from the owner's balance; false when it does not cover.
    pub fn pay(&self, uid: u32, cost: f64) -> bool {
        let mut inner = self.inner.write().expect("poisoned");
        match inner.get_mut(&uid) {
            Some(ts) if ts.balance >= cost => {
                ts.balance -= cost;
                ts.modified = true;
                true
            }
            _ => false,
        }
    }

    /// The current (decayed) score and balance, mostly for reports.
    pub fn get(&self, uid: u32) -> Option<(f64, f64)> {
        let mut inner = self.inner.write().expect("poisoned");
        inner.get_mut(&uid).map(|ts| {
            ts.decay(unix_now());
            (ts.score, ts.balance)
        })
    }

    /// Apply decay to every modified entry and hand the dirty documents to
    /// `save`. Called from the maintenance task and once more at shutdown.
    pub fn maintain(&self, mut save: impl FnMut(u32, ScoreDoc)) {
        let now = unix_now();
        let mut dirty = Vec::new();
        {
            let mut inner = self.inner.write().expect("poisoned");
            for (&uid, ts) in inner.iter_mut() {
                if !ts.modified {
                    continue;
                }
                ts.decay(now);
                ts.modified = false;
                dirty.push((uid, ScoreDoc {
                    score: ts.score,
                    balance: ts.balance,
                    timestamp: ts.timestamp as u64,
                }));
            }
        }
        // The store is called outside the table lock; saving can block.
        for (uid, doc) in dirty {
            save(uid, doc);
        }
    }

    /// Human readable dump of every entry.
    pub fn report(&self, write: &mut impl Write) -> io::Result<()> {
        let inner = self.inner.read().expect("poisoned");
        for (uid, ts) in inner.iter() {
            writeln!(
                write,
                "{} ({}) score {:.1} balance {:.1} handicap {:.2}",
                ts.name, uid, ts.score, ts.balance, ts.handicap,
            )?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn handicap_kicks_in_above_the_limit() {
        assert_eq!(handicap_factor(0), 1.0);
        assert_eq!(handicap_factor(10), 1.0);
        assert_eq!(handicap_factor(20), 0.5);
        assert_eq!(handicap_factor(40), 0.25);
    }

    #[test]
    fn add_and_pay() {
        let board = ScoreBoard::new();
        board.initialize(1, "alice", 0, None);
        board.add(1, 5.0);
        // Balance starts at the baseline and received the full 5 points.
        assert!(board.pay(1, 14.0));
        assert!(!board.pay(1, 100.0));
        assert!(!board.pay(99, 0.5));
    }

    #[test]
    fn handicap_scales_score_not_balance() {
        let board = ScoreBoard::new();
        board.initialize(1, "bob", 40, None);
        board.add(1, 8.0);
        let (score, balance) = board.get(1).unwrap();
        assert!((score - 2.0).abs() < 1e-6, "score {score}");
        assert!((balance - (BALANCE_ZERO + 8.0)).abs() < 1e-6, "balance {balance}");
    }

    #[test]
    fn decay_halves_at_the_half_life() {
        let mut ts = TerritoryScore {
            score: 100.0,
            balance: 50.0,
            handicap: 1.0,
            timestamp: 0.0,
            modified: false,
            name: String::new(),
        };
        ts.decay(HALF_LIFE_SCORE);
        assert!((ts.score - 50.0).abs() < 1e-9);
        // Balance decays toward 10 with its own, shorter, half life.
        let expected = (50.0 - BALANCE_ZERO) * (-HALF_LIFE_SCORE / HALF_LIFE_BALANCE).exp2() + BALANCE_ZERO;
        assert!((ts.balance - expected).abs() < 1e-9);
        assert!(ts.modified);
    }

    #[test]
    fn maintain_saves_only_dirty_entries() {
        let board = ScoreBoard::new();
        board.initialize(1, "a", 0, Some(ScoreDoc { score: 1.0, balance: 11.0, timestamp: 0 }));
        board.add(1, 1.0);
        let mut saved = Vec::new();
        board.maintain(|uid, doc| saved.push((uid, doc)));
        assert_eq!(saved.len(), 1);
        // Nothing changed since, so nothing new to save.
        saved.clear();
        board.maintain(|uid, doc| saved.push((uid, doc)));
        assert!(saved.is_empty());
    }

}
