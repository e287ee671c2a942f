//! Score-ordered sets with TTL, used for overload-minute tracking.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Default)]
struct ScoreSet {
    /// `(score, member)`; BTreeSet keeps members ordered by score.
    members: BTreeSet<(i64, String)>,
    expires_at: Option<Instant>,
}

impl ScoreSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Keyed sorted sets. Each `add` refreshes the whole set's TTL, mirroring
/// the expire-on-touch pattern used for rolling windows.
#[derive(Debug, Default)]
pub struct ScoreSets {
    sets: DashMap<String, ScoreSet>,
}

impl ScoreSets {
    pub fn add(&self, key: &str, score: i64, member: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.is_expired(now) {
            set.members.clear();
        }
        set.members.insert((score, member.to_string()));
        set.expires_at = ttl.map(|t| now + t);
    }

    /// Count members with `min <= score <= max`.
    pub fn count_in_range(&self, key: &str, min: i64, max: i64) -> usize {
        let now = Instant::now();
        let Some(set) = self.sets.get(key) else {
            return 0;
        };
        if set.is_expired(now) {
            return 0;
        }
        set.members
            .range((min, String::new())..=(max, "\u{10FFFF}".to_string()))
            .count()
    }

    /// Remove members scoring strictly below `min_score`. Returns removals.
    pub fn trim_below(&self, key: &str, min_score: i64) -> usize {
        let Some(mut set) = self.sets.get_mut(key) else {
            return 0;
        };
        let keep = set.members.split_off(&(min_score, String::new()));
        let removed = set.members.len();
        set.members = keep;
        removed
    }

    /// Drop expired sets. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sets.len();
        self.sets.retain(|_, s| !s.is_expired(now));
        before - self.sets.len()
    }
}
