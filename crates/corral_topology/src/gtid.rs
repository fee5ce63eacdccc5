//! Applied-transaction-set algebra.
//!
//! An [`AppliedSet`] records, per originating server, which transaction
//! sequence numbers a node has durably applied — intervals like
//! `3e11fa47:1-5:7-9,8f2c0b11:1-3`. It is the logical clock the
//! orchestrator compares to decide whether one node's history is a prefix
//! of another's or the two have diverged.
//!
//! Sets only ever grow on a live node; the comparison primitives here are
//! pure and operate on snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relation between two applied-transaction histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRelation {
    /// Both nodes applied exactly the same set.
    Equal,
    /// `self` is a strict subset: the other node is strictly ahead.
    Behind,
    /// `self` is a strict superset: the other node is strictly behind.
    Ahead,
    /// Neither is a subset of the other — incompatible histories.
    Diverged,
}

/// A closed, normalized set of `(source, sequence-interval)` pairs.
///
/// Intervals are inclusive, kept sorted and coalesced, so structural
/// equality is set equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSet {
    ranges: BTreeMap<String, Vec<(u64, u64)>>,
}

impl AppliedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record `[lo, hi]` (inclusive) for `source`, merging with adjacent
    /// or overlapping intervals.
    pub fn add_range(&mut self, source: &str, lo: u64, hi: u64) {
        debug_assert!(lo >= 1 && lo <= hi, "interval must be non-empty and 1-based");
        let intervals = self.ranges.entry(source.to_string()).or_default();
        intervals.push((lo, hi));
        Self::normalize(intervals);
    }

    /// Record a single sequence number for `source`.
    pub fn add(&mut self, source: &str, seq: u64) {
        self.add_range(source, seq, seq);
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.ranges
            .values()
            .flat_map(|iv| iv.iter())
            .map(|(lo, hi)| hi - lo + 1)
            .sum()
    }

    pub fn contains(&self, source: &str, seq: u64) -> bool {
        self.ranges
            .get(source)
            .is_some_and(|iv| iv.iter().any(|&(lo, hi)| lo <= seq && seq <= hi))
    }

    /// True iff every transaction in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &AppliedSet) -> bool {
        self.ranges.iter().all(|(source, intervals)| {
            let Some(theirs) = other.ranges.get(source) else {
                return intervals.is_empty();
            };
            intervals
                .iter()
                .all(|&(lo, hi)| Self::covered(theirs, lo, hi))
        })
    }

    /// Merge `other` into `self`.
    pub fn union_with(&mut self, other: &AppliedSet) {
        for (source, intervals) in &other.ranges {
            let mine = self.ranges.entry(source.clone()).or_default();
            mine.extend_from_slice(intervals);
            Self::normalize(mine);
        }
    }

    /// Compare two histories.
    pub fn relation(&self, other: &AppliedSet) -> HistoryRelation {
        let fwd = self.is_subset_of(other);
        let bwd = other.is_subset_of(self);
        match (fwd, bwd) {
            (true, true) => HistoryRelation::Equal,
            (true, false) => HistoryRelation::Behind,
            (false, true) => HistoryRelation::Ahead,
            (false, false) => HistoryRelation::Diverged,
        }
    }

    /// True iff `[lo, hi]` is fully covered by the (normalized) intervals.
    fn covered(intervals: &[(u64, u64)], lo: u64, hi: u64) -> bool {
        // Normalized intervals are disjoint and non-adjacent, so a covered
        // query interval must sit inside a single one of them.
        intervals.iter().any(|&(a, b)| a <= lo && hi <= b)
    }

    /// Sort and coalesce overlapping/adjacent intervals in place.
    fn normalize(intervals: &mut Vec<(u64, u64)>) {
        intervals.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(lo, hi) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        *intervals = merged;
    }
}

impl fmt::Display for AppliedSet {
    /// `source:lo-hi:lo2-hi2,source2:lo-hi`; single-element intervals
    /// print as a bare number.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.ranges {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(source)?;
            for &(lo, hi) in intervals {
                if lo == hi {
                    write!(f, ":{lo}")?;
                } else {
                    write!(f, ":{lo}-{hi}")?;
                }
            }
        }
        Ok(())
    }
}

/// Error from parsing an applied-set string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed applied-set '{0}'")]
pub struct AppliedSetParseError(pub String);

impl FromStr for AppliedSet {
    type Err = AppliedSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = AppliedSet::new();
        let text = s.trim();
        if text.is_empty() {
            return Ok(set);
        }
        for part in text.split(',') {
            let mut pieces = part.trim().split(':');
            let source = pieces
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| AppliedSetParseError(s.to_string()))?;
            let mut any = false;
            for interval in pieces {
                any = true;
                let (lo, hi) = match interval.split_once('-') {
                    Some((lo, hi)) => {
                        let lo = lo.parse().map_err(|_| AppliedSetParseError(s.to_string()))?;
                        let hi = hi.parse().map_err(|_| AppliedSetParseError(s.to_string()))?;
                        (lo, hi)
                    }
                    None => {
                        let v: u64 = interval
                            .parse()
                            .map_err(|_| AppliedSetParseError(s.to_string()))?;
                        (v, v)
                    }
                };
                if lo == 0 || hi < lo {
                    return Err(AppliedSetParseError(s.to_string()));
                }
                set.add_range(source, lo, hi);
            }
            if !any {
                return Err(AppliedSetParseError(s.to_string()));
            }
        }
        Ok(set)
    }
}

// Serialized as the compact string form so metadata snapshots stay
// readable in dumps and logs.
impl Serialize for AppliedSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AppliedSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> AppliedSet {
        s.parse().unwrap()
    }

    #[test]
    fn parse_display_round_trip() {
        let s = set("a:1-5:7,b:3");
        assert_eq!(s.to_string(), "a:1-5:7,b:3");
        assert_eq!(s.count(), 7);
        assert!(s.contains("a", 7));
        assert!(!s.contains("a", 6));
    }

    #[test]
    fn adjacent_intervals_coalesce() {
        let mut s = AppliedSet::new();
        s.add_range("a", 1, 3);
        s.add_range("a", 4, 6);
        s.add("a", 7);
        assert_eq!(s.to_string(), "a:1-7");
    }

    #[test]
    fn prefix_is_behind_not_diverged() {
        let shorter = set("a:1-3");
        let longer = set("a:1-5,b:1");
        assert_eq!(shorter.relation(&longer), HistoryRelation::Behind);
        assert_eq!(longer.relation(&shorter), HistoryRelation::Ahead);
    }

    #[test]
    fn incompatible_histories_diverge() {
        let a = set("a:1-5,x:1-2");
        let b = set("a:1-5,y:1");
        assert_eq!(a.relation(&b), HistoryRelation::Diverged);
        assert!(!a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
    }

    #[test]
    fn equal_sets() {
        let a = set("a:1-5");
        let mut b = AppliedSet::new();
        for i in 1..=5 {
            b.add("a", i);
        }
        assert_eq!(a.relation(&b), HistoryRelation::Equal);
    }

    #[test]
    fn empty_set_is_subset_of_everything() {
        let empty = AppliedSet::new();
        let a = set("a:1-5");
        assert!(empty.is_subset_of(&a));
        assert!(empty.is_subset_of(&empty));
        assert_eq!(empty.relation(&a), HistoryRelation::Behind);
    }

    #[test]
    fn union_covers_both_operands() {
        let mut a = set("a:1-3");
        let b = set("a:5,b:1-2");
        a.union_with(&b);
        assert_eq!(a.to_string(), "a:1-3:5,b:1-2");
        assert!(set("a:1-3").is_subset_of(&a));
        assert!(b.is_subset_of(&a));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("a:".parse::<AppliedSet>().is_err());
        assert!(":1-2".parse::<AppliedSet>().is_err());
        assert!("a:5-2".parse::<AppliedSet>().is_err());
        assert!("a:0".parse::<AppliedSet>().is_err());
        assert!("a:x-2".parse::<AppliedSet>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let s = set("a:1-4,b:9");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"a:1-4,b:9\"");
        let back: AppliedSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
