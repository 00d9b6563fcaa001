use crate::{Timestamp, VertexId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultPair {
    pub source: VertexId,
    pub destination: VertexId,
}

impl ResultPair {
    pub fn new(source: VertexId, destination: VertexId) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Whole result relation, emitted when a window closes.
    RStream,
    /// Pair inserted or its timestamp improved.
    IStream,
    /// Pair deleted.
    DStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEvent {
    pub stream: StreamType,
    pub pair: ResultPair,
    pub timestamp: Timestamp,
    pub valid_until: Timestamp,
}

// Representing the (source, destination) -> timestamp relation of the query.
//
// Live results are backed by forest nodes and maintained by the matcher.
// Recovered results come from out-of-order replays on copies of the forest;
// nothing in the live forest supports them, so they carry their own validity
// bound and are dropped once a window close passes it. A pair keeps every
// (timestamp, valid_until) bound no other bound dominates, so a fresher but
// shorter-lived recovery never extends an older one.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    live: FxHashMap<ResultPair, Timestamp>,
    recovered: FxHashMap<ResultPair, Vec<(Timestamp, Timestamp)>>,
    seen: FxHashSet<ResultPair>,
    pub last_timestamp_changed: Timestamp,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `pair` or raises its timestamp. Returns `true` if the
    /// relation changed. Self-pairs are never stored.
    pub fn upsert(&mut self, pair: ResultPair, timestamp: Timestamp, now: Timestamp) -> bool {
        if pair.source == pair.destination {
            return false;
        }
        self.seen.insert(pair);
        match self.live.get_mut(&pair) {
            Some(existing) if *existing >= timestamp => false,
            Some(existing) => {
                *existing = timestamp;
                self.last_timestamp_changed = now;
                true
            }
            None => {
                self.live.insert(pair, timestamp);
                self.last_timestamp_changed = now;
                true
            }
        }
    }

    /// Overwrites the live timestamp of `pair`, also when it goes down.
    pub fn set(&mut self, pair: ResultPair, timestamp: Timestamp, now: Timestamp) {
        if pair.source == pair.destination {
            return;
        }
        self.seen.insert(pair);
        self.live.insert(pair, timestamp);
        self.last_timestamp_changed = now;
    }

    pub fn remove(&mut self, pair: &ResultPair, now: Timestamp) -> Option<Timestamp> {
        let removed = self.live.remove(pair)?;
        self.last_timestamp_changed = now;
        Some(removed)
    }

    /// Adds a result found by an out-of-order replay. A result whose validity
    /// already ended is only counted as seen. Returns `true` if the visible
    /// timestamp of `pair` went up.
    pub fn merge_recovered(
        &mut self,
        pair: ResultPair,
        timestamp: Timestamp,
        valid_until: Timestamp,
        now: Timestamp,
    ) -> bool {
        if pair.source == pair.destination {
            return false;
        }
        self.seen.insert(pair);
        if valid_until <= now {
            return false;
        }
        let bounds = self.recovered.entry(pair).or_default();
        if bounds.iter().any(|&(ts, vu)| ts >= timestamp && vu >= valid_until) {
            return false;
        }
        bounds.retain(|&(ts, vu)| ts > timestamp || vu > valid_until);
        bounds.push((timestamp, valid_until));

        let improved = self.live.get(&pair).is_none_or(|&live| live < timestamp)
            && bounds.iter().all(|&(ts, _)| ts <= timestamp);
        if improved {
            self.last_timestamp_changed = now;
        }
        improved
    }

    /// Drops recovered bounds whose validity ended at or before `now`.
    /// Returns the pairs left with neither a recovered nor a live result,
    /// with the last timestamp they were visible at.
    pub fn expire_recovered(&mut self, now: Timestamp) -> Vec<(ResultPair, Timestamp)> {
        let mut gone = Vec::new();
        self.recovered.retain(|pair, bounds| {
            let last = bounds.iter().map(|&(ts, _)| ts).max();
            bounds.retain(|&(_, valid_until)| valid_until > now);
            if !bounds.is_empty() {
                return true;
            }
            if let Some(ts) = last {
                gone.push((*pair, ts));
            }
            false
        });
        gone.retain(|(pair, _)| !self.live.contains_key(pair));
        gone.sort_unstable();
        if !gone.is_empty() {
            self.last_timestamp_changed = now;
        }
        gone
    }

    pub fn get(&self, pair: &ResultPair) -> Option<Timestamp> {
        let live = self.live.get(pair).copied();
        let recovered = self
            .recovered
            .get(pair)
            .and_then(|bounds| bounds.iter().map(|&(ts, _)| ts).max());
        live.max(recovered)
    }

    pub fn live_timestamp(&self, pair: &ResultPair) -> Option<Timestamp> {
        self.live.get(pair).copied()
    }

    pub fn contains(&self, pair: &ResultPair) -> bool {
        self.live.contains_key(pair) || self.recovered.contains_key(pair)
    }

    pub fn len(&self) -> usize {
        self.live.len()
            + self
                .recovered
                .keys()
                .filter(|p| !self.live.contains_key(p))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.recovered.is_empty()
    }

    pub fn recovered_len(&self) -> usize {
        self.recovered.len()
    }

    /// Pairs ever reported, including ones deleted since.
    pub fn distinct_count(&self) -> usize {
        self.seen.len()
    }

    /// The visible relation ordered by pair.
    pub fn sorted(&self) -> Vec<(ResultPair, Timestamp)> {
        let mut rows: Vec<(ResultPair, Timestamp)> = self
            .live
            .keys()
            .chain(self.recovered.keys())
            .collect::<FxHashSet<_>>()
            .into_iter()
            .filter_map(|p| self.get(p).map(|ts| (*p, ts)))
            .collect();
        rows.sort_unstable();
        rows
    }

    /// Writes `source<d>destination<d>timestamp` rows ordered by pair.
    pub fn write_delimited<W: Write>(&self, writer: &mut W, delimiter: char) -> io::Result<()> {
        for (pair, ts) in self.sorted() {
            writeln!(
                writer,
                "{}{delimiter}{}{delimiter}{ts}",
                pair.source, pair.destination
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_set() {
        let mut results = ResultSet::new();
        let p = ResultPair::new(1, 2);

        assert!(results.upsert(p, 5, 5));
        assert!(!results.upsert(p, 3, 6));
        assert_eq!(results.get(&p), Some(5));
        assert!(results.upsert(p, 8, 8));
        assert_eq!(results.get(&p), Some(8));
        assert_eq!(results.last_timestamp_changed, 8);

        assert!(!results.upsert(ResultPair::new(3, 3), 1, 9));
        assert_eq!(results.len(), 1);

        assert_eq!(results.remove(&p, 10), Some(8));
        assert!(results.is_empty());
        assert_eq!(results.distinct_count(), 1);
    }

    #[test]
    fn test_recovered_results_expire() {
        let mut results = ResultSet::new();
        let live = ResultPair::new(1, 2);
        let late = ResultPair::new(1, 3);
        results.upsert(live, 4, 4);

        assert!(results.merge_recovered(late, 2, 10, 9));
        assert!(!results.merge_recovered(live, 3, 10, 9));
        assert_eq!(results.get(&live), Some(4));
        assert_eq!(results.len(), 2);
        assert_eq!(results.recovered_len(), 2);

        // already outside its validity: counted, not stored
        assert!(!results.merge_recovered(ResultPair::new(4, 5), 1, 9, 9));
        assert!(!results.contains(&ResultPair::new(4, 5)));
        assert_eq!(results.distinct_count(), 3);

        assert!(results.expire_recovered(9).is_empty());
        assert_eq!(results.expire_recovered(10), vec![(late, 2)]);
        assert_eq!(results.len(), 1);
        assert!(results.contains(&live));
    }

    #[test]
    fn test_recovered_bounds_do_not_mix() {
        let mut results = ResultSet::new();
        let p = ResultPair::new(1, 2);

        assert!(results.merge_recovered(p, 2, 20, 1));
        assert!(results.merge_recovered(p, 5, 12, 1));
        // dominated by (5, 12)
        assert!(!results.merge_recovered(p, 4, 11, 1));
        assert_eq!(results.get(&p), Some(5));

        // the fresher bound ends first, the older one still holds
        assert!(results.expire_recovered(12).is_empty());
        assert!(results.contains(&p));
        assert_eq!(results.get(&p), Some(2));

        assert_eq!(results.expire_recovered(20), vec![(p, 2)]);
        assert!(!results.contains(&p));
        assert_eq!(results.recovered_len(), 0);
    }

    #[test]
    fn test_write_delimited() {
        let mut results = ResultSet::new();
        results.upsert(ResultPair::new(3, 4), 12, 12);
        results.upsert(ResultPair::new(1, 2), 1, 1);
        results.merge_recovered(ResultPair::new(1, 3), 2, 10, 9);

        let mut out = Vec::new();
        results.write_delimited(&mut out, ',').unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1,2,1\n1,3,2\n3,4,12\n");
    }
}
