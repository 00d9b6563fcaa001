//! Watermark-bounded handling of out-of-order edges.
//!
//! A late edge is never applied to the live graph or forest. It is inserted
//! into a copy of the state its window saw (the live state while that window
//! is open, a snapshot taken when it closed otherwise), matched there, and
//! whatever results the replay produces are merged as recovered results.

use crate::error::{Result, RpqError};
use crate::forest::Forest;
use crate::result_set::{ResultEvent, ResultSet, StreamType};
use crate::streaming_graph::{EdgeKey, StreamingGraph};
use crate::windowing::WindowManager;
use crate::Timestamp;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::matcher::PatternMatcher;

/// Graph and forest as they were when a window closed.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub graph: StreamingGraph,
    pub forest: Forest,
    pub taken_at: Timestamp,
}

/// State a late edge was replayed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayBase {
    Live,
    Snapshot { open: Timestamp, close: Timestamp },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LateEdge {
    Recovered {
        base: ReplayBase,
        events: Vec<ResultEvent>,
    },
    Dropped {
        gap: Timestamp,
    },
}

#[derive(Debug, Default)]
pub struct OutOfOrderRecovery {
    watermark: Timestamp,
    snapshots: BTreeMap<(Timestamp, Timestamp), Arc<WindowSnapshot>>,
    recovered: usize,
    dropped: usize,
}

impl OutOfOrderRecovery {
    pub fn new(watermark: Timestamp) -> Self {
        Self {
            watermark,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.watermark > 0
    }

    pub fn watermark(&self) -> Timestamp {
        self.watermark
    }

    /// Records the current graph and forest for every window in `bounds`.
    /// The windows closed in one pass share a single copy.
    pub fn snapshot(
        &mut self,
        bounds: &[(Timestamp, Timestamp)],
        graph: &StreamingGraph,
        forest: &Forest,
        now: Timestamp,
    ) {
        if !self.is_enabled() || bounds.is_empty() {
            return;
        }
        let snapshot = Arc::new(WindowSnapshot {
            graph: graph.clone(),
            forest: forest.deep_copy(),
            taken_at: now,
        });
        for &b in bounds {
            debug!("Snapshot of window [{},{}) at {}", b.0, b.1, now);
            self.snapshots.insert(b, Arc::clone(&snapshot));
        }
    }

    /// Drops snapshots no late edge within the watermark can need.
    pub fn prune(&mut self, high: Timestamp) -> usize {
        let horizon = high - self.watermark;
        let before = self.snapshots.len();
        self.snapshots.retain(|&(_, close), _| close > horizon);
        before - self.snapshots.len()
    }

    pub fn snapshot_for(&self, open: Timestamp, close: Timestamp) -> Option<&Arc<WindowSnapshot>> {
        self.snapshots.get(&(open, close))
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn recovered(&self) -> usize {
        self.recovered
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Picks the state a late edge at `t` is replayed against: the newest
    /// window containing `t` that the stream materialized, live while it is
    /// open and from its snapshot once closed.
    fn base_for(t: Timestamp, high: Timestamp, windows: &WindowManager) -> ReplayBase {
        for (open, close) in windows.natural_windows(t).into_iter().rev() {
            if close > high {
                return ReplayBase::Live;
            }
            match windows.find(open, close) {
                Some(w) if w.evicted => return ReplayBase::Snapshot { open, close },
                Some(_) => return ReplayBase::Live,
                None => continue,
            }
        }
        ReplayBase::Empty
    }

    /// Replays the late edge `(src, dst, label, t)` that arrived when the
    /// stream had reached `high`, and merges its results into `results`.
    #[allow(clippy::too_many_arguments)]
    pub fn replay(
        &mut self,
        id: u64,
        key: EdgeKey,
        t: Timestamp,
        high: Timestamp,
        windows: &WindowManager,
        graph: &StreamingGraph,
        forest: &Forest,
        matcher: &PatternMatcher,
        results: &mut ResultSet,
    ) -> Result<LateEdge> {
        let gap = high - t;
        if !self.is_enabled() || gap > self.watermark {
            self.dropped += 1;
            warn!(
                "Dropping late edge ({}, {}, {}) at {}: {} behind the stream, watermark {}",
                key.src, key.dst, key.label, t, gap, self.watermark
            );
            return Ok(LateEdge::Dropped { gap });
        }

        let expiration = windows.expiration_for(t);
        let (base, mut base_graph, mut base_forest) = match Self::base_for(t, high, windows) {
            ReplayBase::Live => (ReplayBase::Live, graph.clone(), forest.deep_copy()),
            ReplayBase::Snapshot { open, close } => {
                let snapshot = self
                    .snapshots
                    .get(&(open, close))
                    .ok_or(RpqError::MissingSnapshot { open, close })?;
                (
                    ReplayBase::Snapshot { open, close },
                    snapshot.graph.clone(),
                    snapshot.forest.deep_copy(),
                )
            }
            ReplayBase::Empty => (ReplayBase::Empty, StreamingGraph::new(), Forest::new()),
        };
        debug!(
            "Replaying late edge ({}, {}, {}) at {} against {:?}",
            key.src, key.dst, key.label, t, base
        );

        let events = match base_graph.insert(id, key.src, key.dst, key.label, t, expiration) {
            Some(edge_id) => {
                let Some(edge) = base_graph.edge(edge_id).cloned() else {
                    return Err(RpqError::DuplicateEdgeMissing {
                        src: key.src,
                        dst: key.dst,
                        label: key.label,
                    });
                };
                let mut scratch = ResultSet::new();
                matcher.process_edge(&base_graph, &mut base_forest, &mut scratch, &edge, high)
            }
            None => Vec::new(),
        };

        let mut merged = Vec::new();
        for event in events {
            if event.stream != StreamType::IStream {
                continue;
            }
            if results.merge_recovered(event.pair, event.timestamp, event.valid_until, high) {
                merged.push(event);
            }
        }
        self.recovered += 1;

        Ok(LateEdge::Recovered {
            base,
            events: merged,
        })
    }
}
