//! Current-window edge store.
//!
//! Edges live in an arena addressed by [`EdgeId`]. Every live edge is linked
//! into exactly one position of the arrival-ordered list (intrusive `prev` /
//! `next` indices), indexed by its source for successor lookups and by its
//! destination for the forest's re-derivation step, and counted in the
//! per-vertex out-degree statistics used by retention.

use crate::{Label, Timestamp, VertexId};
use rustc_hash::FxHashMap;

/// Identity of a stream edge. A second arrival with the same key updates the
/// live edge instead of adding a parallel one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub src: VertexId,
    pub dst: VertexId,
    pub label: Label,
}

impl EdgeKey {
    pub fn new(src: VertexId, dst: VertexId, label: Label) -> Self {
        Self { src, dst, label }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEdge {
    /// Position of the record in the input stream.
    pub id: u64,
    pub src: VertexId,
    pub dst: VertexId,
    pub label: Label,
    pub timestamp: Timestamp,
    pub expiration: Timestamp,
}

impl StreamEdge {
    pub fn new(
        id: u64,
        src: VertexId,
        dst: VertexId,
        label: Label,
        timestamp: Timestamp,
        expiration: Timestamp,
    ) -> Self {
        Self {
            id,
            src,
            dst,
            label,
            timestamp,
            expiration,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.src, self.dst, self.label)
    }
}

/// Stable arena index of a live edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u32);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct EdgeSlot {
    edge: StreamEdge,
    prev: Option<EdgeId>,
    next: Option<EdgeId>,
}

/// Where a retained edge goes instead of being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    /// The edge is relinked right after this list entry and takes over its
    /// expiration.
    pub after: EdgeId,
}

/// Decides, during expiry, whether an expired edge is kept alive.
pub trait Retention {
    fn defer(&mut self, edge: &StreamEdge, zscore: f64, now: Timestamp) -> Option<Deferral>;
}

/// Expiry without retention: every expired edge is deleted.
pub struct NoRetention;

impl Retention for NoRetention {
    fn defer(&mut self, _edge: &StreamEdge, _zscore: f64, _now: Timestamp) -> Option<Deferral> {
        None
    }
}

/// Running mean and variance of the out-degree of every vertex that has at
/// least one live outgoing edge. A degree change is a Welford removal of the
/// old value followed by an insertion of the new one, so both are O(1).
#[derive(Debug, Clone, Default)]
pub struct DensityStats {
    degree: FxHashMap<VertexId, usize>,
    vertices: usize,
    mean: f64,
    m2: f64,
}

impl DensityStats {
    fn add_sample(&mut self, x: f64) {
        self.vertices += 1;
        let delta = x - self.mean;
        self.mean += delta / self.vertices as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn remove_sample(&mut self, x: f64) {
        if self.vertices <= 1 {
            self.vertices = 0;
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let n = self.vertices as f64;
        let old_mean = (n * self.mean - x) / (n - 1.0);
        self.m2 -= (x - self.mean) * (x - old_mean);
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
        self.mean = old_mean;
        self.vertices -= 1;
    }

    pub fn increment(&mut self, vertex: VertexId) {
        let old = self.degree.get(&vertex).copied().unwrap_or(0);
        if old > 0 {
            self.remove_sample(old as f64);
        }
        self.add_sample((old + 1) as f64);
        self.degree.insert(vertex, old + 1);
    }

    pub fn decrement(&mut self, vertex: VertexId) {
        let old = match self.degree.get(&vertex) {
            Some(&d) if d > 0 => d,
            _ => return,
        };
        self.remove_sample(old as f64);
        if old == 1 {
            self.degree.remove(&vertex);
        } else {
            self.add_sample((old - 1) as f64);
            self.degree.insert(vertex, old - 1);
        }
    }

    pub fn density(&self, vertex: VertexId) -> usize {
        self.degree.get(&vertex).copied().unwrap_or(0)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        if self.vertices == 0 {
            return 0.0;
        }
        (self.m2 / self.vertices as f64).sqrt()
    }

    pub fn zscore(&self, vertex: VertexId) -> f64 {
        let std_dev = self.std_dev();
        if std_dev < f64::EPSILON {
            return 0.0;
        }
        (self.density(vertex) as f64 - self.mean) / std_dev
    }
}

/// Read access the pattern matcher needs from a graph.
pub trait GraphView {
    fn successors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge>;
    fn predecessors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge>;
    fn find_edge(&self, key: &EdgeKey) -> Option<&StreamEdge>;
}

#[derive(Debug, Clone, Default)]
pub struct StreamingGraph {
    slots: Vec<Option<EdgeSlot>>,
    free: Vec<EdgeId>,
    by_key: FxHashMap<EdgeKey, EdgeId>,
    out_adj: FxHashMap<VertexId, Vec<EdgeId>>,
    in_adj: FxHashMap<VertexId, Vec<EdgeId>>,
    head: Option<EdgeId>,
    tail: Option<EdgeId>,
    density: DensityStats,
}

impl StreamingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new edge at the arrival tail. Returns `None` when an edge
    /// with the same `(src, dst, label)` is already live; the caller then
    /// looks it up with [`find`](Self::find) and applies
    /// [`refresh`](Self::refresh).
    pub fn insert(
        &mut self,
        id: u64,
        src: VertexId,
        dst: VertexId,
        label: Label,
        timestamp: Timestamp,
        expiration: Timestamp,
    ) -> Option<EdgeId> {
        let key = EdgeKey::new(src, dst, label);
        if self.by_key.contains_key(&key) {
            return None;
        }

        let slot = EdgeSlot {
            edge: StreamEdge::new(id, src, dst, label, timestamp, expiration),
            prev: None,
            next: None,
        };
        let edge_id = match self.free.pop() {
            Some(reused) => {
                self.slots[reused.index()] = Some(slot);
                reused
            }
            None => {
                self.slots.push(Some(slot));
                EdgeId((self.slots.len() - 1) as u32)
            }
        };

        self.by_key.insert(key, edge_id);
        self.out_adj.entry(src).or_default().push(edge_id);
        self.in_adj.entry(dst).or_default().push(edge_id);
        self.link_tail(edge_id);
        self.density.increment(src);

        Some(edge_id)
    }

    /// Looks up the live edge carrying `key` (`search_existing_edge`).
    pub fn find(&self, key: &EdgeKey) -> Option<EdgeId> {
        self.by_key.get(key).copied()
    }

    pub fn edge(&self, id: EdgeId) -> Option<&StreamEdge> {
        self.slot(id).map(|s| &s.edge)
    }

    /// Applies an identity-collision update: new timestamp and expiration,
    /// and the edge moves to the arrival tail so eviction order stays right.
    pub fn refresh(&mut self, id: EdgeId, timestamp: Timestamp, expiration: Timestamp) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        slot.edge.timestamp = timestamp;
        slot.edge.expiration = expiration;
        self.unlink(id);
        self.link_tail(id);
        true
    }

    /// Deletes an edge from adjacency, the arrival list and the density
    /// statistics.
    pub fn remove(&mut self, src: VertexId, dst: VertexId, label: Label) -> Option<StreamEdge> {
        let id = self.find(&EdgeKey::new(src, dst, label))?;
        self.remove_id(id)
    }

    fn remove_id(&mut self, id: EdgeId) -> Option<StreamEdge> {
        let edge = self.slot(id)?.edge.clone();
        self.unlink(id);

        self.by_key.remove(&edge.key());
        detach_from(&mut self.out_adj, edge.src, id);
        detach_from(&mut self.in_adj, edge.dst, id);
        self.density.decrement(edge.src);

        self.slots[id.index()] = None;
        self.free.push(id);
        Some(edge)
    }

    /// Walks the arrival list from `start` (the head when `None`), deleting
    /// every edge whose expiration is `<= now`. With a `stop_at` bound the
    /// walk covers the whole range up to it; without one it ends at the first
    /// edge that has not expired yet. Edges `retention` defers are relinked
    /// after the entry it names and expire together with it, which keeps the
    /// list ordered by expiration.
    pub fn expire(
        &mut self,
        now: Timestamp,
        start: Option<EdgeId>,
        stop_at: Option<EdgeId>,
        retention: &mut dyn Retention,
    ) -> Vec<StreamEdge> {
        let mut deleted = Vec::new();
        let mut cursor = start.or(self.head);

        while let Some(id) = cursor {
            if Some(id) == stop_at {
                break;
            }
            let Some(slot) = self.slot(id) else {
                break;
            };
            let next = slot.next;
            if slot.edge.expiration > now {
                // deferred edges can sit inside a bounded range
                if stop_at.is_some() {
                    cursor = next;
                    continue;
                }
                break;
            }
            let edge = slot.edge.clone();
            let zscore = self.density.zscore(edge.src);

            let anchor = retention
                .defer(&edge, zscore, now)
                .filter(|deferral| deferral.after != id)
                .and_then(|deferral| {
                    let expiration = self.edge(deferral.after)?.expiration;
                    (expiration > now).then_some((deferral.after, expiration))
                });
            match anchor {
                Some((after, expiration)) => self.shift_timed_edge(id, after, expiration),
                None => {
                    if let Some(removed) = self.remove_id(id) {
                        deleted.push(removed);
                    }
                }
            }
            cursor = next;
        }

        deleted
    }

    /// Moves `id` right after `after` in the arrival list and gives it a new
    /// expiration.
    pub fn shift_timed_edge(&mut self, id: EdgeId, after: EdgeId, expiration: Timestamp) {
        if self.slot(after).is_none() {
            return;
        }
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        slot.edge.expiration = expiration;
        if id == after {
            return;
        }

        self.unlink(id);
        let after_next = self.slot(after).and_then(|s| s.next);
        if let Some(slot) = self.slot_mut(id) {
            slot.prev = Some(after);
            slot.next = after_next;
        }
        if let Some(slot) = self.slot_mut(after) {
            slot.next = Some(id);
        }
        match after_next {
            Some(n) => {
                if let Some(slot) = self.slot_mut(n) {
                    slot.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
    }

    /// All live outgoing edges of `vertex` (`get_all_suc`).
    pub fn successors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge> {
        self.out_adj
            .get(&vertex)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edge(*id))
    }

    pub fn predecessors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge> {
        self.in_adj
            .get(&vertex)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edge(*id))
    }

    pub fn head(&self) -> Option<EdgeId> {
        self.head
    }

    pub fn tail(&self) -> Option<EdgeId> {
        self.tail
    }

    pub fn next_of(&self, id: EdgeId) -> Option<EdgeId> {
        self.slot(id).and_then(|s| s.next)
    }

    pub fn prev_of(&self, id: EdgeId) -> Option<EdgeId> {
        self.slot(id).and_then(|s| s.prev)
    }

    /// Live edges from the head (next to expire) to the tail.
    pub fn arrival_order(&self) -> ArrivalOrder<'_> {
        ArrivalOrder {
            graph: self,
            cursor: self.head,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Vertices with at least one live outgoing edge.
    pub fn vertex_count(&self) -> usize {
        self.out_adj.len()
    }

    pub fn density(&self, vertex: VertexId) -> usize {
        self.density.density(vertex)
    }

    pub fn zscore(&self, vertex: VertexId) -> f64 {
        self.density.zscore(vertex)
    }

    pub fn density_stats(&self) -> &DensityStats {
        &self.density
    }

    fn slot(&self, id: EdgeId) -> Option<&EdgeSlot> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: EdgeId) -> Option<&mut EdgeSlot> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn link_tail(&mut self, id: EdgeId) {
        let old_tail = self.tail;
        if let Some(slot) = self.slot_mut(id) {
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(slot) = self.slot_mut(t) {
                    slot.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn unlink(&mut self, id: EdgeId) {
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        let (prev, next) = (slot.prev.take(), slot.next.take());
        match prev {
            Some(p) => {
                if let Some(slot) = self.slot_mut(p) {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slot_mut(n) {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

impl GraphView for StreamingGraph {
    fn successors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge> {
        StreamingGraph::successors(self, vertex)
    }

    fn predecessors(&self, vertex: VertexId) -> impl Iterator<Item = &StreamEdge> {
        StreamingGraph::predecessors(self, vertex)
    }

    fn find_edge(&self, key: &EdgeKey) -> Option<&StreamEdge> {
        self.find(key).and_then(|id| self.edge(id))
    }
}

fn detach_from(index: &mut FxHashMap<VertexId, Vec<EdgeId>>, vertex: VertexId, id: EdgeId) {
    if let Some(ids) = index.get_mut(&vertex) {
        if let Some(pos) = ids.iter().position(|e| *e == id) {
            ids.swap_remove(pos);
        }
        if ids.is_empty() {
            index.remove(&vertex);
        }
    }
}

pub struct ArrivalOrder<'a> {
    graph: &'a StreamingGraph,
    cursor: Option<EdgeId>,
}

impl<'a> Iterator for ArrivalOrder<'a> {
    type Item = &'a StreamEdge;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let slot = self.graph.slot(id)?;
        self.cursor = slot.next;
        Some(&slot.edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(graph: &StreamingGraph) -> Vec<(VertexId, VertexId)> {
        graph.arrival_order().map(|e| (e.src, e.dst)).collect()
    }

    #[test]
    fn test_insert_and_successors() {
        let mut graph = StreamingGraph::new();
        assert!(graph.insert(1, 1, 2, 6, 1, 10).is_some());
        assert!(graph.insert(2, 1, 3, 6, 2, 10).is_some());
        assert!(graph.insert(3, 2, 3, 7, 3, 10).is_some());

        let mut succ: Vec<_> = graph.successors(1).map(|e| e.dst).collect();
        succ.sort();
        assert_eq!(succ, vec![2, 3]);
        assert_eq!(graph.predecessors(3).count(), 2);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(keys(&graph), vec![(1, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn test_identity_collision_and_refresh() {
        let mut graph = StreamingGraph::new();
        graph.insert(1, 1, 2, 6, 1, 10);
        graph.insert(2, 4, 5, 6, 2, 10);
        assert!(graph.insert(3, 1, 2, 6, 7, 15).is_none());

        let id = graph.find(&EdgeKey::new(1, 2, 6)).unwrap();
        assert!(graph.refresh(id, 7, 15));
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.edge(id).unwrap().timestamp, 7);
        assert_eq!(graph.edge(id).unwrap().expiration, 15);
        assert_eq!(keys(&graph), vec![(4, 5), (1, 2)]);
    }

    #[test]
    fn test_remove_unlinks_everywhere() {
        let mut graph = StreamingGraph::new();
        graph.insert(1, 1, 2, 6, 1, 10);
        graph.insert(2, 2, 3, 6, 2, 10);
        graph.insert(3, 3, 4, 6, 3, 10);

        let removed = graph.remove(2, 3, 6).unwrap();
        assert_eq!(removed.id, 2);
        assert!(graph.remove(2, 3, 6).is_none());
        assert_eq!(graph.successors(2).count(), 0);
        assert_eq!(graph.predecessors(3).count(), 0);
        assert_eq!(keys(&graph), vec![(1, 2), (3, 4)]);

        // freed slot is reused
        let id = graph.insert(4, 9, 9, 6, 4, 10).unwrap();
        assert_eq!(id.index(), 1);
        assert_eq!(keys(&graph), vec![(1, 2), (3, 4), (9, 9)]);
    }

    #[test]
    fn test_expire_stops_at_first_live_edge() {
        let mut graph = StreamingGraph::new();
        graph.insert(1, 1, 2, 6, 1, 10);
        graph.insert(2, 2, 3, 6, 2, 10);
        graph.insert(3, 3, 4, 6, 12, 20);

        let deleted = graph.expire(12, None, None, &mut NoRetention);
        assert_eq!(deleted.len(), 2);
        assert_eq!(keys(&graph), vec![(3, 4)]);
        assert!(graph.arrival_order().all(|e| e.expiration > 12));
    }

    #[test]
    fn test_expire_respects_stop_point() {
        let mut graph = StreamingGraph::new();
        graph.insert(1, 1, 2, 6, 1, 10);
        let stop = graph.insert(2, 2, 3, 6, 2, 10).unwrap();

        let deleted = graph.expire(12, None, Some(stop), &mut NoRetention);
        assert_eq!(deleted.len(), 1);
        assert_eq!(keys(&graph), vec![(2, 3)]);
    }

    struct KeepSource(VertexId, EdgeId);

    impl Retention for KeepSource {
        fn defer(&mut self, edge: &StreamEdge, _z: f64, _now: Timestamp) -> Option<Deferral> {
            (edge.src == self.0).then_some(Deferral { after: self.1 })
        }
    }

    #[test]
    fn test_expire_defers_retained_edges() {
        let mut graph = StreamingGraph::new();
        graph.insert(1, 1, 2, 6, 1, 10);
        graph.insert(2, 7, 3, 6, 2, 10);
        let target = graph.insert(3, 3, 4, 6, 12, 20).unwrap();
        graph.insert(4, 4, 5, 6, 13, 20);

        let deleted = graph.expire(12, None, None, &mut KeepSource(7, target));
        assert_eq!(deleted.len(), 1);
        assert_eq!(keys(&graph), vec![(3, 4), (7, 3), (4, 5)]);
        let kept = graph.find(&EdgeKey::new(7, 3, 6)).unwrap();
        assert_eq!(graph.edge(kept).unwrap().expiration, 20);
        assert_eq!(graph.edge(kept).unwrap().timestamp, 2);
        assert_eq!(graph.prev_of(kept), Some(target));

        // the kept edge leaves with the entry it was placed behind
        let deleted = graph.expire(20, None, None, &mut NoRetention);
        assert_eq!(deleted.len(), 3);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_expire_deletes_edge_deferred_behind_expired_entry() {
        let mut graph = StreamingGraph::new();
        let anchor = graph.insert(1, 1, 2, 6, 1, 10).unwrap();
        graph.insert(2, 7, 3, 6, 2, 10);
        graph.insert(3, 3, 4, 6, 12, 20);

        let deleted = graph.expire(12, None, None, &mut KeepSource(7, anchor));
        assert_eq!(deleted.len(), 2);
        assert_eq!(keys(&graph), vec![(3, 4)]);
    }

    #[test]
    fn test_density_zscore() {
        let mut graph = StreamingGraph::new();
        for (i, dst) in (2..=7).enumerate() {
            graph.insert(i as u64, 1, dst, 6, 1, 10);
        }
        graph.insert(10, 8, 9, 6, 1, 10);
        graph.insert(11, 9, 8, 6, 1, 10);

        // degrees {1: 6, 8: 1, 9: 1}
        let stats = graph.density_stats();
        assert!((stats.mean() - 8.0 / 3.0).abs() < 1e-9);
        assert!(graph.zscore(1) > 1.0);
        assert!(graph.zscore(8) < 0.0);

        for dst in 2..=7 {
            graph.remove(1, dst, 6);
        }
        // degrees {8: 1, 9: 1}
        assert!((graph.density_stats().mean() - 1.0).abs() < 1e-9);
        assert_eq!(graph.zscore(8), 0.0);
        assert_eq!(graph.density(1), 0);
    }
}
