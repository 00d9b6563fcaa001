use crate::automaton::{Automaton, INITIAL_STATE};
use crate::forest::{Claim, Derivation, Forest, RemovedNode};
use crate::result_set::{ResultEvent, ResultPair, ResultSet, StreamType};
use crate::streaming_graph::{GraphView, StreamEdge};
use crate::{State, Timestamp, VertexId};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// How a new derivation of an already claimed `(vertex, state)` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraftPolicy {
    /// The first derivation keeps the node; a node's timestamp is the latest
    /// edge timestamp along its path.
    #[default]
    FirstClaim,
    /// A node's timestamp is the oldest edge timestamp along its path, and a
    /// node moves under any parent that gives it a newer one.
    Reparent,
}

impl GraftPolicy {
    fn root_timestamp(self) -> Timestamp {
        match self {
            GraftPolicy::FirstClaim => Timestamp::MIN,
            GraftPolicy::Reparent => Timestamp::MAX,
        }
    }

    fn extend(self, path: Timestamp, edge: Timestamp) -> Timestamp {
        match self {
            GraftPolicy::FirstClaim => path.max(edge),
            GraftPolicy::Reparent => path.min(edge),
        }
    }

    /// Ordering key used to pick between alternative parents.
    fn rank(self, timestamp: Timestamp, valid_until: Timestamp) -> (Timestamp, Timestamp) {
        match self {
            GraftPolicy::FirstClaim => (valid_until, timestamp),
            GraftPolicy::Reparent => (timestamp, valid_until),
        }
    }
}

/// A pending graft: `derivation` leads from `(parent)` to its destination in
/// `state`.
#[derive(Debug, Clone, Copy)]
struct Step {
    parent: (VertexId, State),
    derivation: Derivation,
    state: State,
}

/// Incremental RPQ evaluation over a forest of spanning trees.
///
/// Generic over [`GraphView`] so the same code runs on the live graph and on
/// the copies used to replay late edges.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    automaton: Arc<Automaton>,
    policy: GraftPolicy,
}

impl PatternMatcher {
    pub fn new(automaton: Arc<Automaton>, policy: GraftPolicy) -> Self {
        Self { automaton, policy }
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn policy(&self) -> GraftPolicy {
        self.policy
    }

    /// Grows every tree that can use `edge`, which must already be in
    /// `graph`. Returns the result changes.
    pub fn process_edge<G: GraphView>(
        &self,
        graph: &G,
        forest: &mut Forest,
        results: &mut ResultSet,
        edge: &StreamEdge,
        now: Timestamp,
    ) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        if !self.automaton.accepts_label(edge.label) {
            return events;
        }
        let derivation = Derivation::of(edge);

        for &(sb, sd) in self.automaton.transitions_on(edge.label) {
            let created =
                sb == INITIAL_STATE && forest.add_tree(edge.src, self.policy.root_timestamp());

            for tree in forest.find_trees_with_node(edge.src, sb) {
                let step = Step {
                    parent: (edge.src, sb),
                    derivation,
                    state: sd,
                };
                self.propagate(graph, forest, results, tree, step, now, &mut events);
            }

            // a self-loop back to the root adds nothing
            let childless = forest
                .tree(edge.src)
                .and_then(|t| forest.node(t.root()))
                .is_some_and(|root| root.children.is_empty());
            if created && childless {
                forest.remove_tree(edge.src);
            }
        }

        events
    }

    /// Re-derives claims lost to edge expiry from live in-edges whose source
    /// is still claimed in the same tree, then brings the results of the
    /// affected pairs in line with the surviving final-state nodes.
    pub fn repair<G: GraphView>(
        &self,
        graph: &G,
        forest: &mut Forest,
        results: &mut ResultSet,
        lost: &[RemovedNode],
        now: Timestamp,
    ) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        let mut lost: Vec<RemovedNode> = lost.to_vec();
        lost.sort_unstable();
        lost.dedup();

        for claim in &lost {
            if !forest.has_tree(claim.tree)
                || forest
                    .find_node_in_tree(claim.tree, claim.vertex, claim.state)
                    .is_some()
            {
                continue;
            }
            if let Some(step) = self.best_parent(graph, forest, claim) {
                debug!(
                    "Re-deriving ({}, {}) in tree {} through ({}, {})",
                    claim.vertex, claim.state, claim.tree, step.parent.0, step.parent.1
                );
                self.propagate(graph, forest, results, claim.tree, step, now, &mut events);
            }
        }

        let lost_pairs: FxHashSet<ResultPair> = lost
            .iter()
            .filter(|c| c.tree != c.vertex && self.automaton.is_final(c.state))
            .map(|c| ResultPair::new(c.tree, c.vertex))
            .collect();
        let mut lost_pairs: Vec<ResultPair> = lost_pairs.into_iter().collect();
        lost_pairs.sort_unstable();

        for pair in lost_pairs {
            let surviving = self
                .automaton
                .final_states()
                .filter_map(|f| forest.find_node_in_tree(pair.source, pair.destination, f))
                .filter_map(|id| forest.node(id))
                .map(|n| (n.timestamp, n.valid_until))
                .max();

            match surviving {
                Some((ts, valid_until)) => {
                    if results.live_timestamp(&pair) != Some(ts) {
                        results.set(pair, ts, now);
                        events.push(ResultEvent {
                            stream: StreamType::IStream,
                            pair,
                            timestamp: ts,
                            valid_until,
                        });
                    }
                }
                None => {
                    if let Some(ts) = results.remove(&pair, now) {
                        events.push(ResultEvent {
                            stream: StreamType::DStream,
                            pair,
                            timestamp: ts,
                            valid_until: now,
                        });
                    }
                }
            }
        }

        events
    }

    fn best_parent<G: GraphView>(
        &self,
        graph: &G,
        forest: &Forest,
        claim: &RemovedNode,
    ) -> Option<Step> {
        let mut best: Option<((Timestamp, Timestamp), Step)> = None;

        for edge in graph.predecessors(claim.vertex) {
            for &(sb, sd) in self.automaton.transitions_on(edge.label) {
                if sd != claim.state {
                    continue;
                }
                let Some(parent) = forest
                    .find_node_in_tree(claim.tree, edge.src, sb)
                    .and_then(|id| forest.node(id))
                else {
                    continue;
                };
                let rank = self.policy.rank(
                    self.policy.extend(parent.timestamp, edge.timestamp),
                    parent.valid_until.min(edge.expiration),
                );
                if best.as_ref().is_none_or(|(r, _)| rank > *r) {
                    let step = Step {
                        parent: (edge.src, sb),
                        derivation: Derivation::of(edge),
                        state: sd,
                    };
                    best = Some((rank, step));
                }
            }
        }

        best.map(|(_, step)| step)
    }

    /// Breadth-first growth of one tree from a single pending graft.
    #[allow(clippy::too_many_arguments)]
    fn propagate<G: GraphView>(
        &self,
        graph: &G,
        forest: &mut Forest,
        results: &mut ResultSet,
        tree: VertexId,
        seed: Step,
        now: Timestamp,
        events: &mut Vec<ResultEvent>,
    ) {
        let mut queue = VecDeque::from([seed]);
        let mut visited: FxHashSet<(VertexId, State)> = FxHashSet::default();

        while let Some(step) = queue.pop_front() {
            let (parent_vertex, parent_state) = step.parent;
            let Some(parent_id) = forest.find_node_in_tree(tree, parent_vertex, parent_state)
            else {
                continue;
            };
            let Some(parent) = forest.node(parent_id) else {
                continue;
            };
            let vertex = step.derivation.edge.dst;
            let timestamp = self.policy.extend(parent.timestamp, step.derivation.timestamp);
            let valid_until = parent.valid_until.min(step.derivation.expiration);

            let expand = match forest.find_node_in_tree(tree, vertex, step.state) {
                None => {
                    let claim = Claim {
                        vertex,
                        state: step.state,
                        derivation: step.derivation,
                        timestamp,
                        valid_until,
                    };
                    if forest.add_child_to_parent(tree, step.parent, claim).is_none() {
                        continue;
                    }
                    if self.automaton.is_final(step.state) {
                        self.report(results, tree, vertex, timestamp, valid_until, now, events);
                    }
                    true
                }
                Some(existing) => {
                    let improves = self.policy == GraftPolicy::Reparent
                        && forest.node(existing).is_some_and(|n| timestamp > n.timestamp);
                    if !improves {
                        false
                    } else if let Some(moved) = forest.reparent(
                        existing,
                        parent_id,
                        step.derivation,
                        timestamp,
                        valid_until,
                    ) {
                        for id in moved {
                            if let Some(n) = forest.node(id)
                                && self.automaton.is_final(n.state)
                            {
                                let (v, ts, vu) = (n.vertex, n.timestamp, n.valid_until);
                                self.report(results, tree, v, ts, vu, now, events);
                            }
                        }
                        true
                    } else {
                        false
                    }
                }
            };

            if expand && visited.insert((vertex, step.state)) {
                for next in graph.successors(vertex) {
                    if let Some(state) = self.automaton.next_state(step.state, next.label) {
                        queue.push_back(Step {
                            parent: (vertex, step.state),
                            derivation: Derivation::of(next),
                            state,
                        });
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        results: &mut ResultSet,
        tree: VertexId,
        vertex: VertexId,
        timestamp: Timestamp,
        valid_until: Timestamp,
        now: Timestamp,
        events: &mut Vec<ResultEvent>,
    ) {
        let pair = ResultPair::new(tree, vertex);
        if results.upsert(pair, timestamp, now) {
            events.push(ResultEvent {
                stream: StreamType::IStream,
                pair,
                timestamp,
                valid_until,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming_graph::StreamingGraph;

    fn insert(
        graph: &mut StreamingGraph,
        src: VertexId,
        dst: VertexId,
        label: u32,
        t: Timestamp,
    ) -> StreamEdge {
        let id = graph.insert(t as u64, src, dst, label, t, t + 10).unwrap();
        graph.edge(id).unwrap().clone()
    }

    fn matcher_for(query_type: u32, labels: &[u32], policy: GraftPolicy) -> PatternMatcher {
        PatternMatcher::new(
            Arc::new(Automaton::from_query_type(query_type, labels).unwrap()),
            policy,
        )
    }

    fn empty_state() -> (StreamingGraph, Forest, ResultSet) {
        (StreamingGraph::new(), Forest::new(), ResultSet::new())
    }

    fn pairs(results: &ResultSet) -> Vec<(VertexId, VertexId, Timestamp)> {
        results
            .sorted()
            .into_iter()
            .map(|(p, ts)| (p.source, p.destination, ts))
            .collect()
    }

    #[test]
    fn test_kleene_star_chain() {
        let matcher = matcher_for(1, &[6], GraftPolicy::FirstClaim);
        let (mut graph, mut forest, mut results) = empty_state();

        let e = insert(&mut graph, 1, 2, 6, 1);
        matcher.process_edge(&graph, &mut forest, &mut results, &e, 1);
        let e = insert(&mut graph, 2, 3, 6, 2);
        let events = matcher.process_edge(&graph, &mut forest, &mut results, &e, 2);

        assert_eq!(pairs(&results), vec![(1, 2, 1), (1, 3, 2), (2, 3, 2)]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.stream == StreamType::IStream));
        forest.verify_integrity().unwrap();
    }

    #[test]
    fn test_edge_before_prefix_is_picked_up() {
        // ab*: the b edge arrives first
        let matcher = matcher_for(3, &[1, 2], GraftPolicy::FirstClaim);
        let (mut graph, mut forest, mut results) = empty_state();

        let b = insert(&mut graph, 2, 3, 2, 1);
        matcher.process_edge(&graph, &mut forest, &mut results, &b, 1);
        assert!(results.is_empty());
        assert_eq!(forest.tree_count(), 0);

        let a = insert(&mut graph, 1, 2, 1, 2);
        matcher.process_edge(&graph, &mut forest, &mut results, &a, 2);
        assert_eq!(pairs(&results), vec![(1, 2, 2), (1, 3, 2)]);
    }

    #[test]
    fn test_cycle_terminates() {
        let matcher = matcher_for(1, &[6], GraftPolicy::FirstClaim);
        let (mut graph, mut forest, mut results) = empty_state();

        for (s, d, t) in [(1, 2, 1), (2, 3, 2), (3, 1, 3)] {
            let e = insert(&mut graph, s, d, 6, t);
            matcher.process_edge(&graph, &mut forest, &mut results, &e, t);
        }
        // every vertex reaches the two others, self-pairs excluded
        assert_eq!(results.len(), 6);
        assert_eq!(forest.tree_count(), 3);
        forest.verify_integrity().unwrap();

        let e = insert(&mut graph, 4, 4, 6, 4);
        matcher.process_edge(&graph, &mut forest, &mut results, &e, 4);
        assert!(!forest.has_tree(4));
    }

    #[test]
    fn test_repair_uses_alternative_path() {
        let matcher = matcher_for(1, &[6], GraftPolicy::FirstClaim);
        let (mut graph, mut forest, mut results) = empty_state();

        // 1 -> 2 -> 4 and 1 -> 3 -> 4
        for (s, d, t) in [(1, 2, 1), (2, 4, 2), (1, 3, 3), (3, 4, 4)] {
            let e = insert(&mut graph, s, d, 6, t);
            matcher.process_edge(&graph, &mut forest, &mut results, &e, t);
        }
        assert_eq!(results.get(&ResultPair::new(1, 4)), Some(2));

        let expired = vec![graph.remove(1, 2, 6).unwrap()];
        let lost = forest.expire(&expired);
        let events = matcher.repair(&graph, &mut forest, &mut results, &lost, 11);

        assert_eq!(results.get(&ResultPair::new(1, 4)), Some(4));
        assert!(!results.contains(&ResultPair::new(1, 2)));
        let has = |stream: StreamType, pair: ResultPair| {
            events.iter().any(|e| e.stream == stream && e.pair == pair)
        };
        assert!(has(StreamType::DStream, ResultPair::new(1, 2)));
        assert!(has(StreamType::IStream, ResultPair::new(1, 4)));
        forest.verify_integrity().unwrap();
    }

    #[test]
    fn test_reparent_policy_keeps_freshest_path() {
        let matcher = matcher_for(1, &[6], GraftPolicy::Reparent);
        let (mut graph, mut forest, mut results) = empty_state();

        // old path 1 -> 2 -> 3, then a fresh shortcut 1 -> 3
        for (s, d, t) in [(1, 2, 1), (2, 3, 2), (1, 3, 5)] {
            let e = insert(&mut graph, s, d, 6, t);
            matcher.process_edge(&graph, &mut forest, &mut results, &e, t);
        }
        assert_eq!(results.get(&ResultPair::new(1, 3)), Some(5));
        let node = forest.find_node_in_tree(1, 3, 0).unwrap();
        let parent = forest.node(node).unwrap().parent.unwrap();
        assert_eq!(forest.node(parent).unwrap().vertex, 1);
        forest.verify_integrity().unwrap();
    }
}
