//! Per-root spanning trees over `(vertex, state)` pairs.
//!
//! All nodes of all trees share one arena. A tree is identified by the vertex
//! it is rooted at and indexes its own nodes by `(vertex, state)`, which makes
//! a duplicate reachability claim unrepresentable. The forest also keeps the
//! reverse index `vertex -> {(tree, node)}` so the trees touching a vertex can
//! be found without scanning every tree.

use crate::automaton::INITIAL_STATE;
use crate::error::{Result, RpqError};
use crate::streaming_graph::{EdgeKey, StreamEdge};
use crate::{State, Timestamp, VertexId};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The stream edge a node was derived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    pub edge: EdgeKey,
    pub edge_id: u64,
    pub timestamp: Timestamp,
    pub expiration: Timestamp,
}

impl Derivation {
    pub fn of(edge: &StreamEdge) -> Self {
        Self {
            edge: edge.key(),
            edge_id: edge.id,
            timestamp: edge.timestamp,
            expiration: edge.expiration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForestNode {
    pub vertex: VertexId,
    pub state: State,
    /// Root vertex of the owning tree.
    pub tree: VertexId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// `None` only for roots.
    pub derivation: Option<Derivation>,
    /// Path timestamp.
    pub timestamp: Timestamp,
    /// Smallest expiration along the path from the root.
    pub valid_until: Timestamp,
}

/// A node about to be grafted under an existing parent.
#[derive(Debug, Clone, Copy)]
pub struct Claim {
    pub vertex: VertexId,
    pub state: State,
    pub derivation: Derivation,
    pub timestamp: Timestamp,
    pub valid_until: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemovedNode {
    pub tree: VertexId,
    pub vertex: VertexId,
    pub state: State,
}

#[derive(Debug, Clone)]
pub struct Tree {
    root: NodeId,
    index: FxHashMap<(VertexId, State), NodeId>,
}

impl Tree {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Forest {
    nodes: Vec<Option<ForestNode>>,
    free: Vec<NodeId>,
    trees: FxHashMap<VertexId, Tree>,
    vertex_trees: FxHashMap<VertexId, FxHashSet<(VertexId, NodeId)>>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tree rooted at `(root, INITIAL_STATE)`. Returns `false` when
    /// the vertex already roots a tree.
    pub fn add_tree(&mut self, root: VertexId, timestamp: Timestamp) -> bool {
        if self.trees.contains_key(&root) {
            return false;
        }
        let id = self.alloc(ForestNode {
            vertex: root,
            state: INITIAL_STATE,
            tree: root,
            parent: None,
            children: Vec::new(),
            derivation: None,
            timestamp,
            valid_until: Timestamp::MAX,
        });
        let mut index = FxHashMap::default();
        index.insert((root, INITIAL_STATE), id);
        self.trees.insert(root, Tree { root: id, index });
        self.vertex_trees.entry(root).or_default().insert((root, id));
        true
    }

    /// Grafts `claim` under the node `parent` of tree `tree`. Returns `None`
    /// without mutating anything when the parent is not in the tree or the
    /// tree already holds `(claim.vertex, claim.state)`.
    pub fn add_child_to_parent(
        &mut self,
        tree: VertexId,
        parent: (VertexId, State),
        claim: Claim,
    ) -> Option<NodeId> {
        let t = self.trees.get(&tree)?;
        let parent_id = *t.index.get(&parent)?;
        if t.index.contains_key(&(claim.vertex, claim.state)) {
            return None;
        }

        let id = self.alloc(ForestNode {
            vertex: claim.vertex,
            state: claim.state,
            tree,
            parent: Some(parent_id),
            children: Vec::new(),
            derivation: Some(claim.derivation),
            timestamp: claim.timestamp,
            valid_until: claim.valid_until,
        });
        if let Some(p) = self.node_mut(parent_id) {
            p.children.push(id);
        }
        if let Some(t) = self.trees.get_mut(&tree) {
            t.index.insert((claim.vertex, claim.state), id);
        }
        self.vertex_trees
            .entry(claim.vertex)
            .or_default()
            .insert((tree, id));
        Some(id)
    }

    pub fn find_node_in_tree(
        &self,
        tree: VertexId,
        vertex: VertexId,
        state: State,
    ) -> Option<NodeId> {
        self.trees.get(&tree)?.index.get(&(vertex, state)).copied()
    }

    /// Roots of every tree holding a node `(vertex, state)`.
    pub fn find_trees_with_node(&self, vertex: VertexId, state: State) -> Vec<VertexId> {
        let Some(holders) = self.vertex_trees.get(&vertex) else {
            return Vec::new();
        };
        let mut roots: Vec<VertexId> = holders
            .iter()
            .filter(|(_, id)| self.node(*id).is_some_and(|n| n.state == state))
            .map(|(tree, _)| *tree)
            .collect();
        roots.sort_unstable();
        roots
    }

    pub fn node(&self, id: NodeId) -> Option<&ForestNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn has_tree(&self, root: VertexId) -> bool {
        self.trees.contains_key(&root)
    }

    pub fn tree(&self, root: VertexId) -> Option<&Tree> {
        self.trees.get(&root)
    }

    /// Deletes every node supported by one of `expired` together with its
    /// subtree. Only trees holding an expired edge's destination vertex are
    /// inspected. Roots left without children are kept so the caller can try
    /// to re-derive the lost claims first; see
    /// [`prune_childless_roots`](Self::prune_childless_roots).
    pub fn expire(&mut self, expired: &[StreamEdge]) -> Vec<RemovedNode> {
        let expired_keys: FxHashSet<EdgeKey> = expired.iter().map(StreamEdge::key).collect();
        let mut removed = Vec::new();

        for edge in expired {
            let Some(holders) = self.vertex_trees.get(&edge.dst) else {
                continue;
            };
            let candidates: Vec<(VertexId, NodeId)> = holders.iter().copied().collect();

            for (tree, id) in candidates {
                let supported_by_expired = self.node(id).is_some_and(|n| {
                    n.tree == tree
                        && n.derivation
                            .is_some_and(|d| expired_keys.contains(&d.edge))
                });
                if supported_by_expired {
                    self.remove_subtree(tree, id, &mut removed);
                }
            }
        }

        removed
    }

    /// Deletes the trees among `roots` whose root has no children left.
    /// Returns the deleted roots.
    pub fn prune_childless_roots<I>(&mut self, roots: I) -> Vec<VertexId>
    where
        I: IntoIterator<Item = VertexId>,
    {
        let mut pruned = Vec::new();
        for root in roots {
            let childless = self
                .trees
                .get(&root)
                .and_then(|t| self.node(t.root))
                .is_some_and(|n| n.children.is_empty());
            if childless && self.remove_tree(root) {
                pruned.push(root);
            }
        }
        pruned
    }

    /// Deletes a whole tree. Returns `false` if no tree roots at `root`.
    pub fn remove_tree(&mut self, root: VertexId) -> bool {
        let Some(tree) = self.trees.remove(&root) else {
            return false;
        };
        for (&(vertex, _), &id) in &tree.index {
            self.release(id);
            forget(&mut self.vertex_trees, vertex, root, id);
        }
        true
    }

    /// Moves `node` under `new_parent` (same tree), records the new
    /// derivation and recomputes the path timestamps of the moved subtree as
    /// minima along the path. Returns the moved nodes, or `None` when the move
    /// is impossible (different trees, a root, or a parent inside the
    /// subtree).
    pub fn reparent(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        derivation: Derivation,
        timestamp: Timestamp,
        valid_until: Timestamp,
    ) -> Option<Vec<NodeId>> {
        let (tree, old_parent) = {
            let n = self.node(node)?;
            (n.tree, n.parent?)
        };
        if self.node(new_parent)?.tree != tree {
            return None;
        }
        let mut cursor = Some(new_parent);
        while let Some(c) = cursor {
            if c == node {
                return None;
            }
            cursor = self.node(c).and_then(|n| n.parent);
        }

        if let Some(p) = self.node_mut(old_parent) {
            p.children.retain(|c| *c != node);
        }
        if let Some(p) = self.node_mut(new_parent) {
            p.children.push(node);
        }
        if let Some(n) = self.node_mut(node) {
            n.parent = Some(new_parent);
            n.derivation = Some(derivation);
            n.timestamp = timestamp;
            n.valid_until = valid_until;
        }

        let mut moved = vec![node];
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(parent) = self.node(id) else {
                continue;
            };
            let (ts, vu) = (parent.timestamp, parent.valid_until);
            let children = parent.children.clone();
            for child in children {
                if let Some(c) = self.node_mut(child) {
                    if let Some(d) = c.derivation {
                        c.timestamp = ts.min(d.timestamp);
                        c.valid_until = vu.min(d.expiration);
                    }
                    moved.push(child);
                    stack.push(child);
                }
            }
        }
        Some(moved)
    }

    /// Independent copy of the whole forest, used as a replay base for late
    /// edges.
    pub fn deep_copy(&self) -> Forest {
        self.clone()
    }

    /// Checks the structural invariants: one node per `(vertex, state)` per
    /// tree, parent/child symmetry, and agreement of the reverse index.
    pub fn verify_integrity(&self) -> Result<()> {
        let corrupt = |msg: String| Err(RpqError::CorruptForest(msg));
        let mut indexed = 0usize;

        for (&root, tree) in &self.trees {
            match self.node(tree.root) {
                Some(n) if n.parent.is_none() && n.vertex == root && n.state == INITIAL_STATE => {}
                _ => return corrupt(format!("tree {root} has an invalid root node")),
            }
            for (&(vertex, state), &id) in &tree.index {
                indexed += 1;
                let Some(n) = self.node(id) else {
                    return corrupt(format!(
                        "tree {root} indexes a dead node for ({vertex}, {state})"
                    ));
                };
                if n.vertex != vertex || n.state != state || n.tree != root {
                    return corrupt(format!("tree {root} index entry ({vertex}, {state}) is stale"));
                }
                if let Some(p) = n.parent {
                    let linked = self
                        .node(p)
                        .is_some_and(|pn| pn.tree == root && pn.children.contains(&id));
                    if !linked {
                        return corrupt(format!(
                            "node ({vertex}, {state}) of tree {root} is not a child of its parent"
                        ));
                    }
                } else if id != tree.root {
                    return corrupt(format!(
                        "node ({vertex}, {state}) of tree {root} has no parent"
                    ));
                }
                for c in &n.children {
                    if self.node(*c).and_then(|cn| cn.parent) != Some(id) {
                        return corrupt(format!(
                            "child of ({vertex}, {state}) in tree {root} points elsewhere"
                        ));
                    }
                }
                let reverse = self
                    .vertex_trees
                    .get(&vertex)
                    .is_some_and(|h| h.contains(&(root, id)));
                if !reverse {
                    return corrupt(format!(
                        "reverse index misses ({vertex}, {state}) of tree {root}"
                    ));
                }
            }
        }

        let live = self.nodes.iter().flatten().count();
        if live != indexed {
            return corrupt(format!("{live} live nodes but {indexed} indexed"));
        }
        let reverse_entries: usize = self.vertex_trees.values().map(FxHashSet::len).sum();
        if reverse_entries != indexed {
            return corrupt(format!("{reverse_entries} reverse entries but {indexed} indexed"));
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Approximate heap usage in bytes.
    pub fn memory_footprint(&self) -> usize {
        use std::mem::size_of;
        let arena = self.nodes.capacity() * size_of::<Option<ForestNode>>()
            + self.free.capacity() * size_of::<NodeId>();
        let children: usize = self
            .nodes
            .iter()
            .flatten()
            .map(|n| n.children.capacity() * size_of::<NodeId>())
            .sum();
        let indexes: usize = self
            .trees
            .values()
            .map(|t| t.index.capacity() * (size_of::<(VertexId, State)>() + size_of::<NodeId>()))
            .sum();
        let reverse: usize = self
            .vertex_trees
            .values()
            .map(|h| h.capacity() * size_of::<(VertexId, NodeId)>())
            .sum();
        arena + children + indexes + reverse
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut ForestNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: ForestNode) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.index()] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<ForestNode> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.free.push(id);
        Some(node)
    }

    fn remove_subtree(&mut self, tree: VertexId, start: NodeId, removed: &mut Vec<RemovedNode>) {
        if let Some(parent) = self.node(start).and_then(|n| n.parent) {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != start);
            }
        }

        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(node) = self.release(id) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            if let Some(t) = self.trees.get_mut(&tree) {
                t.index.remove(&(node.vertex, node.state));
            }
            forget(&mut self.vertex_trees, node.vertex, tree, id);
            removed.push(RemovedNode {
                tree,
                vertex: node.vertex,
                state: node.state,
            });
        }
    }
}

fn forget(
    vertex_trees: &mut FxHashMap<VertexId, FxHashSet<(VertexId, NodeId)>>,
    vertex: VertexId,
    tree: VertexId,
    id: NodeId,
) {
    if let Some(holders) = vertex_trees.get_mut(&vertex) {
        holders.remove(&(tree, id));
        if holders.is_empty() {
            vertex_trees.remove(&vertex);
        }
    }
}
