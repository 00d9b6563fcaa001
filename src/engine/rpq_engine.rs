use crate::automaton::Automaton;
use crate::config::EngineConfig;
use crate::engine::matcher::PatternMatcher;
use crate::engine::recovery::{LateEdge, OutOfOrderRecovery};
use crate::error::{Result, RpqError};
use crate::forest::Forest;
use crate::result_set::{ResultEvent, ResultSet, StreamType};
use crate::streaming_graph::{EdgeKey, StreamingGraph};
use crate::windowing::{EvictionPlan, RetentionPolicy, WindowManager};
use crate::{Label, Timestamp, VertexId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, mpsc};
use std::thread;
use tracing::debug;

/// Callback type for result emission
pub type ResultCallback = Arc<dyn Fn(&ResultEvent) + Send + Sync>;

/// What happened to one input edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// The label is not used by the query.
    Discarded,
    Inserted { events: Vec<ResultEvent> },
    /// Same `(src, dst, label)` as a live edge, whose timestamp was updated.
    Refreshed { events: Vec<ResultEvent> },
    /// Late edge replayed within the watermark.
    Recovered { events: Vec<ResultEvent> },
    /// Late edge beyond the watermark.
    Dropped,
}

impl EdgeOutcome {
    pub fn events(&self) -> &[ResultEvent] {
        match self {
            EdgeOutcome::Inserted { events }
            | EdgeOutcome::Refreshed { events }
            | EdgeOutcome::Recovered { events } => events,
            EdgeOutcome::Discarded | EdgeOutcome::Dropped => &[],
        }
    }

    pub fn into_events(self) -> Vec<ResultEvent> {
        match self {
            EdgeOutcome::Inserted { events }
            | EdgeOutcome::Refreshed { events }
            | EdgeOutcome::Recovered { events } => events,
            EdgeOutcome::Discarded | EdgeOutcome::Dropped => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub edges_seen: usize,
    pub edges_processed: usize,
    pub edges_discarded: usize,
    pub edges_refreshed: usize,
    pub late_recovered: usize,
    pub late_dropped: usize,
    pub edges_retained: usize,
    pub distinct_results: usize,
    pub live_results: usize,
    pub graph_edges: usize,
    pub mean_degree: f64,
    pub forest_nodes: usize,
    pub forest_trees: usize,
    pub forest_bytes: usize,
    pub windows_evicted: usize,
}

/// The streaming RPQ engine
///
/// Owns every per-query structure and processes edges run-to-completion:
/// windows are scoped, the edge is inserted and matched, then every window
/// the edge's timestamp has passed is evicted. Edges with a timestamp below
/// the latest one seen are handed to out-of-order recovery.
pub struct RpqEngine {
    config: EngineConfig,
    automaton: Arc<Automaton>,
    graph: StreamingGraph,
    forest: Forest,
    windows: WindowManager,
    retention: RetentionPolicy,
    recovery: OutOfOrderRecovery,
    matcher: PatternMatcher,
    results: ResultSet,
    high: Option<Timestamp>,
    edges_seen: usize,
    edges_processed: usize,
    edges_discarded: usize,
    edges_refreshed: usize,
    edges_retained: usize,
    callbacks: FxHashMap<StreamType, Vec<ResultCallback>>,
}

impl RpqEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let automaton = Arc::new(Automaton::from_query_type(config.query_type, &config.labels)?);
        let windows = WindowManager::new(config.size, config.slide)?;
        let retention = RetentionPolicy::new(config.zscore, config.slide)
            .with_slide_threshold(config.slide_threshold);
        let recovery = OutOfOrderRecovery::new(config.watermark);
        let matcher = PatternMatcher::new(Arc::clone(&automaton), config.graft_policy());

        debug!(
            "Engine for query {} ({}) over [{}, slide {}], retention {}, watermark {}",
            config.query_type,
            Automaton::describe_query_type(config.query_type),
            config.size,
            config.slide,
            config.retention_tag(),
            config.watermark
        );

        Ok(Self {
            config,
            automaton,
            graph: StreamingGraph::new(),
            forest: Forest::new(),
            windows,
            retention,
            recovery,
            matcher,
            results: ResultSet::new(),
            high: None,
            edges_seen: 0,
            edges_processed: 0,
            edges_discarded: 0,
            edges_refreshed: 0,
            edges_retained: 0,
            callbacks: FxHashMap::default(),
        })
    }

    /// Processes the edge `(src, dst, label)` at logical time `t`.
    pub fn process(
        &mut self,
        src: VertexId,
        dst: VertexId,
        label: Label,
        t: Timestamp,
    ) -> Result<EdgeOutcome> {
        self.edges_seen += 1;
        let id = self.edges_seen as u64;

        if !self.automaton.accepts_label(label) {
            self.edges_discarded += 1;
            return Ok(EdgeOutcome::Discarded);
        }

        if let Some(high) = self.high
            && t < high
        {
            let late = self.recovery.replay(
                id,
                EdgeKey::new(src, dst, label),
                t,
                high,
                &self.windows,
                &self.graph,
                &self.forest,
                &self.matcher,
                &mut self.results,
            )?;
            return Ok(match late {
                LateEdge::Recovered { events, .. } => {
                    self.emit_all(&events);
                    EdgeOutcome::Recovered { events }
                }
                LateEdge::Dropped { .. } => EdgeOutcome::Dropped,
            });
        }
        self.high = Some(t);

        debug!("Received edge ({}, {}, {}) at {}", src, dst, label, t);

        let expiration = self.windows.scope(t);
        let (edge_id, refreshed) = match self.graph.insert(id, src, dst, label, t, expiration) {
            Some(edge_id) => (edge_id, false),
            None => {
                let existing = self
                    .graph
                    .find(&EdgeKey::new(src, dst, label))
                    .ok_or(RpqError::DuplicateEdgeMissing { src, dst, label })?;
                self.windows.detach(existing, &self.graph);
                self.graph.refresh(existing, t, expiration);
                (existing, true)
            }
        };
        let plan = self.windows.assign(edge_id, t);

        let mut events = if refreshed {
            self.edges_refreshed += 1;
            Vec::new()
        } else {
            let edge = self
                .graph
                .edge(edge_id)
                .cloned()
                .ok_or(RpqError::DuplicateEdgeMissing { src, dst, label })?;
            self.edges_processed += 1;
            self.matcher
                .process_edge(&self.graph, &mut self.forest, &mut self.results, &edge, t)
        };

        events.extend(self.run_eviction(&plan, t)?);
        self.emit_all(&events);

        Ok(if refreshed {
            EdgeOutcome::Refreshed { events }
        } else {
            EdgeOutcome::Inserted { events }
        })
    }

    /// Moves the stream to `t` without an edge, evicting every window that
    /// closes at or before it. Used when the stream ends.
    pub fn advance_to(&mut self, t: Timestamp) -> Result<Vec<ResultEvent>> {
        if self.high.is_some_and(|h| t < h) {
            return Ok(Vec::new());
        }
        self.high = Some(t);
        let plan = self.windows.due(t);
        let events = self.run_eviction(&plan, t)?;
        self.emit_all(&events);
        Ok(events)
    }

    fn run_eviction(&mut self, plan: &EvictionPlan, now: Timestamp) -> Result<Vec<ResultEvent>> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        self.recovery.snapshot(plan.bounds(), &self.graph, &self.forest, now);

        let eviction = self.windows.evict(plan, &mut self.graph, &self.retention, now)?;
        self.edges_retained += eviction.retained;

        let lost = self.forest.expire(&eviction.deleted);
        let mut events = self
            .matcher
            .repair(&self.graph, &mut self.forest, &mut self.results, &lost, now);
        let touched: FxHashSet<VertexId> = lost.iter().map(|r| r.tree).collect();
        self.forest.prune_childless_roots(touched);

        for (pair, timestamp) in self.results.expire_recovered(now) {
            events.push(ResultEvent {
                stream: StreamType::DStream,
                pair,
                timestamp,
                valid_until: now,
            });
        }

        self.recovery.prune(now);
        self.windows.prune(now - self.recovery.watermark());

        debug!(
            "Evicted {} window(s) at {}: {} edges deleted, {} retained, {} forest nodes lost",
            eviction.windows.len(),
            now,
            eviction.deleted.len(),
            eviction.retained,
            lost.len()
        );

        if self.callbacks.contains_key(&StreamType::RStream) {
            for &(_, close) in &eviction.windows {
                for (pair, timestamp) in self.results.sorted() {
                    self.emit(&ResultEvent {
                        stream: StreamType::RStream,
                        pair,
                        timestamp,
                        valid_until: close,
                    });
                }
            }
        }

        Ok(events)
    }

    /// Subscribe a callback to result emissions
    pub fn subscribe<F>(&mut self, stream_type: StreamType, callback: F)
    where
        F: Fn(&ResultEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .entry(stream_type)
            .or_default()
            .push(Arc::new(callback));
    }

    fn emit(&self, event: &ResultEvent) {
        if let Some(callbacks) = self.callbacks.get(&event.stream) {
            for callback in callbacks {
                callback(event);
            }
        }
    }

    fn emit_all(&self, events: &[ResultEvent]) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn graph(&self) -> &StreamingGraph {
        &self.graph
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn recovery(&self) -> &OutOfOrderRecovery {
        &self.recovery
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Latest in-order timestamp.
    pub fn current_time(&self) -> Option<Timestamp> {
        self.high
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            edges_seen: self.edges_seen,
            edges_processed: self.edges_processed,
            edges_discarded: self.edges_discarded,
            edges_refreshed: self.edges_refreshed,
            late_recovered: self.recovery.recovered(),
            late_dropped: self.recovery.dropped(),
            edges_retained: self.edges_retained,
            distinct_results: self.results.distinct_count(),
            live_results: self.results.len(),
            graph_edges: self.graph.edge_count(),
            mean_degree: self.graph.density_stats().mean(),
            forest_nodes: self.forest.node_count(),
            forest_trees: self.forest.tree_count(),
            forest_bytes: self.forest.memory_footprint(),
            windows_evicted: self.windows.evicted_total(),
        }
    }

    /// Moves the engine onto a worker thread fed by a cloneable
    /// [`EdgeStream`]. The worker stops once every stream handle is dropped
    /// and hands the engine back through the join handle.
    pub fn spawn(
        self,
        name: impl Into<String>,
    ) -> (
        EdgeStream,
        mpsc::Receiver<ResultEvent>,
        thread::JoinHandle<Result<RpqEngine>>,
    ) {
        let (tx, rx) = mpsc::channel::<StreamMessage>();
        let (out_tx, out_rx) = mpsc::channel();
        let stream = EdgeStream {
            name: name.into(),
            sender: tx,
        };

        let handle = thread::spawn(move || {
            let mut engine = self;
            while let Ok(message) = rx.recv() {
                let events = match message {
                    StreamMessage::Edge { src, dst, label, timestamp } => {
                        engine.process(src, dst, label, timestamp)?.into_events()
                    }
                    StreamMessage::Advance(t) => engine.advance_to(t)?,
                };
                for event in events {
                    let _ = out_tx.send(event);
                }
            }
            Ok(engine)
        });

        (stream, out_rx, handle)
    }
}

enum StreamMessage {
    Edge {
        src: VertexId,
        dst: VertexId,
        label: Label,
        timestamp: Timestamp,
    },
    Advance(Timestamp),
}

/// Represents an edge stream that feeds a spawned engine
#[derive(Clone)]
pub struct EdgeStream {
    pub name: String,
    sender: mpsc::Sender<StreamMessage>,
}

impl EdgeStream {
    /// Add one edge at logical time `timestamp`
    pub fn add(
        &self,
        src: VertexId,
        dst: VertexId,
        label: Label,
        timestamp: Timestamp,
    ) -> Result<()> {
        self.send(StreamMessage::Edge {
            src,
            dst,
            label,
            timestamp,
        })
    }

    /// Add a batch of `(src, dst, label, timestamp)` edges
    pub fn add_all<I>(&self, edges: I) -> Result<()>
    where
        I: IntoIterator<Item = (VertexId, VertexId, Label, Timestamp)>,
    {
        for (src, dst, label, timestamp) in edges {
            self.add(src, dst, label, timestamp)?;
        }
        Ok(())
    }

    /// Advance the stream to `final_timestamp` so every window closing by
    /// then is evicted and reported.
    pub fn close_stream(&self, final_timestamp: Timestamp) -> Result<()> {
        self.send(StreamMessage::Advance(final_timestamp))
    }

    fn send(&self, message: StreamMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| RpqError::StreamClosed(format!("{}: {}", self.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpq_engine_creation() {
        let engine = RpqEngine::new(EngineConfig::new(10, 5, 1, vec![6])).unwrap();
        assert_eq!(engine.stats(), EngineStats::default());
        assert!(engine.current_time().is_none());
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(matches!(
            RpqEngine::new(EngineConfig::new(10, 4, 1, vec![6])),
            Err(RpqError::SizeNotMultipleOfSlide { .. })
        ));
    }

    #[test]
    fn test_discards_foreign_labels() {
        let mut engine = RpqEngine::new(EngineConfig::new(10, 5, 1, vec![6])).unwrap();
        assert_eq!(engine.process(1, 2, 7, 1).unwrap(), EdgeOutcome::Discarded);
        assert_eq!(engine.stats().edges_discarded, 1);
        assert!(engine.graph().is_empty());
        assert!(engine.current_time().is_none());
    }

    #[test]
    fn test_late_edge_without_watermark_is_dropped() {
        let mut engine = RpqEngine::new(EngineConfig::new(10, 5, 1, vec![6])).unwrap();
        engine.process(1, 2, 6, 9).unwrap();
        assert_eq!(engine.process(2, 3, 6, 6).unwrap(), EdgeOutcome::Dropped);
        assert_eq!(engine.stats().late_dropped, 1);
        assert_eq!(engine.graph().edge_count(), 1);
    }
}
