use srpq_rs::{EdgeOutcome, EngineConfig, ResultPair, RpqEngine, StreamType, Timestamp};
use std::sync::{Arc, Mutex};

fn pairs(engine: &RpqEngine) -> Vec<(u64, u64, Timestamp)> {
    engine
        .results()
        .sorted()
        .into_iter()
        .map(|(p, ts)| (p.source, p.destination, ts))
        .collect()
}

fn kleene_engine() -> RpqEngine {
    RpqEngine::new(EngineConfig::new(10, 5, 1, vec![6])).unwrap()
}

#[test]
fn test_kleene_star_over_sliding_windows() {
    let mut engine = kleene_engine();

    engine.process(1, 2, 6, 1).unwrap();
    engine.process(2, 3, 6, 2).unwrap();
    assert_eq!(pairs(&engine), vec![(1, 2, 1), (1, 3, 2), (2, 3, 2)]);

    // closes [0,10): both earlier edges and every path over them go
    engine.process(3, 4, 6, 12).unwrap();
    assert_eq!(pairs(&engine), vec![(3, 4, 12)]);
    assert_eq!(engine.graph().edge_count(), 1);
    assert_eq!(engine.stats().distinct_results, 6);
    assert_eq!(engine.stats().windows_evicted, 1);
    engine.forest().verify_integrity().unwrap();
}

#[test]
fn test_edge_lives_until_its_last_window_closes() {
    let mut engine = kleene_engine();

    // t = 7 falls in [0,10) and [5,15)
    engine.process(1, 2, 6, 7).unwrap();
    assert_eq!(engine.graph().arrival_order().next().unwrap().expiration, 15);

    engine.process(5, 6, 6, 10).unwrap();
    assert!(engine.results().contains(&ResultPair::new(1, 2)));
    assert_eq!(engine.graph().edge_count(), 2);

    engine.process(8, 9, 6, 15).unwrap();
    assert!(!engine.results().contains(&ResultPair::new(1, 2)));
    assert_eq!(pairs(&engine), vec![(5, 6, 10), (8, 9, 15)]);
}

#[test]
fn test_identity_collision_refreshes_edge() {
    let mut engine = kleene_engine();

    assert!(matches!(engine.process(1, 2, 6, 1).unwrap(), EdgeOutcome::Inserted { .. }));
    let outcome = engine.process(1, 2, 6, 8).unwrap();
    assert_eq!(outcome, EdgeOutcome::Refreshed { events: Vec::new() });

    assert_eq!(engine.graph().edge_count(), 1);
    let edge = engine.graph().arrival_order().next().unwrap();
    assert_eq!(edge.timestamp, 8);
    assert_eq!(edge.expiration, 15);
    assert_eq!(engine.stats().edges_refreshed, 1);

    // the refreshed edge survives the close of [0,10)
    engine.process(3, 4, 6, 11).unwrap();
    assert!(engine.results().contains(&ResultPair::new(1, 2)));
}

#[test]
fn test_window_memberships_match_natural_windows() {
    let mut engine = RpqEngine::new(EngineConfig::new(12, 4, 1, vec![6])).unwrap();

    for (i, t) in [0, 1, 3, 4, 7, 8, 11, 12, 13, 17, 20, 26].into_iter().enumerate() {
        engine.process(i as u64, i as u64 + 100, 6, t).unwrap();
        assert_eq!(
            engine.windows().memberships(t),
            engine.windows().natural_windows(t),
            "windows containing {t}"
        );
        for window in engine.windows().open_windows() {
            assert!(window.close > t);
            assert_eq!(window.close - window.open, 12);
            assert_eq!(window.open % 4, 0);
        }
    }
}

#[test]
fn test_advance_to_closes_remaining_windows() {
    let mut engine = kleene_engine();
    engine.process(1, 2, 6, 1).unwrap();
    engine.process(2, 3, 6, 2).unwrap();

    let events = engine.advance_to(10).unwrap();
    let deleted: Vec<_> = events
        .iter()
        .filter(|e| e.stream == StreamType::DStream)
        .map(|e| e.pair)
        .collect();
    assert_eq!(deleted.len(), 3);
    assert!(engine.results().is_empty());
    assert!(engine.graph().is_empty());
    assert_eq!(engine.forest().tree_count(), 0);

    // going back in time is a no-op
    assert!(engine.advance_to(4).unwrap().is_empty());
    assert_eq!(engine.current_time(), Some(10));
}

/// Subscribers see insertions, deletions and the relation at every close.
#[test]
fn test_subscribers_receive_streams() {
    let mut engine = kleene_engine();
    let inserted = Arc::new(Mutex::new(Vec::new()));
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let relation = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&inserted);
    engine.subscribe(StreamType::IStream, move |e| sink.lock().unwrap().push(e.pair));
    let sink = Arc::clone(&deleted);
    engine.subscribe(StreamType::DStream, move |e| sink.lock().unwrap().push(e.pair));
    let sink = Arc::clone(&relation);
    engine.subscribe(StreamType::RStream, move |e| {
        sink.lock().unwrap().push((e.pair, e.valid_until))
    });

    engine.process(1, 2, 6, 1).unwrap();
    engine.process(2, 3, 6, 2).unwrap();
    engine.process(3, 4, 6, 12).unwrap();

    let inserted = inserted.lock().unwrap();
    assert!(inserted.contains(&ResultPair::new(1, 3)));
    assert!(inserted.contains(&ResultPair::new(3, 4)));

    let deleted = deleted.lock().unwrap();
    assert_eq!(deleted.len(), 5);
    assert!(!deleted.contains(&ResultPair::new(3, 4)));

    assert_eq!(*relation.lock().unwrap(), vec![(ResultPair::new(3, 4), 10)]);
}

#[test]
fn test_retention_keeps_hot_vertex_edges() {
    let config = EngineConfig::new(10, 5, 1, vec![6])
        .with_zscore(0.5)
        .with_slide_threshold(3);
    let mut engine = RpqEngine::new(config).unwrap();

    for (s, d, t) in [(1, 10, 1), (1, 11, 2), (20, 21, 2), (1, 12, 3), (22, 23, 3), (1, 13, 4)] {
        engine.process(s, d, 6, t).unwrap();
    }

    // [0,10) closes: vertex 1 is dense, its edges move to [10,20)
    engine.process(30, 31, 6, 12).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.edges_retained, 4);
    assert_eq!(stats.graph_edges, 5);
    assert!(engine.results().contains(&ResultPair::new(1, 13)));
    assert!(!engine.results().contains(&ResultPair::new(20, 21)));
    assert!(engine
        .graph()
        .arrival_order()
        .filter(|e| e.src == 1)
        .all(|e| e.expiration == 20 && e.timestamp <= 4));
    engine.forest().verify_integrity().unwrap();

    // past the recency bound they are deleted like any other edge
    engine.process(40, 41, 6, 20).unwrap();
    assert_eq!(engine.stats().edges_retained, 4);
    assert_eq!(pairs(&engine), vec![(40, 41, 20)]);
}

#[test]
fn test_retained_edges_expire_with_their_new_neighbours() {
    let config = EngineConfig::new(9, 3, 1, vec![6])
        .with_zscore(0.3)
        .with_slide_threshold(3);
    let mut engine = RpqEngine::new(config).unwrap();

    let edges = [(0, 1, 2), (0, 0, 4), (0, 2, 5), (1, 0, 9), (0, 0, 9), (0, 2, 12), (0, 0, 15)];
    for (s, d, t) in edges {
        engine.process(s, d, 6, t).unwrap();
        assert!(
            engine.graph().arrival_order().all(|e| e.expiration > t),
            "expired edge still live at {t}"
        );
        let expirations: Vec<_> = engine.graph().arrival_order().map(|e| e.expiration).collect();
        assert!(expirations.windows(2).all(|w| w[0] <= w[1]));
        engine.forest().verify_integrity().unwrap();
    }
}

#[test]
fn test_strict_mode_keeps_freshest_path() {
    let edges = [(1, 2, 1), (2, 3, 2), (1, 3, 5)];

    let mut first_claim = kleene_engine();
    let mut strict =
        RpqEngine::new(EngineConfig::new(10, 5, 1, vec![6]).with_strict(true)).unwrap();
    for (s, d, t) in edges {
        first_claim.process(s, d, 6, t).unwrap();
        strict.process(s, d, 6, t).unwrap();
    }

    assert_eq!(first_claim.results().get(&ResultPair::new(1, 3)), Some(2));
    assert_eq!(strict.results().get(&ResultPair::new(1, 3)), Some(5));
    strict.forest().verify_integrity().unwrap();
}

#[test]
fn test_spawned_engine() {
    let engine = kleene_engine();
    let (stream, results, handle) = engine.spawn("edges");

    stream
        .add_all([(1, 2, 6, 1), (2, 3, 6, 2), (9, 9, 7, 3)])
        .unwrap();
    stream.close_stream(10).unwrap();
    drop(stream);

    let engine = handle.join().unwrap().unwrap();
    let events: Vec<_> = results.iter().collect();

    let inserted = events.iter().filter(|e| e.stream == StreamType::IStream).count();
    let deleted = events.iter().filter(|e| e.stream == StreamType::DStream).count();
    assert_eq!(inserted, 3);
    assert_eq!(deleted, 3);
    assert!(engine.results().is_empty());
    assert_eq!(engine.stats().edges_discarded, 1);
}

#[test]
fn test_query_with_concatenation() {
    // ab*: the first edge must carry label 6, the rest label 7
    let mut engine = RpqEngine::new(EngineConfig::new(20, 5, 3, vec![6, 7])).unwrap();
    engine.process(1, 2, 7, 1).unwrap();
    engine.process(2, 3, 6, 2).unwrap();
    engine.process(3, 4, 7, 3).unwrap();
    engine.process(4, 5, 7, 4).unwrap();

    assert_eq!(pairs(&engine), vec![(2, 3, 2), (2, 4, 3), (2, 5, 4)]);
    assert!(!engine.forest().has_tree(1));
}
