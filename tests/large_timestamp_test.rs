use srpq_rs::{EdgeReader, EngineConfig, ResultPair, RpqEngine, StreamType, TimeOrigin};
use std::io::Cursor;

/// Baseline with small logical timestamps to verify the test structure
#[test]
fn test_small_timestamps_baseline() {
    let engine = RpqEngine::new(EngineConfig::new(5000, 1000, 1, vec![6])).unwrap();
    let (stream, results, handle) = engine.spawn("stream1");

    for i in 0..10u64 {
        stream.add(i, i + 1, 6, i as i64 * 1000).unwrap();
    }
    stream.close_stream(10_001).unwrap();
    drop(stream);

    handle.join().unwrap().unwrap();
    let deleted = results
        .iter()
        .filter(|e| e.stream == StreamType::DStream)
        .count();
    assert!(deleted > 0, "closing windows should delete results");
}

/// Unix millisecond timestamps used directly as logical time. Window
/// arithmetic must not lose precision or overflow at this magnitude.
#[test]
fn test_large_unix_millisecond_timestamps() {
    let base = 1_760_000_000_000_i64;
    let mut engine = RpqEngine::new(EngineConfig::new(5000, 1000, 1, vec![6])).unwrap();

    for i in 0..10u64 {
        engine.process(i, i + 1, 6, base + i as i64 * 1000).unwrap();
    }
    for window in engine.windows().open_windows() {
        assert_eq!(window.open % 1000, 0);
        assert_eq!(window.close - window.open, 5000);
    }
    assert!(engine.stats().windows_evicted > 0);

    // only edges of the last five seconds remain
    assert_eq!(engine.graph().edge_count(), 5);
    assert!(engine.results().contains(&ResultPair::new(5, 10)));
    assert!(!engine.results().contains(&ResultPair::new(4, 5)));
    engine.forest().verify_integrity().unwrap();
}

/// Wall-clock input shifted by the first record's timestamp
#[test]
fn test_wall_clock_input_through_time_origin() {
    let input = "\
1760000000000 1760000000001 6 1760000000000
1760000000001 1760000000002 6 1760000002000
1760000000002 1760000000003 6 1760000011000
";
    let mut engine = RpqEngine::new(EngineConfig::new(10_000, 2_000, 1, vec![6])).unwrap();
    let mut origin = TimeOrigin::new();

    for record in EdgeReader::new(Cursor::new(input)) {
        let record = record.unwrap();
        let t = origin.logical(record.timestamp);
        engine.process(record.src, record.dst, record.label, t).unwrap();
    }

    assert_eq!(origin.origin(), Some(1_760_000_000_000));
    assert_eq!(engine.current_time(), Some(11_000));
    let src = 1_760_000_000_000;
    assert!(!engine.results().contains(&ResultPair::new(src, src + 1)));
    assert!(engine.results().contains(&ResultPair::new(src + 1, src + 3)));
}
