//! Example walking a spawned engine through the life of a stream
//!
//! Edges for the query `ab*` (label 6 then any number of label 7) are sent
//! through an `EdgeStream`. Results appear as paths form, disappear when
//! their edges leave the sliding window, and a late edge within the
//! watermark is recovered.

use srpq_rs::{EngineConfig, RpqEngine, StreamType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Streaming Lifecycle Example ===\n");

    // 10 time units wide, sliding by 5, tolerating edges up to 3 units late
    let config = EngineConfig::new(10, 5, 3, vec![6, 7]).with_watermark(3);
    let mut engine = RpqEngine::new(config)?;

    engine.subscribe(StreamType::RStream, |event| {
        println!(
            "  [window closed at {}] {} -> {} (since {})",
            event.valid_until, event.pair.source, event.pair.destination, event.timestamp
        );
    });

    let (stream, results, handle) = engine.spawn("edges");

    let edges = [
        (1, 2, 6, 1),
        (2, 3, 7, 2),
        (3, 4, 7, 4),
        (10, 11, 6, 6),
        // late: arrives after t = 6
        (4, 5, 7, 5),
        (11, 12, 7, 9),
        (20, 21, 6, 13),
    ];

    for (src, dst, label, t) in edges {
        println!("Edge {} -{}-> {} at {}", src, label, dst, t);
        stream.add(src, dst, label, t)?;
    }
    stream.close_stream(25)?;
    drop(stream);

    let engine = handle.join().map_err(|_| "engine thread panicked")??;

    println!("\nInsertions and deletions:");
    for event in results.iter() {
        let sign = match event.stream {
            StreamType::IStream => '+',
            StreamType::DStream => '-',
            StreamType::RStream => continue,
        };
        println!(
            "  {} {} -> {} @ {}",
            sign, event.pair.source, event.pair.destination, event.timestamp
        );
    }

    let stats = engine.stats();
    println!("\n=== Summary ===");
    println!("Edges seen:        {}", stats.edges_seen);
    println!("Late recovered:    {}", stats.late_recovered);
    println!("Distinct results:  {}", stats.distinct_results);
    println!("Windows evicted:   {}", stats.windows_evicted);

    Ok(())
}
