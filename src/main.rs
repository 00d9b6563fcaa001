use clap::Parser;
use srpq_rs::{Automaton, EdgeReader, RpqEngine, RunConfig, TimeOrigin, Timestamp};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// First checkpoint, in logical time units; checkpoints double afterwards.
const CHECKPOINT_PERIOD: Timestamp = 3600;

#[derive(Parser)]
#[command(
    name = "srpq",
    version,
    about = "Streaming regular path queries over a timestamped edge stream"
)]
struct Cli {
    /// Path to the key=value run configuration
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunConfig::from_file(&cli.config)?;
    let mut engine = RpqEngine::new(config.engine.clone())?;
    info!(
        query = Automaton::describe_query_type(config.engine.query_type),
        size = config.engine.size,
        slide = config.engine.slide,
        retention = %config.engine.retention_tag(),
        watermark = config.engine.watermark,
        "Starting run on {}",
        config.input_data_path.display()
    );

    let input = BufReader::new(File::open(&config.input_data_path)?);
    let mut origin = TimeOrigin::new();
    let mut checkpoint: Timestamp = 1;
    let started = Instant::now();

    for record in EdgeReader::new(input) {
        let record = record?;
        let t = origin.logical(record.timestamp);
        engine.process(record.src, record.dst, record.label, t)?;

        if t >= checkpoint * CHECKPOINT_PERIOD {
            checkpoint += checkpoint;
            let stats = engine.stats();
            info!(
                processed_edges = stats.edges_seen,
                saved_edges = stats.edges_retained,
                avg_degree = stats.mean_degree,
                resulting_paths = stats.distinct_results,
                forest_nodes = stats.forest_nodes,
                "Checkpoint at {}",
                t
            );
        }
    }

    let elapsed = started.elapsed().as_secs();
    let stats = engine.stats();
    info!(
        resulting_paths = stats.distinct_results,
        processed_edges = stats.edges_seen,
        saved_edges = stats.edges_retained,
        late_recovered = stats.late_recovered,
        late_dropped = stats.late_dropped,
        "Finished in {}s",
        elapsed
    );

    if !config.output_base_folder.as_os_str().is_empty() {
        fs::create_dir_all(&config.output_base_folder)?;
    }

    let mut summary = BufWriter::new(File::create(config.summary_path())?);
    writeln!(summary, "resulting paths: {}", stats.distinct_results)?;
    writeln!(summary, "processed edges: {}", stats.edges_seen)?;
    writeln!(summary, "saved edges: {}", stats.edges_retained)?;
    writeln!(summary, "execution time: {elapsed}")?;
    summary.flush()?;

    let mut csv = BufWriter::new(File::create(config.results_path())?);
    engine.results().write_delimited(&mut csv, ',')?;
    csv.flush()?;

    info!("Results written to {}", config.results_path().display());
    Ok(())
}
