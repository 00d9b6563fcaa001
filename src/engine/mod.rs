pub mod matcher;
pub mod recovery;
pub mod rpq_engine;

pub use matcher::{GraftPolicy, PatternMatcher};
pub use recovery::{LateEdge, OutOfOrderRecovery, ReplayBase, WindowSnapshot};
pub use rpq_engine::{EdgeOutcome, EdgeStream, EngineStats, RpqEngine};
