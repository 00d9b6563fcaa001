mod automaton;
mod config;
mod error;
mod forest;
mod result_set;
mod stream_reader;
mod streaming_graph;
mod window_instance;

pub mod engine;
pub mod windowing;

/// Vertex identifier as it appears in the input stream.
pub type VertexId = u64;
/// Edge label.
pub type Label = u32;
/// Automaton state.
pub type State = u32;
/// Logical event time.
pub type Timestamp = i64;

pub use automaton::{Automaton, Transition, INITIAL_STATE};
pub use config::{Algorithm, EngineConfig, RunConfig};
pub use engine::{EdgeOutcome, EdgeStream, EngineStats, GraftPolicy, RpqEngine};
pub use error::{Result, RpqError};
pub use forest::{Claim, Derivation, Forest, ForestNode, NodeId, RemovedNode, Tree};
pub use result_set::{ResultEvent, ResultPair, ResultSet, StreamType};
pub use stream_reader::{EdgeReader, EdgeRecord, TimeOrigin};
pub use streaming_graph::{
    DensityStats, Deferral, EdgeId, EdgeKey, GraphView, NoRetention, Retention, StreamEdge,
    StreamingGraph,
};
pub use window_instance::WindowInstance;
pub use windowing::{RetentionPolicy, WindowManager};
