//! Error types for the streaming RPQ engine.

use crate::{Label, Timestamp, VertexId};

#[derive(Debug, thiserror::Error)]
pub enum RpqError {
    #[error("Window size {size} and slide {slide} must both be positive")]
    InvalidWindow { size: Timestamp, slide: Timestamp },

    #[error("Window size {size} is not a multiple of slide {slide}")]
    SizeNotMultipleOfSlide { size: Timestamp, slide: Timestamp },

    #[error("Unknown query type {0}")]
    UnknownQueryType(u32),

    #[error("Query type {query_type} binds {expected} labels, got {got}")]
    MissingLabels {
        query_type: u32,
        expected: usize,
        got: usize,
    },

    #[error("Automaton is not deterministic: state {state} on label {label} goes to both {first} and {second}")]
    NondeterministicTransition {
        state: u32,
        label: Label,
        first: u32,
        second: u32,
    },

    #[error("Unknown algorithm {0}")]
    UnknownAlgorithm(u32),

    #[error("The {0} engine is not provided by this build")]
    EngineUnavailable(&'static str),

    #[error("Out-of-order processing is not supported by the {0} engine")]
    OutOfOrderUnsupported(&'static str),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Malformed edge record at line {line}: {text:?}")]
    MalformedRecord { line: usize, text: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Edge ({src}, {dst}, {label}) collided on identity but is not in the graph")]
    DuplicateEdgeMissing {
        src: VertexId,
        dst: VertexId,
        label: Label,
    },

    #[error("Window [{open}, {close}) was evicted but has no snapshot")]
    MissingSnapshot { open: Timestamp, close: Timestamp },

    #[error("Eviction of window [{open}, {close}) triggered with no first edge while expired edges remain")]
    EvictionStartMissing { open: Timestamp, close: Timestamp },

    #[error("Forest is corrupted: {0}")]
    CorruptForest(String),

    #[error("Edge stream {0} is closed")]
    StreamClosed(String),
}

pub type Result<T> = std::result::Result<T, RpqError>;
