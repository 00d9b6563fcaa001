use crate::Timestamp;
use crate::streaming_graph::EdgeId;

// Representing one [open, close) window over the edge stream, with its
// first and last edge in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInstance {
    pub open: Timestamp,
    pub close: Timestamp,
    pub first: Option<EdgeId>,
    pub last: Option<EdgeId>,
    pub evicted: bool,
}

impl WindowInstance {
    pub fn new(open: Timestamp, close: Timestamp) -> Self {
        Self {
            open,
            close,
            first: None,
            last: None,
            evicted: false,
        }
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.open <= timestamp && timestamp < self.close
    }

    pub fn bounds(&self) -> (Timestamp, Timestamp) {
        (self.open, self.close)
    }

    /// Records `edge` as the newest arrival of this window.
    pub fn record(&mut self, edge: EdgeId) {
        if self.first.is_none() {
            self.first = Some(edge);
        }
        self.last = Some(edge);
    }

    pub fn mark_evicted(&mut self) {
        self.evicted = true;
        self.first = None;
        self.last = None;
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}
