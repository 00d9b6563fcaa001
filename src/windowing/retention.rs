//! Density-based retention of expired edges.
//!
//! An edge whose source vertex has an out-degree far above the mean is kept
//! when its window closes: it is moved forward in the arrival list behind the
//! first edge of a later window and inherits that edge's expiration. The
//! edge keeps its original timestamp, so once `now - timestamp` exceeds the
//! recency bound it is deleted like any other edge.

use crate::Timestamp;
use crate::streaming_graph::{Deferral, Retention, StreamEdge};
use crate::window_instance::WindowInstance;

/// Multiple of the slide bounding how long after its arrival an edge may
/// still be retained.
pub const DEFAULT_SLIDE_THRESHOLD: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// z-score above which a source vertex is hot; `0.0` disables retention.
    pub threshold: f64,
    pub slide: Timestamp,
    pub slide_threshold: i64,
}

impl RetentionPolicy {
    pub fn new(threshold: f64, slide: Timestamp) -> Self {
        Self {
            threshold,
            slide,
            slide_threshold: DEFAULT_SLIDE_THRESHOLD,
        }
    }

    pub fn disabled(slide: Timestamp) -> Self {
        Self::new(0.0, slide)
    }

    pub fn with_slide_threshold(mut self, slide_threshold: i64) -> Self {
        self.slide_threshold = slide_threshold;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold != 0.0
    }

    pub fn recency_bound(&self) -> Timestamp {
        self.slide.saturating_mul(self.slide_threshold)
    }

    pub fn should_retain(&self, zscore: f64, timestamp: Timestamp, now: Timestamp) -> bool {
        self.is_enabled() && zscore > self.threshold && now - timestamp <= self.recency_bound()
    }

    /// Binds the policy to the window list for one eviction pass.
    /// `first_live` is the index of the first window that stays open.
    pub fn pass<'a>(&self, windows: &'a [WindowInstance], first_live: usize) -> RetentionPass<'a> {
        RetentionPass {
            policy: *self,
            windows,
            first_live,
            retained: 0,
        }
    }
}

pub struct RetentionPass<'a> {
    policy: RetentionPolicy,
    windows: &'a [WindowInstance],
    first_live: usize,
    retained: usize,
}

impl RetentionPass<'_> {
    pub fn retained(&self) -> usize {
        self.retained
    }

    /// The window a hot edge moves into: `ceil(zscore)` windows past the
    /// first open one, clamped to the newest, falling back towards the first
    /// open window until one with a first edge is found.
    fn target(&self, zscore: f64) -> Option<&WindowInstance> {
        let newest = self.windows.len().checked_sub(1)?;
        if self.first_live > newest {
            return None;
        }
        let hops = zscore.ceil().clamp(0.0, newest as f64) as usize;
        let index = (self.first_live + hops).min(newest);
        self.windows[self.first_live..=index]
            .iter()
            .rev()
            .find(|w| !w.evicted && w.first.is_some())
    }
}

impl Retention for RetentionPass<'_> {
    fn defer(&mut self, edge: &StreamEdge, zscore: f64, now: Timestamp) -> Option<Deferral> {
        if !self.policy.should_retain(zscore, edge.timestamp, now) {
            return None;
        }
        let after = self.target(zscore)?.first?;
        self.retained += 1;
        Some(Deferral { after })
    }
}
