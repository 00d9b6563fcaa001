use crate::Timestamp;
use crate::error::{Result, RpqError};
use crate::streaming_graph::{EdgeId, StreamEdge, StreamingGraph};
use crate::window_instance::WindowInstance;
use crate::windowing::retention::RetentionPolicy;
use std::ops::Range;
use tracing::debug;

/// Windows due for eviction, as computed by [`WindowManager::assign`] or
/// [`WindowManager::due`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvictionPlan {
    range: Range<usize>,
    bounds: Vec<(Timestamp, Timestamp)>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// `(open, close)` of every window in the plan, oldest first.
    pub fn bounds(&self) -> &[(Timestamp, Timestamp)] {
        &self.bounds
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default)]
pub struct Eviction {
    pub deleted: Vec<StreamEdge>,
    pub retained: usize,
    pub windows: Vec<(Timestamp, Timestamp)>,
}

/// Sliding window bookkeeping over the arrival-ordered edge list.
///
/// Windows are materialized lazily by [`scope`](Self::scope), kept ordered by
/// open time, and never revisited once evicted: every scan starts at the
/// eviction offset.
#[derive(Debug, Clone)]
pub struct WindowManager {
    pub width: Timestamp,
    pub slide: Timestamp,
    windows: Vec<WindowInstance>,
    eviction_offset: usize,
    evicted_total: usize,
}

impl WindowManager {
    pub fn new(width: Timestamp, slide: Timestamp) -> Result<Self> {
        if width <= 0 || slide <= 0 {
            return Err(RpqError::InvalidWindow { size: width, slide });
        }
        if width % slide != 0 {
            return Err(RpqError::SizeNotMultipleOfSlide { size: width, slide });
        }
        Ok(Self {
            width,
            slide,
            windows: Vec::new(),
            eviction_offset: 0,
            evicted_total: 0,
        })
    }

    /// Close of the latest window containing `t`, which is the expiration
    /// given to an edge arriving at `t`.
    pub fn expiration_for(&self, t: Timestamp) -> Timestamp {
        t.div_euclid(self.slide) * self.slide + self.width
    }

    /// Every `[open, open + width)` with `open` a non-negative multiple of
    /// the slide that contains `t`, oldest first.
    pub fn natural_windows(&self, t: Timestamp) -> Vec<(Timestamp, Timestamp)> {
        let last_open = t.div_euclid(self.slide) * self.slide;
        let first_open = ((t - self.width).div_euclid(self.slide) + 1) * self.slide;
        let mut open = first_open.max(0);
        let mut bounds = Vec::new();
        while open <= last_open {
            bounds.push((open, open + self.width));
            open += self.slide;
        }
        bounds
    }

    /// Materializes the windows that contain `t` and returns the edge
    /// expiration for `t`.
    pub fn scope(&mut self, t: Timestamp) -> Timestamp {
        for (open, close) in self.natural_windows(t) {
            let pos = self.windows.partition_point(|w| w.open < open);
            if self.windows.get(pos).is_some_and(|w| w.open == open) {
                continue;
            }
            debug!("Opening window [{},{})", open, close);
            self.windows.insert(pos, WindowInstance::new(open, close));
            if pos < self.eviction_offset {
                self.eviction_offset += 1;
            }
        }
        self.expiration_for(t)
    }

    /// Records `edge`, arrived at `t`, in every open window containing `t`
    /// and plans the eviction of every window `t` has passed.
    pub fn assign(&mut self, edge: EdgeId, t: Timestamp) -> EvictionPlan {
        for window in &mut self.windows[self.eviction_offset..] {
            if window.contains(t) {
                window.record(edge);
            }
        }
        self.due(t)
    }

    /// Plans the eviction of every open window with `close <= now`.
    pub fn due(&self, now: Timestamp) -> EvictionPlan {
        let start = self.eviction_offset;
        let end = start
            + self.windows[start..]
                .iter()
                .take_while(|w| w.close <= now)
                .count();
        EvictionPlan {
            range: start..end,
            bounds: self.windows[start..end].iter().map(WindowInstance::bounds).collect(),
        }
    }

    /// Fixes window pointers before `edge` is moved to the tail of the
    /// arrival list by an identity-collision refresh.
    pub fn detach(&mut self, edge: EdgeId, graph: &StreamingGraph) {
        let prev = graph.prev_of(edge);
        let next = graph.next_of(edge);
        for window in &mut self.windows[self.eviction_offset..] {
            if window.first == Some(edge) {
                if window.last == Some(edge) {
                    window.first = None;
                    window.last = None;
                } else {
                    window.first = next;
                }
            } else if window.last == Some(edge) {
                window.last = prev;
            }
        }
    }

    /// Walks the arrival sub-range of the planned windows, deleting expired
    /// edges (or deferring them per `retention`), then marks the windows
    /// evicted and advances the eviction offset.
    pub fn evict(
        &mut self,
        plan: &EvictionPlan,
        graph: &mut StreamingGraph,
        retention: &RetentionPolicy,
        now: Timestamp,
    ) -> Result<Eviction> {
        if plan.is_empty() {
            return Ok(Eviction::default());
        }
        let range = plan.range.clone();
        let start = self.windows[range.clone()].iter().find_map(|w| w.first);
        let stop_at = self.windows[range.end..].iter().find_map(|w| w.first);

        if start.is_none() {
            let head_expired = graph
                .head()
                .and_then(|h| graph.edge(h))
                .is_some_and(|e| e.expiration <= now);
            if head_expired {
                let (open, close) = plan.bounds[0];
                return Err(RpqError::EvictionStartMissing { open, close });
            }
        }

        let (deleted, retained) = if start.is_some() {
            let mut pass = retention.pass(&self.windows, range.end);
            let deleted = graph.expire(now, start, stop_at, &mut pass);
            (deleted, pass.retained())
        } else {
            (Vec::new(), 0)
        };

        for window in &mut self.windows[range.clone()] {
            debug!("Evicting window [{},{})", window.open, window.close);
            window.mark_evicted();
        }
        self.eviction_offset = range.end;
        self.evicted_total += range.len();

        Ok(Eviction {
            deleted,
            retained,
            windows: plan.bounds.clone(),
        })
    }

    /// Drops evicted windows with `close <= horizon` from the front of the
    /// list. Returns how many were dropped.
    pub fn prune(&mut self, horizon: Timestamp) -> usize {
        let dropped = self.windows[..self.eviction_offset]
            .iter()
            .take_while(|w| w.evicted && w.close <= horizon)
            .count();
        self.windows.drain(..dropped);
        self.eviction_offset -= dropped;
        dropped
    }

    pub fn find(&self, open: Timestamp, close: Timestamp) -> Option<&WindowInstance> {
        let pos = self.windows.partition_point(|w| w.open < open);
        self.windows
            .get(pos)
            .filter(|w| w.open == open && w.close == close)
    }

    /// Open windows whose first/last pointers currently cover `t`.
    pub fn memberships(&self, t: Timestamp) -> Vec<(Timestamp, Timestamp)> {
        self.open_windows()
            .iter()
            .filter(|w| w.contains(t))
            .map(WindowInstance::bounds)
            .collect()
    }

    pub fn windows(&self) -> &[WindowInstance] {
        &self.windows
    }

    pub fn open_windows(&self) -> &[WindowInstance] {
        &self.windows[self.eviction_offset..]
    }

    pub fn eviction_offset(&self) -> usize {
        self.eviction_offset
    }

    pub fn evicted_total(&self) -> usize {
        self.evicted_total
    }
}
