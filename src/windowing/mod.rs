pub mod retention;
pub mod window_manager;

pub use retention::{RetentionPass, RetentionPolicy, DEFAULT_SLIDE_THRESHOLD};
pub use window_manager::{Eviction, EvictionPlan, WindowManager};
