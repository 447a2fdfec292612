pub mod json_text;
pub mod task;
pub mod timestamp;

pub use task::TaskHandle;
pub use timestamp::{now_ms, Clock, HybridTimestamp};
