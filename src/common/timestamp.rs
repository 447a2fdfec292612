use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uhlc::{Timestamp as HlcTimestamp, HLC};

/// Creation time of a queued item.
///
/// Timestamps drawn from the same [`Clock`] are strictly increasing within a
/// process. They are informational; queue order comes from store ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HybridTimestamp {
    pub ts: HlcTimestamp,
}

impl HybridTimestamp {
    /// Milliseconds since UNIX_EPOCH.
    pub fn as_millis(&self) -> u64 {
        self.ts.get_time().to_duration().as_millis() as u64
    }
}

pub struct Clock {
    hlc: HLC,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            hlc: HLC::default(),
        }
    }

    /// Generate a new local timestamp for an outgoing item.
    pub fn now(&self) -> HybridTimestamp {
        HybridTimestamp {
            ts: self.hlc.new_timestamp(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock milliseconds since UNIX_EPOCH.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
