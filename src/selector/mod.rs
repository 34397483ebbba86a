mod active;
mod source;

pub use active::ActiveCameraSelector;
pub use source::SourceId;

use std::time::Duration;

/// Timing gates for face checks and switching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Minimum time between face checks of the same source
    pub face_check_interval: Duration,

    /// Minimum time an active source keeps the output before another can take it
    pub switch_hysteresis: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            face_check_interval: Duration::from_millis(500),
            switch_hysteresis: Duration::from_secs(3),
        }
    }
}
