use crate::traits::MillisClock;
use std::time::Instant;

/// Process-relative monotonic milliseconds, truncated to u32.
pub struct SystemMillis {
    start: Instant,
}

impl SystemMillis {
    pub fn new() -> Self {
        SystemMillis {
            start: Instant::now(),
        }
    }
}

impl Default for SystemMillis {
    fn default() -> Self {
        Self::new()
    }
}

impl MillisClock for SystemMillis {
    fn millis(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}
