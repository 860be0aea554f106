use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Logical session clock anchored to a controller-supplied reference time.
///
/// Every line a session emits (including lines written by sub-target workers)
/// carries `base + monotonic elapsed since anchor`, so timestamps stay
/// consistent no matter how long the session runs or which worker writes.
/// The type is `Copy`: handing the same value to a sub-worker reproduces the
/// exact base/anchor pair instead of re-reading the wall clock.
#[derive(Debug, Clone, Copy)]
pub struct RemoteClock {
    base_secs: u64,
    anchor: Instant,
}

impl RemoteClock {
    /// Create a clock anchored to the local wall clock right now.
    pub fn local() -> Self {
        Self::from_base(unix_now())
    }

    /// Create a clock with an explicit reference time (epoch seconds).
    pub fn from_base(base_secs: u64) -> Self {
        Self {
            base_secs,
            anchor: Instant::now(),
        }
    }

    /// Re-anchor to a new controller-supplied reference time.
    pub fn rebase(&mut self, base_secs: u64) {
        *self = Self::from_base(base_secs);
    }

    /// Current remote time in epoch seconds.
    pub fn now(&self) -> u64 {
        self.base_secs + self.anchor.elapsed().as_secs()
    }

    /// Local wall clock minus remote time, in seconds.
    pub fn skew(&self) -> i64 {
        unix_now() as i64 - self.now() as i64
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
