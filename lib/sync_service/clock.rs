use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Time source for the sync loop: wall-clock millis position the plan, the monotonic
/// instant measures cycle budgets.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    fn instant(&self) -> Instant;
}

impl<T> Clock for Arc<T>
where
    T: Clock + ?Sized,
{
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }

    fn instant(&self) -> Instant {
        (**self).instant()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}
