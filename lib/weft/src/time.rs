use std::time::{Instant, SystemTime};

/// Whole seconds since the unix epoch. Management rows and connection
/// open timestamps are reported on this clock; everything rate-shaped
/// runs on `Uptime` ticks instead.
#[inline]
pub fn wall_clock_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the epoch")
        .as_secs()
}

/// Monotonic uptime clock handing out one tick per elapsed second. Windowed
/// counters (e.g. settlement rates) are advanced against ticks from a single
/// shared instance so their windows line up.
#[derive(Debug, Copy, Clone)]
pub struct Uptime {
    started: Instant,
}

impl Uptime {
    #[inline]
    pub fn new() -> Uptime {
        Uptime {
            started: Instant::now(),
        }
    }

    /// Current tick (whole seconds since construction).
    #[inline]
    pub fn tick(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_nonzero() {
        assert!(wall_clock_secs() > 1_500_000_000);
    }

    #[test]
    fn test_uptime_monotone() {
        let uptime = Uptime::new();
        let first = uptime.tick();
        let second = uptime.tick();
        assert!(second >= first);
    }
}
