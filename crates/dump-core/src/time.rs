use std::{
    fmt,
    ops::{Add, Sub},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::time::{ClockId, clock_gettime};
use serde::{Deserialize, Serialize};

/// Kernel monotonic timestamp: nanoseconds elapsed since boot.
///
/// This is the clock used by the eBPF side to express expirations inside
/// the filter tables.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => {
                Timestamp(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
            }
            Err(err) => {
                log::error!("reading CLOCK_MONOTONIC failed: {err}");
                Timestamp(0)
            }
        }
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_nanos() as u64))
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Timestamp(raw)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

/// Elapsed time between two timestamps, zero if `rhs` is later.
impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of both wall-clock and kernel-monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn monotonic(&self) -> Timestamp;
}

/// The real clocks of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock which only moves when told to. Both time bases advance together.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(SystemTime, Timestamp)>,
}

impl ManualClock {
    pub fn new(wall: SystemTime, monotonic: Timestamp) -> Self {
        Self {
            inner: Mutex::new((wall, monotonic)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.0 += duration;
        inner.1 = inner.1 + duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // An arbitrary boot time, one hour before the wall clock reading.
        Self::new(
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            Timestamp::from(3_600_000_000_000),
        )
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn monotonic(&self) -> Timestamp {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

/// Converts between kernel-monotonic timestamps and wall-clock time.
#[derive(Clone)]
pub struct TimeResolver {
    clock: Arc<dyn Clock>,
}

impl TimeResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Wall-clock instant corresponding to a monotonic timestamp.
    pub fn resolve_monotonic(&self, timestamp: Timestamp) -> SystemTime {
        let wall = self.clock.now();
        let monotonic = self.clock.monotonic();
        if timestamp >= monotonic {
            wall + (timestamp - monotonic)
        } else {
            wall.checked_sub(monotonic - timestamp).unwrap_or(UNIX_EPOCH)
        }
    }

    /// Monotonic timestamp corresponding to a wall-clock instant.
    pub fn compute_monotonic(&self, instant: SystemTime) -> Timestamp {
        let wall = self.clock.now();
        let monotonic = self.clock.monotonic();
        match instant.duration_since(wall) {
            Ok(ahead) => monotonic + ahead,
            Err(behind) => monotonic.saturating_sub(behind.duration()),
        }
    }
}

impl Default for TimeResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
