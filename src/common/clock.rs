/// A monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// `CLOCK_MONOTONIC` in nanoseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is
        // always available.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Test clock that advances by a fixed step every time it is read.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
    step: u64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start),
            step,
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now
            .fetch_add(self.step, std::sync::atomic::Ordering::Relaxed)
    }
}
