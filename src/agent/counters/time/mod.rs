//! Tick timing counters:
//! * `ts` - monotonic timestamp of the tick, in nanoseconds
//! * `intv` - time since the previous tick's timestamp
//! * `oh` - time spent reading the counters of this tick
//!
//! All three read the same [`Tracer`], so a registry must place `ts` before
//! `intv` and `oh` last for the values to line up.

use crate::agent::counters::*;
use crate::common::Clock;

use std::sync::atomic::{AtomicU64, Ordering};

/// Timestamps shared by the timing counters of one engine.
pub struct Tracer {
    clock: Arc<dyn Clock>,
    prev: AtomicU64,
    current: AtomicU64,
}

impl Tracer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            prev: AtomicU64::new(0),
            current: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        let now = self.clock.now();
        let current = self.current.swap(now, Ordering::Relaxed);
        self.prev.store(current, Ordering::Relaxed);
        now
    }

    fn interval(&self) -> u64 {
        self.current
            .load(Ordering::Relaxed)
            .saturating_sub(self.prev.load(Ordering::Relaxed))
    }

    fn overhead(&self) -> u64 {
        self.clock
            .now()
            .saturating_sub(self.current.load(Ordering::Relaxed))
    }

    fn rebase(&self) {
        let now = self.clock.now();
        self.prev.store(now, Ordering::Relaxed);
        self.current.store(now, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Timestamp,
    Interval,
    Overhead,
}

pub struct TimeCounter {
    kind: Kind,
    tracer: Arc<Tracer>,
}

impl TimeCounter {
    pub fn timestamp(tracer: Arc<Tracer>) -> Self {
        Self {
            kind: Kind::Timestamp,
            tracer,
        }
    }

    pub fn interval(tracer: Arc<Tracer>) -> Self {
        Self {
            kind: Kind::Interval,
            tracer,
        }
    }

    pub fn overhead(tracer: Arc<Tracer>) -> Self {
        Self {
            kind: Kind::Overhead,
            tracer,
        }
    }
}

impl Counter for TimeCounter {
    fn name(&self) -> &str {
        match self.kind {
            Kind::Timestamp => "ts",
            Kind::Interval => "intv",
            Kind::Overhead => "oh",
        }
    }

    fn restart(&mut self, _last: u64) -> u64 {
        match self.kind {
            Kind::Timestamp => self.tracer.tick(),
            Kind::Interval => self.tracer.interval(),
            Kind::Overhead => self.tracer.overhead(),
        }
    }

    fn reset(&mut self) {
        // the tracer is shared, rebasing once from `ts` is enough
        if let Kind::Timestamp = self.kind {
            self.tracer.rebase();
        }
    }
}

#[distributed_slice(COUNTERS)]
fn provide(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>> {
    let tracer = ctx.tracer.clone();

    let counter = match name {
        "ts" => TimeCounter::timestamp(tracer),
        "intv" => TimeCounter::interval(tracer),
        "oh" => TimeCounter::overhead(tracer),
        _ => return None,
    };

    Some(Box::new(counter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;

    #[test]
    fn interval_after_reset_is_well_defined() {
        let clock = Arc::new(ManualClock::new(1_000, 0));
        let tracer = Arc::new(Tracer::new(clock.clone()));

        let mut ts = TimeCounter::timestamp(tracer.clone());
        let mut intv = TimeCounter::interval(tracer.clone());
        let mut oh = TimeCounter::overhead(tracer);

        ts.reset();

        clock.set(1_500);
        assert_eq!(ts.restart(0), 1_500);
        assert_eq!(intv.restart(0), 500);
        clock.set(1_520);
        assert_eq!(oh.restart(0), 20);

        clock.set(2_500);
        assert_eq!(ts.restart(1_500), 2_500);
        assert_eq!(intv.restart(500), 1_000);
        clock.set(2_507);
        assert_eq!(oh.restart(20), 7);
    }

    #[test]
    fn reset_discards_stale_interval() {
        let clock = Arc::new(ManualClock::new(0, 0));
        let tracer = Arc::new(Tracer::new(clock.clone()));

        let mut ts = TimeCounter::timestamp(tracer.clone());
        let mut intv = TimeCounter::interval(tracer);

        clock.set(100);
        ts.restart(0);

        // sampling was off for a long time
        clock.set(1_000_000);
        ts.reset();
        clock.set(1_000_250);
        ts.restart(100);

        assert_eq!(intv.restart(0), 250);
    }
}
