//! The adaptive tick loop.
//!
//! Each [`Sampler`] owns one background thread while running. A tick reads
//! every counter of the registry, appends the sample to the buffer, and then
//! sleeps for what is left of the period after subtracting the time the tick
//! itself took. When a tick costs a fifth of the period or more, the sleep is
//! stretched to four times the overhead so that sampling stays below roughly
//! 20% of wall time instead of spinning.

use crate::agent::registry::Registry;
use crate::agent::ring::SampleBuffer;
use crate::agent::stats::TICKS;
use crate::common::{Clock, NANOS_PER_MILLI};

use parking_lot::{Condvar, Mutex};
use ringlog::{debug, error, info, warn};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Nanoseconds to sleep after a tick that took `overhead` of a `period`.
pub fn sleep_budget(period: u64, overhead: u64) -> u64 {
    if overhead.saturating_mul(5) >= period {
        overhead.saturating_mul(4)
    } else {
        period - overhead
    }
}

/// Cooperative cancellation for a sampler thread.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    pub fn stop(&self) {
        let (stopped, wake) = &*self.inner;
        *stopped.lock() = true;
        wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `timeout` or until stopped, whichever comes first.
    /// Returns whether the token was stopped.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (stopped, wake) = &*self.inner;
        let deadline = Instant::now() + timeout;

        let mut guard = stopped.lock();
        while !*guard {
            if wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        *guard
    }
}

/// The state moved onto the sampler thread.
pub struct Worker {
    registry: Registry,
    buffer: Arc<SampleBuffer>,
    clock: Arc<dyn Clock>,
    period: Arc<AtomicU64>,
}

impl Worker {
    pub fn new(
        registry: Registry,
        buffer: Arc<SampleBuffer>,
        clock: Arc<dyn Clock>,
        period: Arc<AtomicU64>,
    ) -> Self {
        Self {
            registry,
            buffer,
            clock,
            period,
        }
    }

    /// Takes one sample and returns how long to sleep before the next.
    pub fn tick(&mut self) -> Duration {
        let sample = self.registry.sample();
        let timestamp = sample.first().copied().unwrap_or_default();

        self.buffer.push(sample);
        TICKS.increment();

        let overhead = self.clock.now().saturating_sub(timestamp);
        let period = self
            .period
            .load(Ordering::Relaxed)
            .saturating_mul(NANOS_PER_MILLI);

        Duration::from_nanos(sleep_budget(period, overhead))
    }

    /// Ticks until stopped, then hands the registry back.
    pub fn run(mut self, stop: &StopToken) -> Registry {
        while !stop.is_stopped() {
            let budget = self.tick();

            if stop.is_stopped() {
                break;
            }

            if budget.is_zero() {
                std::thread::yield_now();
            } else {
                stop.sleep(budget);
            }
        }

        self.registry
    }
}

enum State {
    Stopped(Registry),
    Running {
        stop: StopToken,
        handle: JoinHandle<Registry>,
    },
    /// The sampler thread could not be spawned or panicked, taking the
    /// registry with it.
    Lost,
}

pub struct Sampler {
    name: String,
    pin: Option<usize>,
    buffer: Arc<SampleBuffer>,
    clock: Arc<dyn Clock>,
    period: Arc<AtomicU64>,
    state: State,
}

impl Sampler {
    pub fn new(
        name: &str,
        registry: Registry,
        buffer: Arc<SampleBuffer>,
        clock: Arc<dyn Clock>,
        period: Arc<AtomicU64>,
    ) -> Self {
        Self {
            name: name.to_string(),
            pin: None,
            buffer,
            clock,
            period,
            state: State::Stopped(registry),
        }
    }

    /// Pins the sampler thread to the given processor.
    pub fn pin(mut self, cpu: usize) -> Self {
        self.pin = Some(cpu);
        self
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Rebaselines the counters and spawns the sampler thread. Does nothing
    /// if already running.
    pub fn start(&mut self) -> std::io::Result<()> {
        let mut registry = match std::mem::replace(&mut self.state, State::Lost) {
            State::Stopped(registry) => registry,
            State::Lost => {
                self.state = State::Lost;
                return Err(std::io::Error::other(format!(
                    "{} has no counters left to sample",
                    self.name
                )));
            }
            running => {
                self.state = running;
                return Ok(());
            }
        };

        registry.reset();

        let stop = StopToken::default();
        let worker = Worker::new(
            registry,
            self.buffer.clone(),
            self.clock.clone(),
            self.period.clone(),
        );

        let token = stop.clone();
        let pin = self.pin;
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("nodestat-{}", self.name))
            .spawn(move || {
                if let Some(cpu) = pin {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
                        warn!("{name} could not be pinned to cpu {cpu}");
                    }
                }
                debug!("{name} sampling");
                worker.run(&token)
            })
            .inspect_err(|e| error!("failed to spawn sampler thread for {}: {e}", self.name))?;

        self.state = State::Running { stop, handle };
        info!("{} started", self.name);

        Ok(())
    }

    /// Signals the sampler thread and waits for it to exit. Does nothing if
    /// not running.
    pub fn stop(&mut self) {
        let (stop, handle) = match std::mem::replace(&mut self.state, State::Lost) {
            State::Running { stop, handle } => (stop, handle),
            other => {
                self.state = other;
                return;
            }
        };

        stop.stop();

        match handle.join() {
            Ok(registry) => {
                self.state = State::Stopped(registry);
                info!("{} stopped", self.name);
            }
            Err(_) => {
                error!("sampler thread for {} panicked", self.name);
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::counters::fake::{FakeCounter, Journal};
    use crate::agent::counters::time::{TimeCounter, Tracer};
    use crate::agent::counters::Counter;
    use crate::common::{ManualClock, MonotonicClock};

    const MS: u64 = NANOS_PER_MILLI;

    fn registry(clock: Arc<dyn Clock>, journal: &Journal) -> Registry {
        let tracer = Arc::new(Tracer::new(clock));
        let counters: Vec<Box<dyn Counter>> = vec![
            Box::new(TimeCounter::timestamp(tracer.clone())),
            Box::new(TimeCounter::interval(tracer)),
            Box::new(FakeCounter::new("valueA", journal)),
        ];

        let mut registry = Registry::new(counters).unwrap();
        registry.activate().unwrap();
        registry
    }

    fn count(journal: &Journal, entry: &str) -> usize {
        journal.lock().iter().filter(|e| *e == entry).count()
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + deadline;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn budget_subtracts_overhead() {
        assert_eq!(sleep_budget(1000 * MS, 0), 1000 * MS);
        assert_eq!(sleep_budget(1000 * MS, 10 * MS), 990 * MS);
        assert_eq!(sleep_budget(1000 * MS, 199 * MS), 801 * MS);
    }

    #[test]
    fn budget_backs_off_under_overload() {
        assert_eq!(sleep_budget(1000 * MS, 200 * MS), 800 * MS);
        assert_eq!(sleep_budget(1000 * MS, 500 * MS), 2000 * MS);
        assert_eq!(sleep_budget(1000 * MS, 5000 * MS), 20_000 * MS);
        assert_eq!(sleep_budget(0, 0), 0);
        assert_eq!(sleep_budget(10, u64::MAX), u64::MAX);
    }

    #[test]
    fn stop_token_interrupts_sleep() {
        let token = StopToken::default();
        assert!(!token.sleep(Duration::from_millis(1)));

        let remote = token.clone();
        let sleeper = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = remote.sleep(Duration::from_secs(60));
            (stopped, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(10));
        token.stop();

        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(30));
        assert!(token.is_stopped());
    }

    #[test]
    fn four_ticks_then_destructive_read() {
        let clock = Arc::new(ManualClock::new(0, MS));
        let journal = Journal::default();

        let mut registry = registry(clock.clone(), &journal);
        let schema = registry.schema().clone();
        registry.reset();

        let buffer = Arc::new(SampleBuffer::new(schema, 4));
        let period = Arc::new(AtomicU64::new(1000));
        let mut worker = Worker::new(registry, buffer.clone(), clock, period);

        for _ in 0..4 {
            // each clock read advances 1ms, the tick reads it twice
            assert_eq!(worker.tick(), Duration::from_millis(999));
        }

        let text = buffer.drain_to_text(4096);
        let records: Vec<&str> = text.lines().collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0], "{\"ts\":1000000,\"intv\":1000000,\"valueA\":1}");
        for (i, record) in records.iter().enumerate() {
            assert!(record.ends_with(&format!("\"valueA\":{}}}", i + 1)));
            assert!(record.contains("\"intv\":2000000") || i == 0);
        }

        assert!(buffer.is_empty());
        assert_eq!(buffer.peek_last(), "");
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let journal = Journal::default();
        let registry = registry(clock.clone(), &journal);
        let buffer = Arc::new(SampleBuffer::new(registry.schema().clone(), 16));
        let period = Arc::new(AtomicU64::new(5000));

        let mut sampler = Sampler::new("test", registry, buffer.clone(), clock, period);

        sampler.start().unwrap();
        sampler.start().unwrap();
        assert!(sampler.is_running());
        assert_eq!(count(&journal, "reset valueA"), 1);

        assert!(wait_for(Duration::from_secs(5), || buffer.len() == 1));

        sampler.stop();
        sampler.stop();
        assert!(!sampler.is_running());
        assert_eq!(count(&journal, "exit valueA"), 0);

        sampler.start().unwrap();
        assert_eq!(count(&journal, "reset valueA"), 2);

        drop(sampler);
        assert_eq!(count(&journal, "exit valueA"), 1);
    }

    #[test]
    fn lost_sampler_refuses_to_start() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let journal = Journal::default();
        let registry = registry(clock.clone(), &journal);
        let buffer = Arc::new(SampleBuffer::new(registry.schema().clone(), 16));
        let period = Arc::new(AtomicU64::new(5000));

        let mut sampler = Sampler::new("test", registry, buffer, clock, period);
        sampler.state = State::Lost;

        assert!(sampler.start().is_err());
        assert!(!sampler.is_running());
        assert!(sampler.start().is_err());
    }

    #[test]
    fn sampler_thread_keeps_ticking() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let journal = Journal::default();
        let registry = registry(clock.clone(), &journal);
        let buffer = Arc::new(SampleBuffer::new(registry.schema().clone(), 64));
        let period = Arc::new(AtomicU64::new(1));

        let mut sampler = Sampler::new("ticking", registry, buffer.clone(), clock, period);
        sampler.start().unwrap();

        assert!(wait_for(Duration::from_secs(10), || buffer.len() >= 5));
        sampler.stop();

        let count = buffer.len();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.len(), count);

        let text = buffer.drain_to_text(1 << 20);
        let values: Vec<u64> = text
            .lines()
            .map(|line| {
                let value = line.rsplit(':').next().unwrap();
                value.trim_end_matches('}').parse().unwrap()
            })
            .collect();

        // chronological and gap free
        for pair in values.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
