//! Hardware performance counters aggregated across a processor set.
//!
//! One perf event is opened per processor. The kernel multiplexes events
//! when more are requested than the PMU has slots for, so each processor's
//! delta is rescaled by the fraction of the interval the event was actually
//! running before the deltas are summed:
//!
//! ```text
//! delta = raw_delta * enabled_delta / running_delta
//! ```
//!
//! Produces one counter per configured event, eg: `cyc`, `inst`, `llcmiss`.

use crate::agent::counters::*;
use crate::agent::stats::PERF_DISCARDED;

use ringlog::{debug, trace, warn};

#[cfg(target_os = "linux")]
mod linux;

/// Per-processor deltas above this are treated as spurious.
pub const OVERFLOW_THRESHOLD: u64 = 2_000_000_000_000;

/// Raw event codes available by name.
const EVENTS: &[(&str, u64)] = &[
    ("cyc", 0x003c),
    ("inst", 0x00c0),
    ("llcref", 0x4f2e),
    ("llcmiss", 0x412e),
    ("br", 0x00c4),
    ("brmiss", 0x00c5),
    ("l2lin", 0x07f4),
];

/// One reading of a perf event: the raw count and the time the event was
/// enabled and actually running on the PMU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reading {
    pub value: u64,
    pub enabled: u64,
    pub running: u64,
}

/// A perf event bound to one processor. Dropping it releases the event.
pub trait Event: Send {
    fn read(&mut self) -> std::io::Result<Reading>;
}

/// Opens the event with the given raw config on the given processor.
pub type Opener = fn(config: u64, cpu: usize) -> std::io::Result<Box<dyn Event>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scaled {
    Delta(u64),
    /// The event was reset or rescheduled underneath us.
    NonMonotonic,
    Overflow(u64),
}

/// Rescales the change between two readings by `enabled / running`,
/// rounding to the nearest integer.
pub fn scale(prev: &Reading, now: &Reading) -> Scaled {
    if now.value < prev.value || now.enabled < prev.enabled || now.running <= prev.running {
        return Scaled::NonMonotonic;
    }

    let raw = (now.value - prev.value) as u128;
    let enabled = (now.enabled - prev.enabled) as u128;
    let running = (now.running - prev.running) as u128;

    let delta = (raw * enabled + running / 2) / running;

    match u64::try_from(delta) {
        Ok(delta) if delta <= OVERFLOW_THRESHOLD => Scaled::Delta(delta),
        Ok(delta) => Scaled::Overflow(delta),
        Err(_) => Scaled::Overflow(u64::MAX),
    }
}

struct Slot {
    cpu: usize,
    event: Option<Box<dyn Event>>,
    prev: Reading,
}

pub struct PerfAggregator {
    name: String,
    config: u64,
    cpus: Vec<usize>,
    opener: Opener,
    slots: Vec<Slot>,
}

impl PerfAggregator {
    pub fn new(name: &str, config: u64, cpus: Vec<usize>, opener: Opener) -> Self {
        Self {
            name: name.to_string(),
            config,
            cpus,
            opener,
            slots: Vec::new(),
        }
    }
}

impl Counter for PerfAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), CounterError> {
        if self.cpus.is_empty() {
            return Err(CounterError::NoProcessors);
        }

        self.slots = self
            .cpus
            .iter()
            .map(|&cpu| {
                let event = match (self.opener)(self.config, cpu) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(
                            "failed to create perf event {} (config: {:#06x}) on cpu {cpu}: {e}",
                            self.name, self.config
                        );
                        None
                    }
                };

                Slot {
                    cpu,
                    event,
                    prev: Reading::default(),
                }
            })
            .collect();

        if self.slots.iter().all(|s| s.event.is_none()) {
            self.slots.clear();
            return Err(CounterError::NoEvents {
                event: self.name.clone(),
                cpus: self.cpus.len(),
            });
        }

        Ok(())
    }

    fn restart(&mut self, _last: u64) -> u64 {
        let mut total: u64 = 0;

        for slot in self.slots.iter_mut() {
            let Some(event) = slot.event.as_mut() else {
                continue;
            };

            let now = match event.read() {
                Ok(now) => now,
                Err(e) => {
                    debug!("{} read failed on cpu {}: {e}", self.name, slot.cpu);
                    continue;
                }
            };

            match scale(&slot.prev, &now) {
                Scaled::Delta(delta) => total = total.saturating_add(delta),
                Scaled::NonMonotonic => {
                    PERF_DISCARDED.increment();
                    trace!(
                        "{} non-monotonic on cpu {}: {:?} -> {:?}",
                        self.name,
                        slot.cpu,
                        slot.prev,
                        now
                    );
                }
                Scaled::Overflow(delta) => {
                    PERF_DISCARDED.increment();
                    trace!(
                        "{} reading {delta} on cpu {} may overflow, ignored",
                        self.name,
                        slot.cpu
                    );
                }
            }

            slot.prev = now;
        }

        total
    }

    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(now) = slot.event.as_mut().and_then(|e| e.read().ok()) {
                slot.prev = now;
            }
        }
    }

    fn exit(&mut self) {
        self.slots.clear();
    }
}

#[cfg(target_os = "linux")]
fn opener() -> Opener {
    linux::open
}

#[cfg(not(target_os = "linux"))]
fn opener() -> Opener {
    |_, _| {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "perf events require linux",
        ))
    }
}

#[distributed_slice(COUNTERS)]
fn provide(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>> {
    let config = ctx
        .config
        .perf()
        .raw()
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.config)
        .or_else(|| EVENTS.iter().find(|(n, _)| *n == name).map(|(_, c)| *c))?;

    Some(Box::new(PerfAggregator::new(
        name,
        config,
        ctx.cpus.to_vec(),
        opener(),
    )))
}
