//! Start, stop, period and history access for one or more samplers.
//!
//! All samplers share one on/off flag and one period. Both are only changed
//! while holding the control lock. The period is also published through an
//! atomic cell that sampler threads read on every tick, so stopping a
//! sampler (which joins its thread under the control lock) never waits on a
//! thread that needs the lock itself.
//!
//! The same operations are exposed as a table of named text attributes,
//! see [`ControlPlane::read`] and [`ControlPlane::write`].

use crate::agent::registry::Registry;
use crate::agent::ring::SampleBuffer;
use crate::agent::sampler::Sampler;
use crate::common::Clock;

use parking_lot::Mutex;
use ringlog::{debug, error, info};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Whether `ms` is an acceptable sampling period.
pub fn period_in_range(ms: u64) -> bool {
    ms > 100 && ms < 10_000
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("no attribute named {0}")]
    Unknown(String),
    #[error("{0} is read-only")]
    NotWritable(String),
}

/// One registry to sample, and where.
pub struct Group {
    /// NUMA node id, `None` for a single global engine.
    pub id: Option<usize>,
    /// Processor the sampler thread is pinned to.
    pub pin: Option<usize>,
    pub registry: Registry,
}

struct ControlState {
    on: bool,
    closed: bool,
    samplers: Vec<Sampler>,
}

struct Node {
    id: Option<usize>,
    buffer: Arc<SampleBuffer>,
}

pub struct ControlPlane {
    state: Mutex<ControlState>,
    period: Arc<AtomicU64>,
    nodes: Vec<Node>,
    limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attribute {
    Ctrl,
    Period,
    Clear(usize),
    Stat(usize),
    Last(usize),
}

impl ControlPlane {
    /// Creates the control plane with sampling off. `limit` bounds the text
    /// returned by a single history read.
    pub fn new(
        groups: Vec<Group>,
        capacity: usize,
        period: u64,
        limit: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let period = Arc::new(AtomicU64::new(period));
        let mut nodes = Vec::with_capacity(groups.len());
        let mut samplers = Vec::with_capacity(groups.len());

        for group in groups {
            let buffer = Arc::new(SampleBuffer::new(group.registry.schema().clone(), capacity));

            let name = match group.id {
                Some(id) => format!("node{id}"),
                None => "global".to_string(),
            };

            let mut sampler = Sampler::new(
                &name,
                group.registry,
                buffer.clone(),
                clock.clone(),
                period.clone(),
            );
            if let Some(cpu) = group.pin {
                sampler = sampler.pin(cpu);
            }

            nodes.push(Node {
                id: group.id,
                buffer,
            });
            samplers.push(sampler);
        }

        Self {
            state: Mutex::new(ControlState {
                on: false,
                closed: false,
                samplers,
            }),
            period,
            nodes,
            limit,
        }
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }

    /// Starts or stops every sampler. Repeating the current state does
    /// nothing.
    pub fn set_on(&self, on: bool) {
        let mut state = self.state.lock();

        if state.closed || state.on == on {
            return;
        }

        if on {
            for index in 0..state.samplers.len() {
                if let Err(e) = state.samplers[index].start() {
                    error!("failed to start sampling: {e}");
                    for sampler in state.samplers[..index].iter_mut() {
                        sampler.stop();
                    }
                    return;
                }
            }
            info!("sampling on");
        } else {
            for sampler in state.samplers.iter_mut() {
                sampler.stop();
            }
            info!("sampling off");
        }

        state.on = on;
    }

    /// Current period in milliseconds.
    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Relaxed)
    }

    /// Replaces the period if `ms` is in range. Returns whether it was
    /// accepted.
    pub fn set_period(&self, ms: u64) -> bool {
        if !period_in_range(ms) {
            debug!("ignoring out of range period: {ms}");
            return false;
        }

        let _state = self.state.lock();
        self.period.store(ms, Ordering::Relaxed);
        true
    }

    fn buffer(&self, index: usize) -> &SampleBuffer {
        &self.nodes[index].buffer
    }

    /// Empties the history of the `index`th buffer.
    pub fn clear(&self, index: usize) {
        self.buffer(index).clear();
    }

    /// Removes and renders as much history as fits the read limit.
    pub fn read_history(&self, index: usize) -> String {
        self.buffer(index).drain_to_text(self.limit)
    }

    /// Renders the newest sample without removing it.
    pub fn read_last(&self, index: usize) -> String {
        self.buffer(index).peek_last()
    }

    /// Stops sampling for good and exits every counter.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();

        for sampler in state.samplers.iter_mut() {
            sampler.stop();
        }

        // dropping the samplers exits their registries
        state.samplers.clear();
        state.on = false;
        state.closed = true;
    }

    /// Names of every attribute, in table order.
    pub fn attributes(&self) -> Vec<String> {
        let mut names = vec!["ctrl".to_string(), "period".to_string()];

        for node in &self.nodes {
            let suffix = node.id.map(|id| id.to_string()).unwrap_or_default();
            for base in ["clear", "stat", "last"] {
                names.push(format!("{base}{suffix}"));
            }
        }

        names
    }

    fn attribute(&self, name: &str) -> Option<Attribute> {
        match name {
            "ctrl" => return Some(Attribute::Ctrl),
            "period" => return Some(Attribute::Period),
            _ => {}
        }

        for (base, build) in [
            ("clear", Attribute::Clear as fn(usize) -> Attribute),
            ("stat", Attribute::Stat),
            ("last", Attribute::Last),
        ] {
            let Some(suffix) = name.strip_prefix(base) else {
                continue;
            };

            return self
                .nodes
                .iter()
                .position(|node| match node.id {
                    Some(id) => suffix == id.to_string(),
                    None => suffix.is_empty(),
                })
                .map(build);
        }

        None
    }

    /// Reads an attribute.
    pub fn read(&self, name: &str) -> Result<String, SurfaceError> {
        let attribute = self
            .attribute(name)
            .ok_or_else(|| SurfaceError::Unknown(name.to_string()))?;

        Ok(match attribute {
            Attribute::Ctrl => {
                if self.is_on() {
                    "on\n".to_string()
                } else {
                    "off\n".to_string()
                }
            }
            Attribute::Period => format!("{}\n", self.period()),
            Attribute::Clear(_) => String::new(),
            Attribute::Stat(index) => self.read_history(index),
            Attribute::Last(index) => self.read_last(index),
        })
    }

    /// Writes an attribute. Unrecognized input is ignored, and the whole
    /// input is acknowledged either way.
    pub fn write(&self, name: &str, input: &str) -> Result<usize, SurfaceError> {
        let attribute = self
            .attribute(name)
            .ok_or_else(|| SurfaceError::Unknown(name.to_string()))?;

        match attribute {
            Attribute::Ctrl => {
                if input.starts_with("on") {
                    self.set_on(true);
                } else if input.starts_with("off") {
                    self.set_on(false);
                } else {
                    debug!("ignoring ctrl input: {input:?}");
                }
            }
            Attribute::Period => match parse_period(input) {
                Some(ms) => {
                    self.set_period(ms);
                }
                None => debug!("ignoring period input: {input:?}"),
            },
            Attribute::Clear(index) => match input.trim() {
                "on" | "1" => self.clear(index),
                _ => debug!("ignoring clear input: {input:?}"),
            },
            Attribute::Stat(_) | Attribute::Last(_) => {
                return Err(SurfaceError::NotWritable(name.to_string()));
            }
        }

        Ok(input.len())
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_period(input: &str) -> Option<u64> {
    let input = input.trim();

    match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => input.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::counters::fake::{FakeCounter, Journal};
    use crate::agent::counters::time::{TimeCounter, Tracer};
    use crate::agent::counters::Counter;
    use crate::common::MonotonicClock;

    use std::time::{Duration, Instant};

    fn group(id: Option<usize>, clock: &Arc<dyn Clock>, journal: &Journal) -> Group {
        let tracer = Arc::new(Tracer::new(clock.clone()));
        let name = match id {
            Some(id) => format!("value{id}"),
            None => "valueA".to_string(),
        };

        let counters: Vec<Box<dyn Counter>> = vec![
            Box::new(TimeCounter::timestamp(tracer.clone())),
            Box::new(TimeCounter::interval(tracer.clone())),
            Box::new(FakeCounter::new(&name, journal)),
            Box::new(TimeCounter::overhead(tracer)),
        ];

        let mut registry = Registry::new(counters).unwrap();
        registry.activate().unwrap();

        Group {
            id,
            pin: None,
            registry,
        }
    }

    fn plane(ids: &[Option<usize>], journal: &Journal) -> ControlPlane {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let groups = ids.iter().map(|id| group(*id, &clock, journal)).collect();
        ControlPlane::new(groups, 4, 5000, 4096, clock)
    }

    fn count(journal: &Journal, entry: &str) -> usize {
        journal.lock().iter().filter(|e| *e == entry).count()
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn period_bounds_are_exclusive() {
        assert!(!period_in_range(100));
        assert!(period_in_range(101));
        assert!(period_in_range(9_999));
        assert!(!period_in_range(10_000));
        assert!(!period_in_range(0));
    }

    #[test]
    fn period_input() {
        let journal = Journal::default();
        let plane = plane(&[None], &journal);

        assert_eq!(plane.write("period", "500\n"), Ok(4));
        assert_eq!(plane.read("period").unwrap(), "500\n");

        plane.write("period", "0x3e8").unwrap();
        assert_eq!(plane.period(), 1000);

        for ignored in ["100", "10000", "abc", "", "-5", "0xzz"] {
            assert_eq!(plane.write("period", ignored), Ok(ignored.len()));
            assert_eq!(plane.period(), 1000);
        }
    }

    #[test]
    fn ctrl_input() {
        let journal = Journal::default();
        let plane = plane(&[None], &journal);

        assert_eq!(plane.read("ctrl").unwrap(), "off\n");

        plane.write("ctrl", "of").unwrap();
        assert!(!plane.is_on());

        plane.write("ctrl", "on\n").unwrap();
        assert!(plane.is_on());
        assert_eq!(plane.read("ctrl").unwrap(), "on\n");

        // a second start does not rebaseline the counters
        plane.write("ctrl", "on").unwrap();
        assert_eq!(count(&journal, "reset valueA"), 1);

        plane.write("ctrl", "off").unwrap();
        plane.write("ctrl", "off").unwrap();
        assert!(!plane.is_on());

        plane.write("ctrl", "onwards").unwrap();
        assert!(plane.is_on());
        assert_eq!(count(&journal, "reset valueA"), 2);
    }

    #[test]
    fn history_through_the_surface() {
        let journal = Journal::default();
        let plane = plane(&[None], &journal);

        plane.set_on(true);
        assert!(wait_for(|| !plane.read("last").unwrap().is_empty()));
        plane.set_on(false);

        let last = plane.read("last").unwrap();
        assert!(last.starts_with("{\"ts\":"));
        assert!(last.contains("\"valueA\":1,"));
        assert!(last.ends_with("}\n"));
        assert_eq!(plane.read("last").unwrap(), last);

        assert_eq!(plane.read("stat").unwrap(), last);
        assert_eq!(plane.read("stat").unwrap(), "");
        assert_eq!(plane.read("last").unwrap(), "");
    }

    #[test]
    fn clear_input() {
        let journal = Journal::default();
        let plane = plane(&[None], &journal);

        plane.set_on(true);
        assert!(wait_for(|| !plane.read("last").unwrap().is_empty()));
        plane.set_on(false);

        plane.write("clear", "yes").unwrap();
        assert!(!plane.read("last").unwrap().is_empty());

        assert_eq!(plane.read("clear").unwrap(), "");
        plane.write("clear", "1\n").unwrap();
        assert_eq!(plane.read("last").unwrap(), "");
        assert_eq!(plane.read("stat").unwrap(), "");
    }

    #[test]
    fn per_node_attributes() {
        let journal = Journal::default();
        let plane = plane(&[Some(0), Some(2)], &journal);

        assert_eq!(
            plane.attributes(),
            vec!["ctrl", "period", "clear0", "stat0", "last0", "clear2", "stat2", "last2"]
        );

        assert_eq!(plane.read("stat0").unwrap(), "");
        assert_eq!(plane.read("last2").unwrap(), "");
        assert_eq!(
            plane.read("stat"),
            Err(SurfaceError::Unknown("stat".into()))
        );
        assert_eq!(
            plane.read("stat1"),
            Err(SurfaceError::Unknown("stat1".into()))
        );

        plane.set_on(true);
        assert!(wait_for(|| {
            !plane.read("last0").unwrap().is_empty() && !plane.read("last2").unwrap().is_empty()
        }));
        plane.set_on(false);

        assert!(plane.read("last0").unwrap().contains("\"value0\""));
        assert!(plane.read("last2").unwrap().contains("\"value2\""));

        plane.write("clear2", "on").unwrap();
        assert_eq!(plane.read("last2").unwrap(), "");
        assert!(!plane.read("last0").unwrap().is_empty());
    }

    #[test]
    fn read_only_and_unknown() {
        let journal = Journal::default();
        let plane = plane(&[None], &journal);

        assert_eq!(
            plane.write("stat", "on"),
            Err(SurfaceError::NotWritable("stat".into()))
        );
        assert_eq!(
            plane.write("last", "on"),
            Err(SurfaceError::NotWritable("last".into()))
        );
        assert_eq!(
            plane.write("bogus", "on"),
            Err(SurfaceError::Unknown("bogus".into()))
        );
        assert_eq!(plane.read("stat0"), Err(SurfaceError::Unknown("stat0".into())));
    }

    #[test]
    fn shutdown_exits_counters_once() {
        let journal = Journal::default();
        let plane = plane(&[Some(0), Some(1)], &journal);

        plane.set_on(true);
        plane.shutdown();

        assert!(!plane.is_on());
        assert_eq!(count(&journal, "exit value0"), 1);
        assert_eq!(count(&journal, "exit value1"), 1);

        plane.set_on(true);
        assert!(!plane.is_on());

        drop(plane);
        assert_eq!(count(&journal, "exit value0"), 1);
    }
}
