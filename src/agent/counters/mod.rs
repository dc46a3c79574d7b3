//! Counters are the individually stateful quantities read on every tick.
//!
//! Each counter module registers a provider in [`COUNTERS`]. When a registry
//! is built, every counter name is offered to the providers in turn and the
//! first one that recognizes it constructs the counter. Construction is
//! cheap; backing resources (devices, perf events) are acquired in
//! [`Counter::init`].

use crate::agent::config::Config;
use crate::agent::counters::time::Tracer;

use linkme::distributed_slice;

use std::fmt::{Display, Write};
use std::sync::Arc;

#[cfg(test)]
pub mod fake;
pub mod ipmi;
pub mod msr;
pub mod perf;
pub mod time;

/// Longest accepted counter name, in bytes.
pub const MAX_NAME_LEN: usize = 15;

#[derive(thiserror::Error, Debug)]
pub enum CounterError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("no perf event for {event} could be created on any of {cpus} processors")]
    NoEvents { event: String, cpus: usize },
    #[error("no processors to sample")]
    NoProcessors,
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// One independently sampled quantity.
///
/// `restart` is only ever called from the sampler thread that owns the
/// registry, so implementations keep plain mutable state.
pub trait Counter: Send {
    fn name(&self) -> &str;

    /// Acquire backing resources. Called once when the registry activates.
    fn init(&mut self) -> Result<(), CounterError> {
        Ok(())
    }

    /// Take one reading. `last` is the value this counter produced on the
    /// previous tick.
    fn restart(&mut self, last: u64) -> u64;

    /// Rebaseline to "now" without producing a value.
    fn reset(&mut self) {}

    /// Release backing resources.
    fn exit(&mut self) {}

    /// Custom rendering for values that pack several sub-fields.
    fn formatter(&self) -> Option<Arc<dyn Formatter>> {
        None
    }
}

/// Decodes a raw 64 bit value into named sub-fields.
pub trait Formatter: Send + Sync {
    fn format(&self, value: u64, record: &mut Record);
}

/// Text rendering of one sample: `{"a":1,"b":2}\n`.
pub struct Record {
    text: String,
    fields: usize,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    pub fn new() -> Self {
        Self {
            text: String::from("{"),
            fields: 0,
        }
    }

    pub fn field(&mut self, name: &str, value: impl Display) {
        if self.fields > 0 {
            self.text.push(',');
        }
        // writing to a String cannot fail
        let _ = write!(self.text, "\"{name}\":{value}");
        self.fields += 1;
    }

    pub fn finish(mut self) -> String {
        self.text.push_str("}\n");
        self.text
    }
}

/// Everything a provider may need to construct a counter for one engine.
pub struct BuildContext<'a> {
    pub config: &'a Config,
    /// The processors this engine samples.
    pub cpus: &'a [usize],
    pub tracer: &'a Arc<Tracer>,
}

pub type CounterProvider = fn(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>>;

#[distributed_slice]
pub static COUNTERS: [CounterProvider] = [..];

/// Construct the counter registered under `name`, if any provider knows it.
pub fn build(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>> {
    COUNTERS.iter().find_map(|provider| provider(name, ctx))
}
