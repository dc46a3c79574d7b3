//! Scripted counter for exercising registries and samplers without hardware.

use crate::agent::counters::*;

use parking_lot::Mutex;

/// Lifecycle calls observed across a set of fake counters, eg: `init a`.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct FakeCounter {
    name: String,
    step: u64,
    fail_init: bool,
    journal: Journal,
}

impl FakeCounter {
    /// Produces `last + 1` on every tick.
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            step: 1,
            fail_init: false,
            journal: journal.clone(),
        }
    }

    pub fn step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_init = true;
        self
    }

    fn log(&self, call: &str) {
        self.journal.lock().push(format!("{call} {}", self.name));
    }
}

impl Counter for FakeCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), CounterError> {
        self.log("init");
        if self.fail_init {
            return Err(CounterError::NoProcessors);
        }
        Ok(())
    }

    fn restart(&mut self, last: u64) -> u64 {
        last + self.step
    }

    fn reset(&mut self) {
        self.log("reset");
    }

    fn exit(&mut self) {
        self.log("exit");
    }
}
