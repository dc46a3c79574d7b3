//! The ordered set of counters sampled together on every tick.
//!
//! A registry fixes the shape of one sample: slot `i` always holds the value
//! of counter `i`. Slot 0 must be the timestamp (`ts`) and slot 1 the
//! interval (`intv`); the sampler relies on slot 0 to measure its own
//! overhead.

use crate::agent::counters::{
    self, BuildContext, Counter, CounterError, Formatter, Record, MAX_NAME_LEN,
};

use ringlog::{debug, error};

use std::collections::HashSet;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("a registry needs at least ts and intv, got {0} counters")]
    TooShort(usize),
    #[error("slot {index} must be {expected}, found {found}")]
    Layout {
        index: usize,
        expected: &'static str,
        found: String,
    },
    #[error("counter {0} appears more than once")]
    Duplicate(String),
    #[error("counter name {0:?} is longer than {MAX_NAME_LEN} bytes")]
    NameTooLong(String),
    #[error("counter names must not be empty")]
    EmptyName,
    #[error("no counter is named {0}")]
    Unknown(String),
    #[error("failed to initialize {name}: {source}")]
    Init { name: String, source: CounterError },
}

const LAYOUT: [&str; 2] = ["ts", "intv"];

/// Rendering information for one slot of a sample.
pub struct Column {
    name: String,
    formatter: Option<Arc<dyn Formatter>>,
}

#[cfg(test)]
impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The immutable shape of a registry's samples, shared with the buffers
/// that store them so rendering never touches live counter state.
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// A schema of plain columns with no formatters.
    #[cfg(test)]
    pub fn plain(names: &[&str]) -> Self {
        Self {
            columns: names
                .iter()
                .map(|name| Column {
                    name: name.to_string(),
                    formatter: None,
                })
                .collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    #[cfg(test)]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Renders one sample as `{"name":value,...}\n`.
    pub fn render(&self, values: &[u64]) -> String {
        let mut record = Record::new();

        for (column, value) in self.columns.iter().zip(values) {
            match &column.formatter {
                Some(formatter) => formatter.format(*value, &mut record),
                None => record.field(&column.name, value),
            }
        }

        record.finish()
    }
}

pub struct Registry {
    counters: Vec<Box<dyn Counter>>,
    last: Vec<u64>,
    schema: Arc<Schema>,
    active: bool,
}

impl Registry {
    pub fn new(counters: Vec<Box<dyn Counter>>) -> Result<Self, RegistryError> {
        if counters.len() < LAYOUT.len() {
            return Err(RegistryError::TooShort(counters.len()));
        }

        for (index, &expected) in LAYOUT.iter().enumerate() {
            let found = counters[index].name();
            if found != expected {
                return Err(RegistryError::Layout {
                    index,
                    expected,
                    found: found.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for counter in &counters {
            let name = counter.name();
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if name.len() > MAX_NAME_LEN {
                return Err(RegistryError::NameTooLong(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(RegistryError::Duplicate(name.to_string()));
            }
        }

        let schema = Arc::new(Schema {
            columns: counters
                .iter()
                .map(|c| Column {
                    name: c.name().to_string(),
                    formatter: c.formatter(),
                })
                .collect(),
        });

        Ok(Self {
            last: vec![0; counters.len()],
            counters,
            schema,
            active: false,
        })
    }

    /// Builds the registry from counter names using the registered
    /// providers.
    pub fn resolve<S: AsRef<str>>(names: &[S], ctx: &BuildContext) -> Result<Self, RegistryError> {
        let counters = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                counters::build(name, ctx).ok_or_else(|| RegistryError::Unknown(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(counters)
    }

    /// Initializes every counter in order. If one fails, the counters that
    /// were already initialized are exited in reverse order.
    pub fn activate(&mut self) -> Result<(), RegistryError> {
        if self.active {
            return Ok(());
        }

        for index in 0..self.counters.len() {
            if let Err(source) = self.counters[index].init() {
                let name = self.counters[index].name().to_string();
                error!("failed to initialize counter {name}: {source}");

                for counter in self.counters[..index].iter_mut().rev() {
                    counter.exit();
                }

                return Err(RegistryError::Init { name, source });
            }
        }

        self.active = true;
        Ok(())
    }

    /// Exits every counter in registry order.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }

        for counter in self.counters.iter_mut() {
            counter.exit();
        }

        self.active = false;
        debug!("exited {} counters", self.counters.len());
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Rebaselines every counter in order.
    pub fn reset(&mut self) {
        for counter in self.counters.iter_mut() {
            counter.reset();
        }
    }

    /// Reads every counter in order, each given its previous value, and
    /// returns the new sample.
    pub fn sample(&mut self) -> &[u64] {
        for (counter, last) in self.counters.iter_mut().zip(self.last.iter_mut()) {
            *last = counter.restart(*last);
        }

        &self.last
    }

    /// The most recent sample, zeroes before the first tick.
    #[cfg(test)]
    pub fn last(&self) -> &[u64] {
        &self.last
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.deactivate();
    }
}
