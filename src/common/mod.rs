mod clock;

pub use clock::{Clock, MonotonicClock};

#[cfg(test)]
pub use clock::ManualClock;

pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Upper bound on the text produced by a single read of the control surface.
pub fn page_size() -> usize {
    sysconf::page::pagesize()
}
