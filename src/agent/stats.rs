use metriken::*;

#[metric(
    name = "nodestat_ticks",
    description = "The number of sampler ticks completed across all engines"
)]
pub static TICKS: Counter = Counter::new();

#[metric(
    name = "nodestat_samples_overwritten",
    description = "The number of samples lost because a full buffer wrapped"
)]
pub static OVERWRITTEN: Counter = Counter::new();

#[metric(
    name = "nodestat_perf_discarded",
    description = "The number of per-processor perf readings discarded as non-monotonic or overflowed",
    metadata = { counter = "perf" }
)]
pub static PERF_DISCARDED: Counter = Counter::new();

#[metric(
    name = "nodestat_raw_read_failures",
    description = "The number of failed model specific register reads",
    metadata = { counter = "msr" }
)]
pub static RAW_READ_FAILURES: Counter = Counter::new();

#[metric(
    name = "nodestat_sensor_failures",
    description = "The number of board-management sensor requests or responses that failed",
    metadata = { counter = "ipmi" }
)]
pub static SENSOR_FAILURES: Counter = Counter::new();
