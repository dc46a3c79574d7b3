use super::{Event, Reading};

use perf_event::events::Raw;
use perf_event::{Builder, Counter};

struct PerfEvent {
    counter: Counter,
}

impl Event for PerfEvent {
    fn read(&mut self) -> std::io::Result<Reading> {
        let reading = self.counter.read_count_and_time()?;

        Ok(Reading {
            value: reading.count,
            enabled: reading.time_enabled,
            running: reading.time_running,
        })
    }
}

/// Opens a system-wide counting event for every task on `cpu`.
pub fn open(config: u64, cpu: usize) -> std::io::Result<Box<dyn Event>> {
    let mut counter = Builder::new(Raw::new(config))
        .one_cpu(cpu)
        .any_pid()
        .exclude_hv(false)
        .exclude_kernel(false)
        .build()?;

    counter.enable()?;

    Ok(Box::new(PerfEvent { counter }))
}
