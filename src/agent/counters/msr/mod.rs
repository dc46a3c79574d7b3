//! Model specific register counters, read on the first processor of the
//! engine's processor set:
//! * `temp` - package temperature, packed with the throttle targets
//! * `energy` - package energy status (cumulative, in RAPL energy units)
//! * `eunit` - RAPL power unit register
//!
//! A failed register read produces zero for that tick.

use crate::agent::counters::*;
use crate::agent::stats::RAW_READ_FAILURES;

use ringlog::{debug, warn};

#[cfg(target_os = "linux")]
mod linux;

const IA32_PACKAGE_THERM_STATUS: u64 = 0x1b1;
const IA32_TEMPERATURE_TARGET: u64 = 0x1a2;
const MSR_RAPL_POWER_UNIT: u64 = 0x606;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;

/// Reads raw 64 bit registers by address.
pub trait RawReader: Send {
    fn read_raw(&mut self, address: u64) -> std::io::Result<u64>;
}

/// Opens the register reader for one processor.
pub type Opener = fn(cpu: usize) -> Result<Box<dyn RawReader>, CounterError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Temperature,
    Energy,
    EnergyUnit,
}

impl Register {
    fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "temp",
            Self::Energy => "energy",
            Self::EnergyUnit => "eunit",
        }
    }

    fn read(&self, reader: &mut dyn RawReader) -> std::io::Result<u64> {
        match self {
            Self::Temperature => {
                let status = reader.read_raw(IA32_PACKAGE_THERM_STATUS)?;
                let target = reader.read_raw(IA32_TEMPERATURE_TARGET)?;
                Ok(pack_temperature(status, target))
            }
            Self::Energy => reader.read_raw(MSR_PKG_ENERGY_STATUS),
            Self::EnergyUnit => reader.read_raw(MSR_RAPL_POWER_UNIT),
        }
    }
}

/// Packs `tjmax << 24 | tmax << 16 | tpkg`, all in degrees celsius.
///
/// The thermal status readout is the distance below tjmax, and the target
/// register holds tjmax and the throttle offset below it.
pub fn pack_temperature(status: u64, target: u64) -> u64 {
    let tjmax = (target >> 16) & 0xff;
    let offset = (target >> 8) & 0xff;
    let readout = (status >> 16) & 0x7f;

    let tmax = tjmax.saturating_sub(offset);
    let tpkg = tjmax.saturating_sub(readout);

    (tjmax << 24) | (tmax << 16) | tpkg
}

struct TemperatureFormatter {
    detail: bool,
}

impl Formatter for TemperatureFormatter {
    fn format(&self, value: u64, record: &mut Record) {
        if self.detail {
            record.field("tjmax", (value >> 24) & 0xff);
            record.field("tmax", (value >> 16) & 0xff);
        }
        record.field("tpkg", value & 0xff);
    }
}

pub struct MsrCounter {
    register: Register,
    cpu: usize,
    opener: Opener,
    reader: Option<Box<dyn RawReader>>,
    formatter: Option<Arc<dyn Formatter>>,
}

impl MsrCounter {
    pub fn new(register: Register, cpu: usize, opener: Opener, detail: bool) -> Self {
        let formatter: Option<Arc<dyn Formatter>> = match register {
            Register::Temperature => Some(Arc::new(TemperatureFormatter { detail })),
            _ => None,
        };

        Self {
            register,
            cpu,
            opener,
            reader: None,
            formatter,
        }
    }
}

impl Counter for MsrCounter {
    fn name(&self) -> &str {
        self.register.name()
    }

    fn init(&mut self) -> Result<(), CounterError> {
        self.reader = Some((self.opener)(self.cpu)?);
        Ok(())
    }

    fn restart(&mut self, _last: u64) -> u64 {
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };

        match self.register.read(reader.as_mut()) {
            Ok(value) => value,
            Err(e) => {
                RAW_READ_FAILURES.increment();
                debug!("{} read failed on cpu {}: {e}", self.name(), self.cpu);
                0
            }
        }
    }

    fn exit(&mut self) {
        self.reader = None;
    }

    fn formatter(&self) -> Option<Arc<dyn Formatter>> {
        self.formatter.clone()
    }
}

#[cfg(target_os = "linux")]
fn opener() -> Opener {
    linux::open
}

#[cfg(not(target_os = "linux"))]
fn opener() -> Opener {
    |_| Err(CounterError::Unsupported("model specific registers"))
}

#[distributed_slice(COUNTERS)]
fn provide(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>> {
    let register = match name {
        "temp" => Register::Temperature,
        "energy" => Register::Energy,
        "eunit" => Register::EnergyUnit,
        _ => return None,
    };

    let cpu = match ctx.cpus.first() {
        Some(cpu) => *cpu,
        None => {
            warn!("no processors for {name}, reading from cpu 0");
            0
        }
    };

    Some(Box::new(MsrCounter::new(
        register,
        cpu,
        opener(),
        ctx.config.msr().temp_detail(),
    )))
}
