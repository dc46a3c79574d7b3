//! Board-management sensor groups read over IPMI.
//!
//! Each configured `[[ipmi.group]]` becomes one counter named after the
//! group. Up to eight sensors are packed one byte per sensor, with the first
//! sensor in the low byte. The BMC answers asynchronously, so a tick never
//! waits for a response: it collects whatever has arrived since the last
//! tick, then issues a fresh request for every sensor. A packed value
//! therefore reflects the newest reading delivered before the tick.

use crate::agent::config::{SensorConfig, SensorGroup};
use crate::agent::counters::*;
use crate::agent::stats::SENSOR_FAILURES;

use ringlog::{debug, warn};

#[cfg(target_os = "linux")]
mod linux;

/// Sensors per group, one byte each in the 64 bit value.
pub const MAX_SENSORS: usize = 8;

const INDEX_BITS: u32 = 3;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// A response delivered by the sensor bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    /// Correlation id passed to the matching [`SensorBus::request`].
    pub correlation: u64,
    /// Sensor reading byte, or `None` when the response carried no reading.
    pub reading: Option<u8>,
}

/// Asynchronous "get sensor reading" requests to the BMC.
pub trait SensorBus: Send {
    /// Queue a request for `sensor`. The response carries `correlation`.
    fn request(&mut self, sensor: u8, correlation: u64) -> std::io::Result<()>;

    /// Return the next delivered response without blocking.
    fn poll(&mut self) -> std::io::Result<Option<Response>>;
}

/// Opens the bus on the given device path.
pub type Opener = fn(device: &str) -> Result<Box<dyn SensorBus>, CounterError>;

struct SensorFormatter {
    sensors: Vec<SensorConfig>,
}

impl Formatter for SensorFormatter {
    fn format(&self, value: u64, record: &mut Record) {
        for (i, sensor) in self.sensors.iter().enumerate() {
            let byte = (value >> (8 * i)) & 0xff;
            record.field(&sensor.name, byte * sensor.mul);
        }
    }
}

pub struct IpmiCounter {
    name: String,
    device: String,
    opener: Opener,
    bus: Option<Box<dyn SensorBus>>,
    formatter: Arc<SensorFormatter>,
    readings: [u8; MAX_SENSORS],
    sequence: u64,
}

impl IpmiCounter {
    pub fn new(group: &SensorGroup, device: &str, opener: Opener) -> Self {
        let mut sensors = group.sensors.clone();
        if sensors.len() > MAX_SENSORS {
            warn!(
                "ipmi group {} has {} sensors, only the first {MAX_SENSORS} are read",
                group.name,
                sensors.len()
            );
            sensors.truncate(MAX_SENSORS);
        }

        Self {
            name: group.name.clone(),
            device: device.to_string(),
            opener,
            bus: None,
            formatter: Arc::new(SensorFormatter { sensors }),
            readings: [0; MAX_SENSORS],
            sequence: 0,
        }
    }

    fn sensors(&self) -> &[SensorConfig] {
        &self.formatter.sensors
    }

    fn collect(&mut self) {
        let Some(bus) = self.bus.as_mut() else {
            return;
        };

        loop {
            let response = match bus.poll() {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(e) => {
                    SENSOR_FAILURES.increment();
                    debug!("{} failed to receive sensor response: {e}", self.name);
                    break;
                }
            };

            let index = (response.correlation & INDEX_MASK) as usize;
            if index >= self.formatter.sensors.len() {
                warn!(
                    "{} dropped sensor response with unknown correlation {:#018x}",
                    self.name, response.correlation
                );
                continue;
            }

            if let Some(reading) = response.reading {
                self.readings[index] = reading;
            }
        }
    }

    fn request(&mut self) {
        let Some(bus) = self.bus.as_mut() else {
            return;
        };

        for (index, sensor) in self.formatter.sensors.iter().enumerate() {
            let correlation = (self.sequence << INDEX_BITS) | index as u64;
            self.sequence = self.sequence.wrapping_add(1);

            if let Err(e) = bus.request(sensor.number, correlation) {
                SENSOR_FAILURES.increment();
                debug!(
                    "{} request for sensor {} failed: {e}",
                    self.name, sensor.number
                );
            }
        }
    }

    fn packed(&self) -> u64 {
        self.readings[..self.sensors().len()]
            .iter()
            .enumerate()
            .fold(0, |acc, (i, byte)| acc | (*byte as u64) << (8 * i))
    }
}

impl Counter for IpmiCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), CounterError> {
        self.bus = Some((self.opener)(&self.device)?);
        Ok(())
    }

    fn restart(&mut self, _last: u64) -> u64 {
        self.collect();
        self.request();
        self.packed()
    }

    fn reset(&mut self) {
        // responses to requests from before the pause are still welcome
        self.collect();
    }

    fn exit(&mut self) {
        self.bus = None;
    }

    fn formatter(&self) -> Option<Arc<dyn Formatter>> {
        Some(self.formatter.clone())
    }
}

#[cfg(target_os = "linux")]
fn opener() -> Opener {
    linux::open
}

#[cfg(not(target_os = "linux"))]
fn opener() -> Opener {
    |_| Err(CounterError::Unsupported("ipmi"))
}

#[distributed_slice(COUNTERS)]
fn provide(name: &str, ctx: &BuildContext) -> Option<Box<dyn Counter>> {
    let ipmi = ctx.config.ipmi();
    let group = ipmi.groups().iter().find(|g| g.name == name)?;

    Some(Box::new(IpmiCounter::new(group, ipmi.device(), opener())))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Responses are delivered on the next poll after the request, keyed by
    /// device path so tests stay independent.
    static BUSES: Mutex<Option<HashMap<String, FakeState>>> = Mutex::new(None);

    #[derive(Default)]
    struct FakeState {
        values: HashMap<u8, u8>,
        pending: VecDeque<Response>,
        requests: Vec<(u8, u64)>,
    }

    struct FakeBus {
        device: String,
    }

    impl FakeBus {
        fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
            let mut buses = BUSES.lock().unwrap();
            let state = buses
                .get_or_insert_with(HashMap::new)
                .entry(self.device.clone())
                .or_default();
            f(state)
        }
    }

    impl SensorBus for FakeBus {
        fn request(&mut self, sensor: u8, correlation: u64) -> std::io::Result<()> {
            self.with(|state| {
                state.requests.push((sensor, correlation));
                let reading = state.values.get(&sensor).copied();
                state.pending.push_back(Response {
                    correlation,
                    reading,
                });
            });
            Ok(())
        }

        fn poll(&mut self) -> std::io::Result<Option<Response>> {
            Ok(self.with(|state| state.pending.pop_front()))
        }
    }

    fn fake(device: &str) -> Result<Box<dyn SensorBus>, CounterError> {
        Ok(Box::new(FakeBus {
            device: device.to_string(),
        }))
    }

    fn set(device: &str, sensor: u8, value: u8) {
        FakeBus {
            device: device.to_string(),
        }
        .with(|state| {
            state.values.insert(sensor, value);
        });
    }

    fn inject(device: &str, response: Response) {
        FakeBus {
            device: device.to_string(),
        }
        .with(|state| state.pending.push_back(response));
    }

    fn group(sensors: &[(&str, u8, u64)]) -> SensorGroup {
        SensorGroup {
            name: "fans".into(),
            sensors: sensors
                .iter()
                .map(|&(name, number, mul)| SensorConfig {
                    name: name.into(),
                    number,
                    mul,
                })
                .collect(),
        }
    }

    #[test]
    fn readings_lag_one_tick() {
        const DEV: &str = "lag";

        set(DEV, 65, 30);
        set(DEV, 66, 40);

        let mut counter = IpmiCounter::new(
            &group(&[("FAN1", 65, 100), ("FAN2", 66, 100)]),
            DEV,
            fake,
        );
        counter.init().unwrap();

        // nothing has been delivered yet
        assert_eq!(counter.restart(0), 0);
        assert_eq!(counter.restart(0), 40 << 8 | 30);

        set(DEV, 66, 41);
        assert_eq!(counter.restart(0), 40 << 8 | 30);
        assert_eq!(counter.restart(0), 41 << 8 | 30);
    }

    #[test]
    fn formatter_scales_each_sensor() {
        let counter = IpmiCounter::new(
            &group(&[("FAN1", 65, 100), ("FAN2", 66, 1), ("FAN3", 67, 120)]),
            "format",
            fake,
        );

        let mut record = Record::new();
        counter
            .formatter()
            .unwrap()
            .format(0x00_03_02_01, &mut record);
        assert_eq!(
            record.finish(),
            "{\"FAN1\":100,\"FAN2\":2,\"FAN3\":360}\n"
        );
    }

    #[test]
    fn unknown_correlation_is_dropped() {
        const DEV: &str = "unknown";

        let mut counter = IpmiCounter::new(&group(&[("FAN1", 65, 1)]), DEV, fake);
        counter.init().unwrap();

        inject(
            DEV,
            Response {
                correlation: 5,
                reading: Some(99),
            },
        );
        inject(
            DEV,
            Response {
                correlation: 0,
                reading: Some(7),
            },
        );

        assert_eq!(counter.restart(0), 7);
    }

    #[test]
    fn missing_reading_keeps_previous_value() {
        const DEV: &str = "missing";

        set(DEV, 65, 12);

        let mut counter = IpmiCounter::new(&group(&[("FAN1", 65, 1)]), DEV, fake);
        counter.init().unwrap();
        counter.restart(0);
        assert_eq!(counter.restart(0), 12);

        FakeBus {
            device: DEV.to_string(),
        }
        .with(|state| state.values.clear());

        assert_eq!(counter.restart(0), 12);
        assert_eq!(counter.restart(0), 12);
    }

    #[test]
    fn correlation_encodes_sensor_index() {
        const DEV: &str = "correlation";

        let mut counter = IpmiCounter::new(
            &group(&[("A", 10, 1), ("B", 11, 1), ("C", 12, 1)]),
            DEV,
            fake,
        );
        counter.init().unwrap();
        counter.restart(0);
        counter.restart(0);

        let requests = FakeBus {
            device: DEV.to_string(),
        }
        .with(|state| state.requests.clone());

        assert_eq!(requests.len(), 6);
        for (sensor, correlation) in requests {
            assert_eq!(sensor, 10 + (correlation & INDEX_MASK) as u8);
        }
    }

    #[test]
    fn oversized_group_is_truncated() {
        let sensors: Vec<(&str, u8, u64)> = (0..10).map(|i| ("S", i, 1)).collect();
        let counter = IpmiCounter::new(&group(&sensors), "big", fake);
        assert_eq!(counter.sensors().len(), MAX_SENSORS);
    }

    #[test]
    fn not_opened_reads_zero() {
        let mut counter = IpmiCounter::new(&group(&[("FAN1", 65, 1)]), "closed", fake);
        assert_eq!(counter.restart(0), 0);
    }
}
