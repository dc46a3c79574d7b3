use crate::agent::control::period_in_range;
use crate::agent::counters::ipmi::MAX_SENSORS;
use crate::agent::counters::MAX_NAME_LEN;

use ringlog::Level;
use serde::{Deserialize, Serialize};

use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    counters: Counters,
    #[serde(default)]
    perf: Perf,
    #[serde(default)]
    msr: Msr,
    #[serde(default)]
    ipmi: Ipmi,
}

impl Config {
    pub fn load(path: &dyn AsRef<Path>) -> Result<Self, String> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| format!("unable to open config file: {e}"))?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| format!("unable to read config file: {e}"))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: Config =
            toml::from_str(content).map_err(|e| format!("failed to parse config file: {e}"))?;

        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        self.general.check()?;

        let mut named = Vec::new();
        named.extend(self.perf.raw.iter().map(|e| e.name.as_str()));
        named.extend(self.ipmi.group.iter().map(|g| g.name.as_str()));

        for name in named
            .iter()
            .copied()
            .chain(self.counters.enabled.iter().map(|n| n.as_str()))
        {
            check_name("counter", name)?;
        }

        for group in &self.ipmi.group {
            if group.sensors.is_empty() || group.sensors.len() > MAX_SENSORS {
                return Err(format!(
                    "ipmi group {} must have 1 to {MAX_SENSORS} sensors",
                    group.name
                ));
            }

            for sensor in &group.sensors {
                check_name("sensor", &sensor.name)?;
            }
        }

        Ok(())
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn perf(&self) -> &Perf {
        &self.perf
    }

    pub fn msr(&self) -> &Msr {
        &self.msr
    }

    pub fn ipmi(&self) -> &Ipmi {
        &self.ipmi
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One engine sampling every online processor.
    #[default]
    Global,
    /// One engine per NUMA node, pinned to that node.
    Numa,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "listen")]
    listen: SocketAddr,
    #[serde(default)]
    mode: Mode,
    #[serde(default = "capacity")]
    capacity: usize,
    #[serde(default = "period")]
    period: u64,
    #[serde(default)]
    autostart: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            listen: listen(),
            mode: Mode::default(),
            capacity: capacity(),
            period: period(),
            autostart: false,
        }
    }
}

impl General {
    fn check(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("general.capacity must be greater than zero".into());
        }

        if !period_in_range(self.period) {
            return Err(format!(
                "general.period {} ms is outside the accepted range",
                self.period
            ));
        }

        Ok(())
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Initial sampling period in milliseconds.
    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn autostart(&self) -> bool {
        self.autostart
    }
}

fn listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4241))
}

fn capacity() -> usize {
    256
}

fn period() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Log {
    #[serde(with = "LevelDef")]
    #[serde(default = "log_level")]
    level: Level,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: log_level() }
    }
}

impl Log {
    pub fn level(&self) -> Level {
        self.level
    }
}

fn log_level() -> Level {
    Level::Info
}

#[derive(Serialize, Deserialize)]
#[serde(remote = "Level")]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "lowercase")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// The middle of every registry. `ts` and `intv` are always placed first and
/// `oh` last.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Counters {
    #[serde(default = "enabled")]
    enabled: Vec<String>,
}

impl Default for Counters {
    fn default() -> Self {
        Self { enabled: enabled() }
    }
}

impl Counters {
    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }
}

fn enabled() -> Vec<String> {
    ["cyc", "inst", "llcref", "llcmiss", "br", "brmiss", "l2lin", "temp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Perf {
    #[serde(default)]
    raw: Vec<RawEvent>,
}

impl Perf {
    pub fn raw(&self) -> &[RawEvent] {
        &self.raw
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEvent {
    pub name: String,
    pub config: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Msr {
    #[serde(default)]
    temp_detail: bool,
}

impl Msr {
    pub fn temp_detail(&self) -> bool {
        self.temp_detail
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ipmi {
    #[serde(default = "ipmi_device")]
    device: String,
    #[serde(default)]
    group: Vec<SensorGroup>,
}

impl Default for Ipmi {
    fn default() -> Self {
        Self {
            device: ipmi_device(),
            group: Vec::new(),
        }
    }
}

impl Ipmi {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn groups(&self) -> &[SensorGroup] {
        &self.group
    }
}

fn ipmi_device() -> String {
    "/dev/ipmi0".into()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorGroup {
    pub name: String,
    pub sensors: Vec<SensorConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub name: String,
    pub number: u8,
    #[serde(default = "mul")]
    pub mul: u64,
}

fn mul() -> u64 {
    1
}

/// Names are written unescaped into sample records.
fn check_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!("{kind} name {name:?} must be 1 to {MAX_NAME_LEN} bytes"));
    }

    if name.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
        return Err(format!(
            "{kind} name {name:?} must not contain quotes, backslashes or control characters"
        ));
    }

    Ok(())
}
