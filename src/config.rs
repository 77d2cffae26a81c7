//! Configuration surface: bus parameters, named devices, causation graph
//!
//! The core consumes this once at startup. All name resolution and
//! structural validation happens here, eagerly, so a bad configuration is a
//! fatal diagnostic before the control loop ever touches the bus.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::constants::defaults;
use crate::control::Causation;
use crate::modbus::bus::BusOptions;
use crate::modbus::serial::{Parity, SerialSettings, StopBits};
use crate::registry::{Point, PointKind, PointTable, RegistryError};
use crate::rules::Rule;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    ReadFile(#[from] std::io::Error),

    #[error("could not parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("stop_bits must be 1 or 2, got {0}")]
    InvalidStopBits(u8),

    #[error("backoff range inverted: {0}ms > {1}ms")]
    InvertedBackoff(u64, u64),

    #[error("response_timeout_ms must be greater than zero")]
    ZeroResponseTimeout,

    #[error("poll_interval_s must be greater than zero")]
    ZeroPollInterval,

    #[error("period window empty: start {0}s >= stop {1}s")]
    EmptyPeriodWindow(u64, u64),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub devices: BTreeMap<String, DeviceConfig>,
    #[serde(default)]
    pub causations: Vec<CausationConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub port: String,
    pub baud: u32,
    #[serde(default)]
    pub parity: ParityConfig,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: (u64, u64),
    #[serde(default = "default_fatal_io_threshold")]
    pub fatal_io_threshold: u32,
    #[serde(default)]
    pub check_echo: bool,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
}

/// The Modbus serial line default is even parity.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    #[default]
    Even,
    Odd,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub slave: u8,
    pub points: BTreeMap<String, PointConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointConfig {
    pub kind: PointKindConfig,
    pub offset: u16,
    #[serde(default)]
    pub signed: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointKindConfig {
    Coil,
    DiscreteInput,
    HoldingRegister,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CausationConfig {
    pub when: RuleSpec,
    /// Qualified name of the coil to drive off when `when` holds.
    pub then_off: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSpec {
    Active {
        point: String,
    },
    Equals {
        point: String,
        value: i32,
    },
    Range {
        point: String,
        #[serde(default)]
        low: Option<i32>,
        #[serde(default)]
        high: Option<i32>,
    },
    And(Vec<RuleSpec>),
    Or(Vec<RuleSpec>),
    Not(Box<RuleSpec>),
    Period {
        source: Box<RuleSpec>,
        start_s: u64,
        stop_s: u64,
    },
}

impl Config {
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Config>(raw).map_err(Into::into)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::from_str(&std::fs::read_to_string(path)?)
    }

    /// Build the point table, enforcing address and naming invariants.
    pub fn point_table(&self) -> Result<PointTable, ConfigError> {
        let mut table = PointTable::new();
        for (device_name, device) in &self.devices {
            for (point_name, point) in &device.points {
                let kind = match point.kind {
                    PointKindConfig::Coil => PointKind::Coil,
                    PointKindConfig::DiscreteInput => PointKind::DiscreteInput,
                    PointKindConfig::HoldingRegister => PointKind::HoldingRegister,
                };
                table.add_point(
                    device_name,
                    point_name,
                    Point {
                        slave: device.slave,
                        kind,
                        offset: point.offset,
                        signed: point.signed,
                    },
                )?;
            }
        }
        Ok(table)
    }

    /// Resolve the causation graph against an already-built point table.
    pub fn build_causations(&self, table: &PointTable) -> Result<Vec<Causation>, ConfigError> {
        self.causations
            .iter()
            .map(|causation| {
                let rule = causation.when.build(table)?;
                let target = table.resolve(&causation.then_off)?;
                Causation::new(rule, target, table).map_err(Into::into)
            })
            .collect()
    }

    /// Full structural validation, without touching any hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let table = self.point_table()?;
        self.build_causations(&table)?;
        self.bus.serial_settings()?;
        self.bus.bus_options()?;
        self.bus.poll_interval()?;
        Ok(())
    }
}

impl BusConfig {
    pub fn serial_settings(&self) -> Result<SerialSettings, ConfigError> {
        let parity = match self.parity {
            ParityConfig::None => Parity::None,
            ParityConfig::Even => Parity::Even,
            ParityConfig::Odd => Parity::Odd,
        };
        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(ConfigError::InvalidStopBits(other)),
        };
        Ok(SerialSettings {
            port: self.port.clone(),
            baud: self.baud,
            parity,
            stop_bits,
        })
    }

    pub fn bus_options(&self) -> Result<BusOptions, ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ZeroResponseTimeout);
        }
        let (min, max) = self.backoff_ms;
        if min > max {
            return Err(ConfigError::InvertedBackoff(min, max));
        }
        Ok(BusOptions {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            max_retries: self.max_retries,
            backoff: (Duration::from_millis(min), Duration::from_millis(max)),
            fatal_io_threshold: self.fatal_io_threshold,
            check_echo: self.check_echo,
        })
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        if self.poll_interval_s == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(Duration::from_secs(self.poll_interval_s))
    }
}

impl RuleSpec {
    fn build(&self, table: &PointTable) -> Result<Rule, ConfigError> {
        let rule = match self {
            RuleSpec::Active { point } => Rule::Active(table.resolve(point)?),
            RuleSpec::Equals { point, value } => Rule::Equals(table.resolve(point)?, *value),
            RuleSpec::Range { point, low, high } => Rule::Range {
                point: table.resolve(point)?,
                low: *low,
                high: *high,
            },
            RuleSpec::And(children) => Rule::And(
                children
                    .iter()
                    .map(|child| child.build(table))
                    .collect::<Result<_, _>>()?,
            ),
            RuleSpec::Or(children) => Rule::Or(
                children
                    .iter()
                    .map(|child| child.build(table))
                    .collect::<Result<_, _>>()?,
            ),
            RuleSpec::Not(child) => Rule::Not(Box::new(child.build(table)?)),
            RuleSpec::Period {
                source,
                start_s,
                stop_s,
            } => {
                if start_s >= stop_s {
                    return Err(ConfigError::EmptyPeriodWindow(*start_s, *stop_s));
                }
                Rule::period(
                    source.build(table)?,
                    Duration::from_secs(*start_s),
                    Duration::from_secs(*stop_s),
                )
            }
        };
        Ok(rule)
    }
}

fn default_stop_bits() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    defaults::RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_backoff_ms() -> (u64, u64) {
    (
        defaults::BACKOFF_MIN.as_millis() as u64,
        defaults::BACKOFF_MAX.as_millis() as u64,
    )
}

fn default_fatal_io_threshold() -> u32 {
    defaults::FATAL_IO_THRESHOLD
}

fn default_poll_interval_s() -> u64 {
    defaults::POLL_INTERVAL.as_secs()
}
