use anyhow::Result;
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use serde::{de::Visitor, Deserialize, Deserializer};
use std::{collections::HashMap, path::PathBuf, str::FromStr};
use tracing::Level;

const LOG_LEVELS: [&str; 5] = ["DEBUG", "ERROR", "INFO", "TRACE", "WARN"];

struct LevelVisitor;

impl<'de> Visitor<'de> for LevelVisitor {
    type Value = Level;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .write_str("Expecting a number 1-5 or ")
            .and(formatter.write_str(&LOG_LEVELS.join(",")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        FromStr::from_str(v).map_err(|_| E::unknown_variant(v, &LOG_LEVELS))
    }
}

pub fn deserialize_level<'de, D>(de: D) -> Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    de.deserialize_string(LevelVisitor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Serial {
    pub device: PathBuf,
    pub baudrate: u32,
    pub flow_control: FlowControl,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: Serial,
    /// Configuration values pushed to the NCP after every reset,
    /// keyed by `EZSP_CONFIG_*` name.
    pub ezsp_config: HashMap<String, u16>,
    /// Policy decisions pushed to the NCP after every reset,
    /// keyed by `EZSP_POLICY_*` name.
    pub ezsp_policies: HashMap<String, String>,
    #[serde(deserialize_with = "deserialize_level")]
    pub loglevel: Level,
}

impl Settings {
    pub fn new() -> Result<Settings> {
        let reader = ConfigBuilder::<DefaultState>::default()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::default())
            .build()?;

        Ok(reader.try_deserialize()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            serial: Default::default(),
            ezsp_config: HashMap::new(),
            ezsp_policies: HashMap::new(),
            loglevel: Level::INFO,
        }
    }
}

impl Default for Serial {
    fn default() -> Self {
        Serial {
            device: PathBuf::from("/dev/ttyUSB0"),
            baudrate: 57600,
            flow_control: FlowControl::Software,
        }
    }
}
