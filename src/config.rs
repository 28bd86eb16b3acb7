//! YAML configuration model.
//!
//! ```yaml
//! name: dcs
//! point_prefix: cleanroom
//! global:
//!   lv: { set_voltage: 11.0 }
//! channels:
//!   "0": { module: M0, lv: { board: 0, chan: 0 }, hv: { board: 12, chan: 0, set_voltage: 300 } }
//! ```

use crate::channel::{ChannelIdentity, StatusCodes};
use crate::devices::supply::resolve_attribute;
use crate::devices::{DeviceAddress, PointValue, Stage};
use crate::error::{DcsError, DcsResult};
use crate::protocol::SetpointLimits;
use crate::registers::RegisterKind;
use crate::telemetry::PublishConfig;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_FLEET_NAME: &str = "dcs";
pub const DEFAULT_POINT_PREFIX: &str = "cleanroom";
pub const DEFAULT_COOLING_NAME: &str = "marta";
pub const DEFAULT_CHILLER_NAME: &str = "julabo";

/// Registers the cooling unit driver cannot run without.
pub const REQUIRED_COOLING_REGISTERS: [&str; 4] = ["status", "set_start_chiller", "set_start_co2", "set_alarm_reset"];

/// Produces a fresh configuration on every call (startup and each reload).
pub type ConfigLoader = Box<dyn FnMut() -> DcsResult<DcsConfig> + Send>;

fn default_name() -> String {
    DEFAULT_FLEET_NAME.to_string()
}

fn default_prefix() -> String {
    DEFAULT_POINT_PREFIX.to_string()
}

fn default_cooling_name() -> String {
    DEFAULT_COOLING_NAME.to_string()
}

fn default_chiller_name() -> String {
    DEFAULT_CHILLER_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DcsConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_prefix")]
    pub point_prefix: String,
    #[serde(default)]
    pub status_codes: StatusCodes,
    #[serde(default)]
    pub limits: SetpointLimits,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub global: StageDefaults,
    #[serde(default, deserialize_with = "deserialize_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub cooling: Option<CoolingConfig>,
    #[serde(default)]
    pub chiller: Option<ChillerConfig>,
}

/// A configured attribute default: a number, a `0b`/`0x` literal or a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn to_point_value(&self) -> DcsResult<PointValue> {
        match self {
            AttributeValue::Number(v) => Ok(PointValue::Number(*v)),
            AttributeValue::Text(t) => {
                let radix = if let Some(digits) = t.strip_prefix("0b") {
                    Some((digits, 2))
                } else {
                    t.strip_prefix("0x").map(|digits| (digits, 16))
                };
                match radix {
                    Some((digits, radix)) => i64::from_str_radix(digits, radix)
                        .map(|v| PointValue::Number(v as f64))
                        .map_err(|e| DcsError::config(format!("invalid literal '{}': {}", t, e))),
                    None => Ok(PointValue::Text(t.clone())),
                }
            }
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageDefaults {
    pub lv: Attributes,
    pub hv: Attributes,
}

impl StageDefaults {
    pub fn stage(&self, stage: Stage) -> &Attributes {
        match stage {
            Stage::Lv => &self.lv,
            Stage::Hv => &self.hv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub board: u8,
    pub chan: u8,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl DeviceConfig {
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.board, self.chan)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    pub module: Option<String>,
    pub lv: DeviceConfig,
    pub hv: DeviceConfig,
}

impl ChannelConfig {
    pub fn identity(&self) -> ChannelIdentity {
        ChannelIdentity {
            id: self.id.clone(),
            module: self.module.clone(),
            lv: self.lv.address(),
            hv: self.hv.address(),
        }
    }

    pub fn device(&self, stage: Stage) -> &DeviceConfig {
        match stage {
            Stage::Lv => &self.lv,
            Stage::Hv => &self.hv,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelEntry {
    #[serde(default)]
    module: Option<String>,
    lv: DeviceConfig,
    hv: DeviceConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelKey {
    Int(i64),
    Text(String),
}

/// Channels are a mapping keyed by id; document order is kept.
fn deserialize_channels<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ChannelConfig>, D::Error> {
    struct ChannelsVisitor;

    impl<'de> Visitor<'de> for ChannelsVisitor {
        type Value = Vec<ChannelConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of channel id to channel definition")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut channels = Vec::new();
            while let Some(key) = map.next_key::<ChannelKey>()? {
                let entry: ChannelEntry = map.next_value()?;
                let id = match key {
                    ChannelKey::Int(i) => i.to_string(),
                    ChannelKey::Text(s) => s,
                };
                channels.push(ChannelConfig {
                    id,
                    module: entry.module,
                    lv: entry.lv,
                    hv: entry.hv,
                });
            }
            Ok(channels)
        }

        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_map(ChannelsVisitor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Int,
    Bool,
    Float32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    pub address: u16,
    #[serde(rename = "type", default = "RegisterConfig::default_type")]
    pub kind: RegisterType,
    #[serde(default)]
    pub bit: Option<u8>,
    /// Writable ("input" to the plant).
    #[serde(default)]
    pub input: bool,
}

impl RegisterConfig {
    fn default_type() -> RegisterType {
        RegisterType::Int
    }

    pub fn register_kind(&self, name: &str) -> DcsResult<RegisterKind> {
        match (self.kind, self.bit) {
            (RegisterType::Int, None) => Ok(RegisterKind::Int16),
            (RegisterType::Float32, None) => Ok(RegisterKind::Float32),
            (RegisterType::Bool, Some(bit)) if bit < 16 => Ok(RegisterKind::Bool { bit }),
            (RegisterType::Bool, Some(bit)) => Err(DcsError::config(format!("register '{}': bit {} out of range", name, bit))),
            (RegisterType::Bool, None) => Err(DcsError::config(format!("register '{}': bool requires 'bit'", name))),
            (_, Some(_)) => Err(DcsError::config(format!("register '{}': 'bit' only applies to bool", name))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoolingConfig {
    #[serde(default = "default_cooling_name")]
    pub name: String,
    #[serde(default)]
    pub max_chunk_len: Option<u16>,
    pub registers: BTreeMap<String, RegisterConfig>,
    #[serde(default)]
    pub alarm_codes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChillerConfig {
    #[serde(default = "default_chiller_name")]
    pub name: String,
}

impl Default for ChillerConfig {
    fn default() -> Self {
        Self { name: default_chiller_name() }
    }
}

impl DcsConfig {
    pub fn from_yaml_str(yaml: &str) -> DcsResult<Self> {
        let config: DcsConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DcsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DcsError::config(format!("reading {}: {}", path.display(), e)))?;
        let config = Self::from_yaml_str(&text)?;
        info!(path = %path.display(), channels = config.channels.len(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> DcsResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(DcsError::config(format!("invalid fleet name '{}'", self.name)));
        }
        if self.publish.refresh_ticks == 0 || self.publish.tick_ms == 0 {
            return Err(DcsError::config("publish.refresh_ticks and publish.tick_ms must be positive"));
        }
        self.limits.validate()?;

        for stage in [Stage::Lv, Stage::Hv] {
            validate_attributes(stage, self.global.stage(stage), "global")?;
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id.as_str()) {
                return Err(DcsError::config(format!("duplicate channel id '{}'", channel.id)));
            }
            if channel.module.as_deref() == Some("") {
                return Err(DcsError::config(format!("channel '{}': empty module name", channel.id)));
            }
            for stage in [Stage::Lv, Stage::Hv] {
                let device = channel.device(stage);
                device
                    .address()
                    .validate(stage)
                    .map_err(|e| DcsError::config(format!("channel '{}': {}", channel.id, e)))?;
                validate_attributes(stage, &device.attributes, &channel.id)?;
            }
        }

        if let Some(cooling) = &self.cooling {
            cooling.validate()?;
        }
        Ok(())
    }

    /// Global defaults overlaid with the channel's own, converted to point values.
    pub fn merged_attributes(&self, channel: &ChannelConfig, stage: Stage) -> DcsResult<Vec<(String, PointValue)>> {
        let mut merged = self.global.stage(stage).clone();
        merged.extend(channel.device(stage).attributes.clone());
        merged
            .into_iter()
            .map(|(name, value)| Ok((name, value.to_point_value()?)))
            .collect()
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}

fn validate_attributes(stage: Stage, attributes: &Attributes, owner: &str) -> DcsResult<()> {
    for (name, value) in attributes {
        let value = value.to_point_value()?;
        resolve_attribute(stage, name, &value).map_err(|e| DcsError::config(format!("{}: {}", owner, e)))?;
    }
    Ok(())
}

impl CoolingConfig {
    pub fn validate(&self) -> DcsResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(DcsError::config(format!("invalid cooling unit name '{}'", self.name)));
        }
        for required in REQUIRED_COOLING_REGISTERS {
            if !self.registers.contains_key(required) {
                return Err(DcsError::config(format!("cooling unit: missing required register '{}'", required)));
            }
        }
        for (name, register) in &self.registers {
            register.register_kind(name)?;
        }
        for register in self.alarm_codes.keys() {
            if !self.registers.contains_key(register) {
                return Err(DcsError::config(format!("alarm code names unknown register '{}'", register)));
            }
        }
        if self.max_chunk_len == Some(0) {
            return Err(DcsError::config("cooling.max_chunk_len must be positive"));
        }
        Ok(())
    }
}

/// Loader that re-reads `path` on every call.
pub fn file_loader(path: impl Into<PathBuf>) -> ConfigLoader {
    let path = path.into();
    Box::new(move || DcsConfig::from_file(&path))
}

/// Loader that always returns the same configuration.
pub fn static_loader(config: DcsConfig) -> ConfigLoader {
    Box::new(move || Ok(config.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
name: tracker
global:
  lv: { set_voltage: 11.0 }
  hv: { trip_mode: Kill }
channels:
  "7": { module: M7, lv: { board: 0, chan: 1 }, hv: { board: 12, chan: 3, set_voltage: 300 } }
  2: { lv: { board: 1, chan: 0 }, hv: { board: 13, chan: 0 } }
"#;

    #[test]
    fn test_parse_keeps_channel_order() {
        let config = DcsConfig::from_yaml_str(BASIC).unwrap();
        assert_eq!(config.name, "tracker");
        assert_eq!(config.point_prefix, "cleanroom");
        let ids: Vec<_> = config.channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["7", "2"]);
        assert_eq!(config.channels[0].module.as_deref(), Some("M7"));
        assert_eq!(config.channels[1].module, None);
        assert_eq!(config.publish.refresh_ticks, 600);
    }

    #[test]
    fn test_merged_attributes_prefer_channel() {
        let config = DcsConfig::from_yaml_str(BASIC).unwrap();
        let merged = config.merged_attributes(&config.channels[0], Stage::Hv).unwrap();
        assert!(merged.contains(&("set_voltage".to_string(), PointValue::Number(300.0))));
        assert!(merged.contains(&("trip_mode".to_string(), PointValue::text("Kill"))));
    }

    #[test]
    fn test_binary_and_hex_literals() {
        assert_eq!(
            AttributeValue::Text("0b101".into()).to_point_value().unwrap(),
            PointValue::Number(5.0)
        );
        assert_eq!(
            AttributeValue::Text("0x1F".into()).to_point_value().unwrap(),
            PointValue::Number(31.0)
        );
        assert!(AttributeValue::Text("0xZZ".into()).to_point_value().is_err());
    }

    #[test]
    fn test_rejects_bad_channels() {
        let dup = "channels:\n  1: { lv: { board: 0, chan: 0 }, hv: { board: 12, chan: 0 } }\n  \"1\": { lv: { board: 0, chan: 1 }, hv: { board: 12, chan: 1 } }\n";
        assert!(matches!(DcsConfig::from_yaml_str(dup), Err(DcsError::Configuration(_))));

        let empty_module = "channels:\n  1: { module: '', lv: { board: 0, chan: 0 }, hv: { board: 12, chan: 0 } }\n";
        assert!(DcsConfig::from_yaml_str(empty_module).is_err());

        let bad_address = "channels:\n  1: { lv: { board: 9, chan: 0 }, hv: { board: 12, chan: 0 } }\n";
        assert!(DcsConfig::from_yaml_str(bad_address).is_err());

        let bad_attribute = "channels:\n  1: { lv: { board: 0, chan: 0, warp_factor: 9 }, hv: { board: 12, chan: 0 } }\n";
        assert!(DcsConfig::from_yaml_str(bad_attribute).is_err());
    }

    #[test]
    fn test_cooling_requires_registers() {
        let yaml = r#"
cooling:
  registers:
    status: { address: 0 }
    set_start_chiller: { address: 10, type: bool, bit: 0, input: true }
    set_start_co2: { address: 10, type: bool, bit: 1, input: true }
"#;
        let err = DcsConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("set_alarm_reset"));
    }

    #[test]
    fn test_alarm_code_must_name_register() {
        let yaml = r#"
cooling:
  registers:
    status: { address: 0 }
    set_start_chiller: { address: 10, type: bool, bit: 0, input: true }
    set_start_co2: { address: 10, type: bool, bit: 1, input: true }
    set_alarm_reset: { address: 10, type: bool, bit: 2, input: true }
  alarm_codes: { alarm_flow: "Flow too low" }
"#;
        assert!(DcsConfig::from_yaml_str(yaml).is_err());
    }
}
