// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! YAML configuration schema, loading/validation, and the hot-reload
//! contract (spec.md §6, §9 REDESIGN FLAGS; `config.py`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use mapping_engine::{ActionKind, DataType, GenericTemplate, MappingRule, RuleAction};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),
    #[error("invalid YAML in configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("device {0:?} must define a string 'type'")]
    MissingDeviceType(String),
    #[error("device {device:?} has unknown kind {kind:?}")]
    UnknownKind { device: String, kind: String },
    #[error("mappings reference unknown device {0:?}")]
    UnknownDevice(String),
    #[error("mapping rule #{idx} for {device:?} must include a non-empty 'pattern'")]
    MissingPattern { device: String, idx: usize },
    #[error("mapping rule #{idx} for {device:?} has an invalid pattern: {source}")]
    InvalidPattern { device: String, idx: usize, #[source] source: regex::Error },
    #[error("mapping rule #{idx} for {device:?} must include an 'action' or a 'response'")]
    MissingActionOrResponse { device: String, idx: usize },
    #[error("mapping rule #{idx} for {device:?} must include a 'request_format' or a 'response'")]
    MissingTemplateOrResponse { device: String, idx: usize },
    #[error("mapping rule #{idx} for {device:?} is missing required field 'address'")]
    MissingAddress { device: String, idx: usize },
    #[error("mapping rule #{idx} for {device:?}: {reason}")]
    InvalidRule { device: String, idx: usize, reason: String },
}

/// The eight closed backend-adapter kinds (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Loopback,
    ScpiTcp,
    ScpiSerial,
    Usbtmc,
    ModbusTcp,
    ModbusRtu,
    ModbusAscii,
    GenericRegex,
}

impl DeviceKind {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "loopback" => Some(Self::Loopback),
            "scpi-tcp" => Some(Self::ScpiTcp),
            "scpi-serial" => Some(Self::ScpiSerial),
            "usbtmc" => Some(Self::Usbtmc),
            "modbus-tcp" => Some(Self::ModbusTcp),
            "modbus-rtu" => Some(Self::ModbusRtu),
            "modbus-ascii" => Some(Self::ModbusAscii),
            "generic-regex" => Some(Self::GenericRegex),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::ScpiTcp => "scpi-tcp",
            Self::ScpiSerial => "scpi-serial",
            Self::Usbtmc => "usbtmc",
            Self::ModbusTcp => "modbus-tcp",
            Self::ModbusRtu => "modbus-rtu",
            Self::ModbusAscii => "modbus-ascii",
            Self::GenericRegex => "generic-regex",
        }
    }

    fn is_modbus(self) -> bool {
        matches!(self, Self::ModbusTcp | Self::ModbusRtu | Self::ModbusAscii)
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub portmapper_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 0, portmapper_enabled: false }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceDefinition {
    pub name: String,
    pub kind: DeviceKind,
    pub settings: serde_yaml::Value,
}

/// A fully loaded and validated gateway configuration
/// (`config.py:Config`, flattened into one owned value).
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub devices: HashMap<String, DeviceDefinition>,
    pub mappings: HashMap<String, Vec<MappingRule>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    devices: HashMap<String, serde_yaml::Mapping>,
    #[serde(default)]
    mappings: HashMap<String, Vec<RawRule>>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    portmapper_enabled: bool,
}

impl Default for RawServer {
    fn default() -> Self {
        Self { host: default_host(), port: 0, portmapper_enabled: false }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Deserialize)]
struct RawRule {
    pattern: String,
    action: Option<String>,
    #[serde(default)]
    params: serde_yaml::Mapping,
    response: Option<String>,
    request_format: Option<String>,
    #[serde(default)]
    expects_response: bool,
    response_regex: Option<String>,
    response_format: Option<String>,
    terminator: Option<String>,
    scale: Option<f64>,
    response_scale: Option<f64>,
    payload_width: Option<usize>,
}

fn yaml_str<'a>(map: &'a serde_yaml::Mapping, key: &str) -> Option<&'a str> {
    map.get(key).and_then(|v| v.as_str())
}

fn yaml_u64(map: &serde_yaml::Mapping, key: &str) -> Option<u64> {
    map.get(key).and_then(|v| v.as_u64())
}

fn yaml_f64(map: &serde_yaml::Mapping, key: &str) -> Option<f64> {
    map.get(key).and_then(|v| v.as_f64())
}

/// Loads and validates a configuration file from disk
/// (`config.py:load_config`).
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    tracing::debug!(path = %path.display(), "loading gateway configuration");
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
    parse_config_str(&text)
}

/// Parses and validates configuration from an in-memory YAML document
/// (`config.py:parse_config_dict`).
pub fn parse_config_str(text: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(text)?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let mut devices = HashMap::new();
    for (name, mut body) in raw.devices {
        let kind_tag = body
            .remove(serde_yaml::Value::String("type".to_string()))
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| ConfigError::MissingDeviceType(name.clone()))?;
        let kind = DeviceKind::parse(&kind_tag).ok_or_else(|| ConfigError::UnknownKind { device: name.clone(), kind: kind_tag.clone() })?;
        let settings = serde_yaml::Value::Mapping(body);
        devices.insert(name.clone(), DeviceDefinition { name, kind, settings });
    }

    let mut mappings = HashMap::new();
    for (device_name, rules) in raw.mappings {
        let device = devices.get(&device_name).ok_or_else(|| ConfigError::UnknownDevice(device_name.clone()))?;
        let mut compiled = Vec::with_capacity(rules.len());
        for (idx, rule) in rules.into_iter().enumerate() {
            compiled.push(compile_rule(device.kind, &device_name, idx, rule)?);
        }
        mappings.insert(device_name, compiled);
    }

    Ok(GatewayConfig {
        server: ServerSettings { host: raw.server.host, port: raw.server.port, portmapper_enabled: raw.server.portmapper_enabled },
        devices,
        mappings,
    })
}

fn compile_rule(kind: DeviceKind, device_name: &str, idx: usize, raw: RawRule) -> Result<MappingRule, ConfigError> {
    if raw.pattern.is_empty() {
        return Err(ConfigError::MissingPattern { device: device_name.to_string(), idx });
    }

    let has_action = raw.action.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    let has_response = raw.response.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
        || yaml_str(&raw.params, "response").map(|s| !s.is_empty()).unwrap_or(false);
    let has_template = raw.request_format.as_deref().map(|s| !s.is_empty()).unwrap_or(false);

    if kind.is_modbus() && !(has_action || has_response) {
        return Err(ConfigError::MissingActionOrResponse { device: device_name.to_string(), idx });
    }
    if kind == DeviceKind::GenericRegex && !(has_template || has_response) {
        return Err(ConfigError::MissingTemplateOrResponse { device: device_name.to_string(), idx });
    }

    let case_insensitive = kind.is_modbus();
    let pattern_source = if case_insensitive { format!("(?i){}", raw.pattern) } else { raw.pattern.clone() };
    let pattern = Regex::new(&pattern_source).map_err(|source| ConfigError::InvalidPattern { device: device_name.to_string(), idx, source })?;

    let action = if has_action {
        let kind_name = raw.action.as_deref().unwrap();
        let action_kind = ActionKind::parse(kind_name).map_err(|e| ConfigError::InvalidRule { device: device_name.to_string(), idx, reason: e.to_string() })?;
        let address = yaml_u64(&raw.params, "address")
            .ok_or_else(|| ConfigError::MissingAddress { device: device_name.to_string(), idx })? as u16;
        let count = yaml_u64(&raw.params, "count").unwrap_or(1) as u16;
        let data_type_name = yaml_str(&raw.params, "data_type").unwrap_or("uint16");
        let data_type = DataType::parse(data_type_name).map_err(|e| ConfigError::InvalidRule { device: device_name.to_string(), idx, reason: e.to_string() })?;
        let value_template = yaml_str(&raw.params, "value").map(|s| s.to_string());
        let scale = yaml_f64(&raw.params, "scale");
        let response_scale = yaml_f64(&raw.params, "response_scale");
        RuleAction::Modbus { kind: action_kind, address, count, value_template, data_type, scale, response_scale }
    } else if has_template {
        let response_regex = match &raw.response_regex {
            Some(source) => Some(Regex::new(source).map_err(|source| ConfigError::InvalidPattern { device: device_name.to_string(), idx, source })?),
            None => None,
        };
        let payload_width = raw.payload_width.or_else(|| {
            raw.response_regex.as_deref().and_then(|src| mapping_engine::infer_group_widths(src).get("payload").copied())
        });
        let payload_width = payload_width.or(if raw.scale.is_some() { Some(5) } else { None });
        RuleAction::GenericRegex(GenericTemplate {
            request_format: raw.request_format.clone().unwrap_or_default(),
            expects_response: raw.expects_response,
            response_regex,
            response_format: raw.response_format.clone(),
            terminator: raw.terminator.clone().or_else(|| if raw.expects_response { Some("\n".to_string()) } else { None }),
            scale: raw.scale,
            response_scale: raw.response_scale,
            payload_width,
        })
    } else if has_response {
        let response = raw.response.or_else(|| yaml_str(&raw.params, "response").map(|s| s.to_string())).unwrap();
        RuleAction::Static(response)
    } else {
        return Err(ConfigError::InvalidRule {
            device: device_name.to_string(),
            idx,
            reason: "rule is neither a MODBUS action, a generic-regex template, nor a static response".to_string(),
        });
    };

    Ok(MappingRule { pattern, action })
}

/// Capability implemented by the running core server so a future
/// configuration-reload surface can swap in a new [`GatewayConfig`]
/// without restarting the process (spec.md §9 REDESIGN FLAGS: replaces
/// `gui_server.py`'s `hasattr(facade, "reload_config")` reflective probe
/// with an explicit trait boundary).
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("configuration rejected: {0}")]
    Invalid(#[from] ConfigError),
    #[error("reload is not supported in this configuration")]
    Unsupported,
}

pub trait Reloadable {
    fn reload_config(&self, new_config: Arc<GatewayConfig>) -> Result<(), ReloadError>;
}
