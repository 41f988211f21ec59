// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command translation: turns an ASCII command line into either a MODBUS
//! action or a textual request/response exchange (spec.md §4.6, C6).
//!
//! Every device's mapping rules are matched against the incoming command
//! in order; the first matching rule wins. A rule's shape is one of
//! [`RuleAction::Modbus`], [`RuleAction::GenericRegex`] or
//! [`RuleAction::Static`] (mirrors `mapping_engine.py`'s `ACTION_MAP` plus
//! `generic_regex.py`'s template engine, unified into one crate per
//! SPEC_FULL.md §A).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no mapping rule matched command: {0:?}")]
    NoMatch(String),
    #[error("invalid mapping rule: {0}")]
    InvalidRule(String),
    #[error("failed to encode value: {0}")]
    Encoding(String),
    #[error("failed to decode response: {0}")]
    Decoding(String),
}

/// MODBUS function codes used by [`ModbusAction`] (spec.md §4.6.1).
pub mod function_code {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0f;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Named action kinds that appear in a mapping rule's `action:` field,
/// each bound to a function code and a read/write direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteHoldingRegisters,
}

impl ActionKind {
    pub fn parse(name: &str) -> Result<Self, MappingError> {
        match name {
            "read_coils" => Ok(Self::ReadCoils),
            "read_discrete_inputs" => Ok(Self::ReadDiscreteInputs),
            "read_holding_registers" => Ok(Self::ReadHoldingRegisters),
            "read_input_registers" => Ok(Self::ReadInputRegisters),
            "write_single_coil" => Ok(Self::WriteSingleCoil),
            "write_single_register" => Ok(Self::WriteSingleRegister),
            "write_multiple_coils" => Ok(Self::WriteMultipleCoils),
            "write_holding_registers" => Ok(Self::WriteHoldingRegisters),
            other => Err(MappingError::InvalidRule(format!("unknown action {other:?}"))),
        }
    }

    pub fn function_code(self) -> u8 {
        match self {
            Self::ReadCoils => function_code::READ_COILS,
            Self::ReadDiscreteInputs => function_code::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => function_code::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => function_code::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => function_code::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => function_code::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => function_code::WRITE_MULTIPLE_COILS,
            Self::WriteHoldingRegisters => function_code::WRITE_HOLDING_REGISTERS,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil | Self::WriteSingleRegister | Self::WriteMultipleCoils | Self::WriteHoldingRegisters
        )
    }
}

/// Register/coil encoding used by a MODBUS mapping rule (spec.md §4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Uint16,
    Int16,
    Uint32Be,
    Uint32Le,
    Float32Be,
    Float32Le,
    Bool,
}

impl DataType {
    pub fn parse(name: &str) -> Result<Self, MappingError> {
        match name {
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32_be" => Ok(Self::Uint32Be),
            "uint32_le" => Ok(Self::Uint32Le),
            "float32_be" => Ok(Self::Float32Be),
            "float32_le" => Ok(Self::Float32Le),
            "bool" => Ok(Self::Bool),
            other => Err(MappingError::InvalidRule(format!("unknown data_type {other:?}"))),
        }
    }

    /// Number of 16-bit registers this type occupies.
    pub fn register_width(self) -> u16 {
        match self {
            Self::Uint16 | Self::Int16 | Self::Bool => 1,
            Self::Uint32Be | Self::Uint32Le | Self::Float32Be | Self::Float32Le => 2,
        }
    }
}

/// A fully resolved MODBUS action ready for a `drv/modbus-*` adapter to
/// encode onto the wire (spec.md §4.6.1, `mapping_engine.py:ModbusAction`).
#[derive(Debug, Clone)]
pub struct ModbusAction {
    pub function_code: u8,
    pub address: u16,
    pub count: u16,
    /// Register values to write; empty for read actions.
    pub values: Vec<u16>,
    pub data_type: DataType,
    pub response_scale: Option<f64>,
}

/// Encodes `raw` (a decimal or boolean literal, already `$n`-substituted)
/// into the register value(s) `data_type` requires, applying `scale` to
/// the input before truncating to an integer register value
/// (`mapping_engine.py:encode_value`).
pub fn encode_value(raw: &str, data_type: DataType, scale: Option<f64>) -> Result<Vec<u16>, MappingError> {
    if data_type == DataType::Bool {
        let on = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on");
        return Ok(vec![if on { 0xff00 } else { 0x0000 }]);
    }

    let parsed: f64 = raw
        .trim()
        .parse()
        .map_err(|_| MappingError::Encoding(format!("{raw:?} is not numeric")))?;
    let scaled = parsed * scale.unwrap_or(1.0);

    match data_type {
        DataType::Uint16 => {
            let v = scaled.round() as i64;
            if !(0..=0xffff).contains(&v) {
                return Err(MappingError::Encoding(format!("{v} out of range for uint16")));
            }
            Ok(vec![v as u16])
        }
        DataType::Int16 => {
            let v = scaled.round() as i64;
            if !(-32768..=32767).contains(&v) {
                return Err(MappingError::Encoding(format!("{v} out of range for int16")));
            }
            Ok(vec![(v as i16) as u16])
        }
        DataType::Uint32Be | DataType::Uint32Le => {
            let v = scaled.round() as i64;
            if !(0..=0xffff_ffff).contains(&v) {
                return Err(MappingError::Encoding(format!("{v} out of range for uint32")));
            }
            let v = v as u32;
            let (hi, lo) = ((v >> 16) as u16, (v & 0xffff) as u16);
            Ok(if data_type == DataType::Uint32Be { vec![hi, lo] } else { vec![lo, hi] })
        }
        DataType::Float32Be | DataType::Float32Le => {
            let bits = (scaled as f32).to_bits();
            let (hi, lo) = ((bits >> 16) as u16, (bits & 0xffff) as u16);
            Ok(if data_type == DataType::Float32Be { vec![hi, lo] } else { vec![lo, hi] })
        }
        DataType::Bool => unreachable!(),
    }
}

/// Decodes register contents read from the wire back into a human value,
/// applying `response_scale` as a divisor (`mapping_engine.py:decode_registers`).
pub fn decode_registers(regs: &[u16], data_type: DataType, response_scale: Option<f64>) -> Result<String, MappingError> {
    let scale = response_scale.unwrap_or(1.0);
    let is_float_type = matches!(data_type, DataType::Float32Be | DataType::Float32Le);
    // Floats with no explicit scale format with a fixed six decimal places,
    // matching `modbus_tcp.py`'s `f"{result:.6f}"` formatting of Python floats.
    let decimals = match response_scale {
        Some(s) => decimal_places(s),
        None if is_float_type => Some(6),
        None => None,
    };

    let raw: f64 = match data_type {
        DataType::Bool => {
            let on = regs.first().copied().unwrap_or(0) != 0;
            return Ok(if on { "1".to_string() } else { "0".to_string() });
        }
        DataType::Uint16 => *regs.first().ok_or_else(|| MappingError::Decoding("missing register".into()))? as f64,
        DataType::Int16 => (*regs.first().ok_or_else(|| MappingError::Decoding("missing register".into()))? as i16) as f64,
        DataType::Uint32Be => {
            let [hi, lo] = two_registers(regs)?;
            (((hi as u32) << 16) | lo as u32) as f64
        }
        DataType::Uint32Le => {
            let [lo, hi] = two_registers(regs)?;
            (((hi as u32) << 16) | lo as u32) as f64
        }
        DataType::Float32Be => {
            let [hi, lo] = two_registers(regs)?;
            f32::from_bits(((hi as u32) << 16) | lo as u32) as f64
        }
        DataType::Float32Le => {
            let [lo, hi] = two_registers(regs)?;
            f32::from_bits(((hi as u32) << 16) | lo as u32) as f64
        }
    };

    let scaled = raw / scale;
    Ok(match decimals {
        Some(d) => format!("{scaled:.d$}", d = d),
        None => scaled.to_string(),
    })
}

fn two_registers(regs: &[u16]) -> Result<[u16; 2], MappingError> {
    if regs.len() < 2 {
        return Err(MappingError::Decoding("expected two registers".into()));
    }
    Ok([regs[0], regs[1]])
}

/// If `scale` is a positive power of ten, the number of decimal places a
/// formatted result should carry; otherwise `None` (free-form `to_string`).
fn decimal_places(scale: f64) -> Option<usize> {
    if scale <= 0.0 {
        return None;
    }
    let log10 = scale.log10();
    if (log10.round() - log10).abs() < 1e-9 {
        Some(log10.round() as usize)
    } else {
        None
    }
}

/// An ASCII request/response template pair for a non-MODBUS device
/// (`generic_regex.py:_CompiledRule`).
#[derive(Debug, Clone)]
pub struct GenericTemplate {
    pub request_format: String,
    pub expects_response: bool,
    pub response_regex: Option<Regex>,
    pub response_format: Option<String>,
    pub terminator: Option<String>,
    pub scale: Option<f64>,
    pub response_scale: Option<f64>,
    pub payload_width: Option<usize>,
}

/// A fully compiled mapping rule: a command pattern paired with one of
/// the three action shapes a rule may take (spec.md §4.6).
#[derive(Clone)]
pub struct MappingRule {
    pub pattern: Regex,
    pub action: RuleAction,
}

#[derive(Clone)]
pub enum RuleAction {
    Modbus { kind: ActionKind, address: u16, count: u16, value_template: Option<String>, data_type: DataType, scale: Option<f64>, response_scale: Option<f64> },
    GenericRegex(GenericTemplate),
    Static(String),
}

fn token_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$(\w+)|\$\{(\w+)\}").unwrap())
}

/// Finds the first rule in `rules` whose pattern matches the **entire**
/// `command`, returning the rule and its capture groups (`mapping_engine.py`
/// `regex.match(cmd)` / `generic_regex.py:_match_rule`: first match wins,
/// order is significant, and a match anchored only at the start but not
/// consuming the whole command does not count — a rule's pattern need not
/// carry its own `^`/`$` anchors for this to hold).
pub fn match_rule<'a>(command: &str, rules: &'a [MappingRule]) -> Result<(&'a MappingRule, Captures<'a>), MappingError> {
    for rule in rules {
        if let Some(captures) = rule.pattern.captures(command) {
            let whole = captures.get(0).expect("capture group 0 always present on a match");
            if whole.start() == 0 && whole.end() == command.len() {
                return Ok((rule, captures));
            }
        }
    }
    Err(MappingError::NoMatch(command.to_string()))
}

/// Substitutes `$n` (1-based positional) and `${name}` tokens in
/// `template` with the corresponding capture group from `captures`.
/// `scale_numeric`, when `Some`, is applied to the captured value before
/// it is rendered (used for MODBUS `value:` templates and generic-regex
/// request-side scaling); `width` zero-pads the scaled integer.
pub fn render_template(template: &str, captures: &Captures<'_>, scale_numeric: Option<f64>, width: Option<usize>) -> Result<String, MappingError> {
    let mut err: Option<MappingError> = None;
    let rendered = token_pattern().replace_all(template, |m: &Captures| {
        if err.is_some() {
            return String::new();
        }
        let key = m.get(1).or_else(|| m.get(2)).unwrap().as_str();
        let value = if let Ok(idx) = key.parse::<usize>() {
            captures.get(idx).map(|m| m.as_str())
        } else {
            captures.name(key).map(|m| m.as_str())
        };
        let value = match value {
            Some(v) => v,
            None => {
                err = Some(MappingError::InvalidRule(format!("template referenced unknown group ${key}")));
                return String::new();
            }
        };

        match scale_numeric {
            Some(scale) => match value.trim().parse::<f64>() {
                Ok(f) => {
                    let scaled = (f * scale).round() as i64;
                    match width {
                        Some(w) => format!("{scaled:0w$}", w = w),
                        None => scaled.to_string(),
                    }
                }
                Err(_) => {
                    err = Some(MappingError::Encoding(format!("group ${key} value {value:?} is not numeric")));
                    String::new()
                }
            },
            None => value.to_string(),
        }
    });

    match err {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

/// Applies `response_scale` to the numeric portion of a captured response
/// field, dividing and formatting with inferred decimal places
/// (`generic_regex.py:_render_template`, response branch).
pub fn scale_response_value(value: &str, response_scale: Option<f64>) -> String {
    let Some(scale) = response_scale else {
        return value.to_string();
    };
    let digits: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '-').collect();
    let Ok(intval) = digits.parse::<i64>() else {
        return value.to_string();
    };
    let scaled = intval as f64 / scale;
    match decimal_places(scale) {
        Some(d) => format!("{scaled:.d$}", d = d),
        None => scaled.to_string(),
    }
}

/// Renders a generic-regex response template against the response's
/// captures, applying `response_scale` to each substituted field.
pub fn render_response_template(template: &str, captures: &Captures<'_>, response_scale: Option<f64>) -> Result<String, MappingError> {
    let mut err: Option<MappingError> = None;
    let rendered = token_pattern().replace_all(template, |m: &Captures| {
        if err.is_some() {
            return String::new();
        }
        let key = m.get(1).or_else(|| m.get(2)).unwrap().as_str();
        let value = if let Ok(idx) = key.parse::<usize>() {
            captures.get(idx).map(|m| m.as_str())
        } else {
            captures.name(key).map(|m| m.as_str())
        };
        match value {
            Some(v) => scale_response_value(v, response_scale),
            None => {
                err = Some(MappingError::InvalidRule(format!("template referenced unknown group ${key}")));
                String::new()
            }
        }
    });

    match err {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

/// Extracts the `$n` / `${name}` token names referenced by `template`,
/// in order of appearance (`generic_regex.py:_extract_tokens`).
pub fn extract_tokens(template: &str) -> Vec<String> {
    token_pattern()
        .captures_iter(template)
        .map(|m| m.get(1).or_else(|| m.get(2)).unwrap().as_str().to_string())
        .collect()
}

/// Validates that every token in `tokens` names a group that `pattern`
/// actually defines, by position or name (`_validate_tokens`).
pub fn validate_tokens(pattern: &Regex, tokens: &[String], field_name: &str) -> Result<(), MappingError> {
    let group_count = pattern.captures_len() - 1;
    let names: std::collections::HashSet<&str> = pattern.capture_names().flatten().collect();
    for token in tokens {
        if let Ok(idx) = token.parse::<usize>() {
            if idx == 0 || idx > group_count {
                return Err(MappingError::InvalidRule(format!(
                    "{field_name} references group ${token} but pattern has only {group_count} group(s)"
                )));
            }
        } else if !names.contains(token.as_str()) {
            return Err(MappingError::InvalidRule(format!(
                "{field_name} references group ${token} but pattern defines no such named group"
            )));
        }
    }
    Ok(())
}

/// Builds a [`ModbusAction`] for a matched MODBUS rule, substituting the
/// rule's `value:` template (for write actions) against `captures`.
pub fn build_modbus_action(
    kind: ActionKind,
    address: u16,
    count: u16,
    value_template: Option<&str>,
    data_type: DataType,
    scale: Option<f64>,
    response_scale: Option<f64>,
    captures: &Captures<'_>,
) -> Result<ModbusAction, MappingError> {
    let values = match value_template {
        Some(template) if kind.is_write() => {
            let rendered = render_template(template, captures, None, None)?;
            encode_value(&rendered, data_type, scale)?
        }
        _ => Vec::new(),
    };

    Ok(ModbusAction {
        function_code: kind.function_code(),
        address,
        count,
        values,
        data_type,
        response_scale,
    })
}

/// The outcome of translating a command for a generic-regex device: an
/// ASCII exchange to perform, or an immediate static response.
pub enum GenericOutcome {
    Exchange { request: String, template: GenericTemplate },
    Static(String),
}

/// Translates `command` against a generic-regex device's rules, rendering
/// the matched rule's request template (`generic_regex.py:write`, request
/// half).
pub fn translate_generic(command: &str, rules: &[MappingRule]) -> Result<GenericOutcome, MappingError> {
    let (rule, captures) = match_rule(command, rules)?;
    match &rule.action {
        RuleAction::Static(resp) => Ok(GenericOutcome::Static(resp.clone())),
        RuleAction::GenericRegex(tmpl) => {
            let width = tmpl.payload_width.or(if tmpl.scale.is_some() { Some(5) } else { None });
            let request = render_template(&tmpl.request_format, &captures, tmpl.scale, width)?;
            Ok(GenericOutcome::Exchange { request, template: tmpl.clone() })
        }
        RuleAction::Modbus { .. } => Err(MappingError::InvalidRule("rule is a MODBUS action, not a generic-regex template".into())),
    }
}

/// Parses a device's raw response text against `template`'s response
/// regex and renders the response format string
/// (`generic_regex.py:_receive_response` + `_render_template`).
pub fn parse_generic_response(template: &GenericTemplate, raw: &str) -> Result<String, MappingError> {
    let pattern = template
        .response_regex
        .as_ref()
        .ok_or_else(|| MappingError::InvalidRule("rule expects a response but has no response_regex".into()))?;
    let format = template
        .response_format
        .as_ref()
        .ok_or_else(|| MappingError::InvalidRule("rule expects a response but has no response_format".into()))?;

    let captures = pattern
        .captures(raw)
        .filter(|c| c.get(0).map(|m| m.as_str() == raw).unwrap_or(false))
        .ok_or_else(|| MappingError::Decoding(format!("response {raw:?} did not match expected pattern")))?;

    render_response_template(format, &captures, template.response_scale)
}

/// Translates `command` for a MODBUS device, resolving the matched rule
/// into either a [`ModbusAction`] or a static response
/// (`mapping_engine.py:translate_command`).
pub fn translate_modbus(command: &str, rules: &[MappingRule]) -> Result<ModbusOutcome, MappingError> {
    let (rule, captures) = match_rule(command, rules)?;
    match &rule.action {
        RuleAction::Static(resp) => Ok(ModbusOutcome::Static(resp.clone())),
        RuleAction::Modbus { kind, address, count, value_template, data_type, scale, response_scale } => {
            let action = build_modbus_action(*kind, *address, *count, value_template.as_deref(), *data_type, *scale, *response_scale, &captures)?;
            Ok(ModbusOutcome::Action(action))
        }
        RuleAction::GenericRegex(_) => Err(MappingError::InvalidRule("rule is a generic-regex template, not a MODBUS action".into())),
    }
}

pub enum ModbusOutcome {
    Action(ModbusAction),
    Static(String),
}

/// Per-rule inferred register widths for named response groups shaped
/// like `(?P<name>\d{N})`, used to default `payload_width`
/// (`generic_regex.py:_compile_rules`, width-inference block).
pub fn infer_group_widths(response_regex_source: &str) -> HashMap<String, usize> {
    static GROUP: OnceLock<Regex> = OnceLock::new();
    let group_re = GROUP.get_or_init(|| Regex::new(r"\(\?P<(?P<name>\w+)>(?P<pat>[^)]+)\)").unwrap());
    static WIDTH: OnceLock<Regex> = OnceLock::new();
    let width_re = WIDTH.get_or_init(|| Regex::new(r"^\\d\{(?P<width>\d+)\}").unwrap());

    let mut widths = HashMap::new();
    for caps in group_re.captures_iter(response_regex_source) {
        let name = caps.name("name").unwrap().as_str();
        let pat = caps.name("pat").unwrap().as_str();
        if let Some(w) = width_re.captures(pat) {
            if let Ok(n) = w.name("width").unwrap().as_str().parse() {
                widths.insert(name.to_string(), n);
            }
        }
    }
    widths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, action: RuleAction) -> MappingRule {
        MappingRule { pattern: Regex::new(pattern).unwrap(), action }
    }

    #[test]
    fn encode_uint16_applies_scale_and_rounds() {
        let values = encode_value("12.34", DataType::Uint16, Some(100.0)).unwrap();
        assert_eq!(values, vec![1234]);
    }

    #[test]
    fn encode_uint16_rejects_out_of_range() {
        assert!(encode_value("70000", DataType::Uint16, None).is_err());
    }

    #[test]
    fn encode_bool_accepts_common_truthy_literals() {
        assert_eq!(encode_value("on", DataType::Bool, None).unwrap(), vec![0xff00]);
        assert_eq!(encode_value("0", DataType::Bool, None).unwrap(), vec![0x0000]);
    }

    #[test]
    fn decode_uint32_be_combines_registers_big_endian_word_order() {
        let decoded = decode_registers(&[0x0001, 0x0000], DataType::Uint32Be, None).unwrap();
        assert_eq!(decoded, "65536");
    }

    #[test]
    fn decode_with_power_of_ten_scale_formats_fixed_decimals() {
        let decoded = decode_registers(&[1234], DataType::Uint16, Some(100.0)).unwrap();
        assert_eq!(decoded, "12.34");
    }

    #[test]
    fn translate_modbus_substitutes_positional_and_named_captures() {
        let rules = vec![rule(
            r"^SET:CH(?P<ch>\d+):(\d+(?:\.\d+)?)$",
            RuleAction::Modbus {
                kind: ActionKind::WriteSingleRegister,
                address: 100,
                count: 1,
                value_template: Some("$2".to_string()),
                data_type: DataType::Uint16,
                scale: Some(10.0),
                response_scale: None,
            },
        )];
        let outcome = translate_modbus("SET:CH1:5.5", &rules).unwrap();
        match outcome {
            ModbusOutcome::Action(action) => {
                assert_eq!(action.function_code, function_code::WRITE_SINGLE_REGISTER);
                assert_eq!(action.values, vec![55]);
            }
            ModbusOutcome::Static(_) => panic!("expected an action"),
        }
    }

    #[test]
    fn translate_modbus_first_match_wins() {
        let rules = vec![
            rule(
                "^IDN\\?$",
                RuleAction::Static("ACME,BENCH,1,1.0".to_string()),
            ),
            rule(
                "^.*$",
                RuleAction::Modbus {
                    kind: ActionKind::ReadHoldingRegisters,
                    address: 0,
                    count: 1,
                    value_template: None,
                    data_type: DataType::Uint16,
                    scale: None,
                    response_scale: None,
                },
            ),
        ];
        match translate_modbus("IDN?", &rules).unwrap() {
            ModbusOutcome::Static(resp) => assert_eq!(resp, "ACME,BENCH,1,1.0"),
            ModbusOutcome::Action(_) => panic!("expected the static rule to win"),
        }
    }

    #[test]
    fn translate_modbus_no_match_is_reported() {
        let err = translate_modbus("nope", &[]).unwrap_err();
        assert!(matches!(err, MappingError::NoMatch(_)));
    }

    #[test]
    fn translate_generic_renders_request_and_response() {
        let template = GenericTemplate {
            request_format: "MEAS? $1\n".to_string(),
            expects_response: true,
            response_regex: Some(Regex::new(r"^(?P<payload>\d{5})$").unwrap()),
            response_format: Some("${payload} mV".to_string()),
            terminator: Some("\n".to_string()),
            scale: None,
            response_scale: Some(100.0),
            payload_width: Some(5),
        };
        let rules = vec![rule(r"^READ:(\d)$", RuleAction::GenericRegex(template))];

        let (_, request) = match translate_generic("READ:1", &rules).unwrap() {
            GenericOutcome::Exchange { request, template } => (template, request),
            GenericOutcome::Static(_) => panic!("expected an exchange"),
        };
        assert_eq!(request, "MEAS? 1\n");

        let tmpl = match &rules[0].action {
            RuleAction::GenericRegex(t) => t,
            _ => unreachable!(),
        };
        let rendered = parse_generic_response(tmpl, "01234").unwrap();
        assert_eq!(rendered, "12.34 mV");
    }

    #[test]
    fn infer_group_widths_reads_fixed_digit_groups() {
        let widths = infer_group_widths(r"^(?P<payload>\d{5})$");
        assert_eq!(widths.get("payload"), Some(&5));
    }

    #[test]
    fn validate_tokens_rejects_unknown_named_group() {
        let pattern = Regex::new(r"^(?P<ch>\d+)$").unwrap();
        let tokens = vec!["missing".to_string()];
        assert!(validate_tokens(&pattern, &tokens, "request_format").is_err());
    }

    /// A rule's pattern need not carry its own `^`/`$` anchors to require a
    /// full-command match: `"MEAS:TEMP\\?"` must match `"MEAS:TEMP?"` but
    /// must not match a command that merely contains it as a substring.
    #[test]
    fn match_rule_requires_the_whole_command_not_a_substring() {
        let rules = vec![rule(
            "MEAS:TEMP\\?",
            RuleAction::Modbus {
                kind: ActionKind::ReadHoldingRegisters,
                address: 0,
                count: 2,
                value_template: None,
                data_type: DataType::Float32Be,
                scale: None,
                response_scale: None,
            },
        )];
        assert!(match_rule("MEAS:TEMP?", &rules).is_ok());
        assert!(matches!(match_rule("XMEAS:TEMP?GARBAGE", &rules), Err(MappingError::NoMatch(_))));
        assert!(matches!(match_rule("MEAS:TEMP?EXTRA", &rules), Err(MappingError::NoMatch(_))));
    }

    /// spec.md S3: `modbus-tcp`, unit 1, `pattern="MEAS:TEMP\\?"`, a two-
    /// register `float32_be` read at address 0. Registers `[0x41CC, 0x0000]`
    /// decode to `25.500000` (`.6f`-style default for an unscaled float).
    #[test]
    fn s3_modbus_float_read_round_trip() {
        let rules = vec![rule(
            "MEAS:TEMP\\?",
            RuleAction::Modbus {
                kind: ActionKind::ReadHoldingRegisters,
                address: 0,
                count: 2,
                value_template: None,
                data_type: DataType::Float32Be,
                scale: None,
                response_scale: None,
            },
        )];
        let action = match translate_modbus("MEAS:TEMP?", &rules).unwrap() {
            ModbusOutcome::Action(action) => action,
            ModbusOutcome::Static(_) => panic!("expected an action"),
        };
        assert_eq!(action.function_code, function_code::READ_HOLDING_REGISTERS);
        assert_eq!(action.address, 0);
        assert_eq!(action.count, 2);

        let decoded = decode_registers(&[0x41CC, 0x0000], action.data_type, action.response_scale).unwrap();
        assert_eq!(decoded, "25.500000");
    }

    /// spec.md S5: `pattern="^STAT$"`, request `"STATUS\n"`, device reply
    /// `"OK TEMP=26.5 MODE=AUTO\n"` parsed back through
    /// `response_format="TEMP=$temp\nMODE=$mode\n"`.
    #[test]
    fn s5_generic_regex_round_trip() {
        let template = GenericTemplate {
            request_format: "STATUS\n".to_string(),
            expects_response: true,
            response_regex: Some(Regex::new(r"^OK TEMP=(?P<temp>\d+\.\d+) MODE=(?P<mode>\w+)$").unwrap()),
            response_format: Some("TEMP=$temp\nMODE=$mode\n".to_string()),
            terminator: Some("\n".to_string()),
            scale: None,
            response_scale: None,
            payload_width: None,
        };
        let rules = vec![rule("^STAT$", RuleAction::GenericRegex(template))];

        let request = match translate_generic("STAT", &rules).unwrap() {
            GenericOutcome::Exchange { request, .. } => request,
            GenericOutcome::Static(_) => panic!("expected an exchange"),
        };
        assert_eq!(request, "STATUS\n");

        let tmpl = match &rules[0].action {
            RuleAction::GenericRegex(t) => t,
            _ => unreachable!(),
        };
        let rendered = parse_generic_response(tmpl, "OK TEMP=26.5 MODE=AUTO").unwrap();
        assert_eq!(rendered, "TEMP=26.5\nMODE=AUTO\n");
    }
}
