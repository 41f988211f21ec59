// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MODBUS-ASCII adapter (`modbus_ascii.py`): command mapping over a serial
//! line shared through [`serial_bus::SerialBusManager`], framed as
//! `:` + hex(`unit_id || pdu || lrc`) + `\r\n`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use adapter::{Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use mapping_engine::{MappingRule, ModbusOutcome};
use modbus_common::{build_ascii_frame, build_pdu, decode_response, parse_ascii_frame, ModbusResult};
use serde::Deserialize;
use serial_bus::{LineParams, Parity, SerialBusManager, StopBits};
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Deserialize)]
struct Settings {
    port: Option<String>,
    #[serde(default = "default_baud")]
    baudrate: u32,
    #[serde(default = "default_bytesize")]
    bytesize: u8,
    #[serde(default = "default_parity")]
    parity: String,
    #[serde(default = "default_stopbits")]
    stopbits: f64,
    #[serde(default = "default_unit_id")]
    unit_id: u8,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    requires_lock: Option<bool>,
}

fn default_baud() -> u32 {
    9600
}
fn default_bytesize() -> u8 {
    7
}
fn default_parity() -> String {
    "E".to_string()
}
fn default_stopbits() -> f64 {
    1.0
}
fn default_unit_id() -> u8 {
    1
}
fn default_timeout() -> f64 {
    1.0
}

fn parse_line_params(settings: &Settings) -> Result<LineParams, AdapterError> {
    let parity = match settings.parity.to_uppercase().as_str() {
        "N" => Parity::None,
        "E" => Parity::Even,
        "O" => Parity::Odd,
        other => return Err(AdapterError::Config(format!("invalid parity {other:?}; expected one of N,E,O"))),
    };
    let stopbits = match settings.stopbits {
        s if (s - 1.0).abs() < f64::EPSILON => StopBits::One,
        s if (s - 2.0).abs() < f64::EPSILON => StopBits::Two,
        s if (s - 1.5).abs() < f64::EPSILON => StopBits::OnePointFive,
        other => return Err(AdapterError::Config(format!("stopbits must be 1, 1.5, or 2, got {other}"))),
    };
    if ![5u8, 6, 7, 8].contains(&settings.bytesize) {
        return Err(AdapterError::Config(format!("invalid bytesize {}", settings.bytesize)));
    }
    Ok(LineParams::new(settings.baudrate, settings.bytesize, parity, stopbits, Duration::from_secs_f64(settings.timeout)))
}

pub struct ModbusAsciiAdapter {
    port: String,
    unit_id: u8,
    timeout: Duration,
    requires_lock: bool,
    rules: Vec<MappingRule>,
    line_params: LineParams,
    bus_manager: Arc<SerialBusManager>,
    bus: Mutex<Option<Arc<serial_bus::BusHandle>>>,
    pending_response: Mutex<Vec<u8>>,
}

impl ModbusAsciiAdapter {
    pub fn new(
        name: &str,
        options: &DeviceOptions,
        rules: &[MappingRule],
        bus_manager: Arc<SerialBusManager>,
    ) -> Result<Self, AdapterError> {
        let settings: Settings = serde_yaml::from_value(options.clone())
            .map_err(|e| AdapterError::Config(format!("modbus-ascii device {name:?}: {e}")))?;
        let port = settings.port.clone().ok_or_else(|| AdapterError::Config(format!("device {name:?} missing required 'port' setting")))?;
        let line_params = parse_line_params(&settings)?;
        Ok(Self {
            port,
            unit_id: settings.unit_id,
            timeout: Duration::from_secs_f64(settings.timeout),
            requires_lock: settings.requires_lock.unwrap_or(true),
            rules: rules.to_vec(),
            line_params,
            bus_manager,
            bus: Mutex::new(None),
            pending_response: Mutex::new(Vec::new()),
        })
    }

    /// Reads one `:...\r\n` ASCII line, buffering only once a leading `:`
    /// is seen and stopping at the trailing `\n` (`modbus_ascii.py:_read_response`).
    async fn read_ascii_line(io: &mut serial_bus::BusIo<'_>, deadline: Instant) -> Result<Vec<u8>, AdapterError> {
        let mut buf = Vec::new();
        let mut started = false;
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio_timeout(remaining, io.read(&mut byte)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => {
                    let b = byte[0];
                    if !started {
                        if b == b':' {
                            started = true;
                            buf.push(b);
                        }
                        continue;
                    }
                    buf.push(b);
                    if b == b'\n' {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(AdapterError::Transport(e.to_string())),
            }
        }
        Ok(buf)
    }
}

#[async_trait]
impl Adapter for ModbusAsciiAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut guard = self.bus.lock().await;
        if guard.is_none() {
            let handle = self
                .bus_manager
                .attach(&self.port, self.line_params.clone())
                .map_err(|e| AdapterError::Open(e.to_string()))?;
            *guard = Some(handle);
        }
        Ok(())
    }

    async fn release(&self) {
        let mut guard = self.bus.lock().await;
        if let Some(handle) = guard.take() {
            self.bus_manager.detach(&handle);
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = std::str::from_utf8(data).map_err(|_| AdapterError::Transport("command is not valid ASCII/UTF-8".into()))?.trim();

        let outcome = mapping_engine::translate_modbus(command, &self.rules).map_err(|e| AdapterError::Transport(e.to_string()))?;

        let response = match outcome {
            ModbusOutcome::Static(resp) => resp,
            ModbusOutcome::Action(action) => {
                let pdu = build_pdu(&action).map_err(|e| AdapterError::Transport(e.to_string()))?;
                let frame = build_ascii_frame(self.unit_id, &pdu);
                let unit_id = self.unit_id;
                let deadline_timeout = self.timeout;

                let guard = self.bus.lock().await;
                let bus = guard.as_ref().ok_or_else(|| AdapterError::Transport("serial bus is not attached".into()))?;
                let line = bus
                    .transact(|mut io| async move {
                        io.write_all(&frame).await?;
                        let deadline = Instant::now() + deadline_timeout;
                        let raw = Self::read_ascii_line(&mut io, deadline).await.map_err(|e| serial_bus::SerialBusError::Io {
                            path: String::new(),
                            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                        })?;
                        Ok(raw)
                    })
                    .await
                    .map_err(|e| AdapterError::Transport(e.to_string()))?;

                let pdu = parse_ascii_frame(&line, unit_id)
                    .map_err(|e| AdapterError::Transport(e.to_string()))?
                    .ok_or_else(|| AdapterError::Transport("ASCII response addressed a different unit".into()))?;
                match decode_response(&action, &pdu).map_err(|e| AdapterError::Transport(e.to_string()))? {
                    ModbusResult::Registers(regs) => {
                        mapping_engine::decode_registers(&regs, action.data_type, action.response_scale).map_err(|e| AdapterError::Transport(e.to_string()))?
                    }
                    ModbusResult::Bits(bits) => bits,
                    ModbusResult::Ok => String::new(),
                }
            }
        };

        tracing::debug!(port = %self.port, unit_id = self.unit_id, command, "modbus-ascii write");
        *self.pending_response.lock().await = response.into_bytes();
        Ok(data.len())
    }

    async fn read(&self, _max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        Ok(std::mem::take(&mut *self.pending_response.lock().await))
    }

    fn requires_lock(&self) -> bool {
        self.requires_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(yaml: &str) -> DeviceOptions {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn missing_port_rejected() {
        let err = ModbusAsciiAdapter::new("bench1", &opts("baudrate: 9600"), &[], Arc::new(SerialBusManager::new())).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn defaults_match_original() {
        let a = ModbusAsciiAdapter::new("bench1", &opts("port: /dev/ttyUSB0"), &[], Arc::new(SerialBusManager::new())).unwrap();
        assert_eq!(a.unit_id, 1);
        assert_eq!(a.line_params.bytesize, 7);
        assert_eq!(a.line_params.parity, Parity::Even);
        assert!(a.requires_lock());
    }

    #[test]
    fn invalid_bytesize_rejected() {
        let err = ModbusAsciiAdapter::new("bench1", &opts("port: /dev/ttyUSB0\nbytesize: 4"), &[], Arc::new(SerialBusManager::new())).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }
}
