// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCPI-over-serial adapter (`scpi_serial.py`): an exclusively-owned serial
//! port (unlike the MODBUS serial adapters, this port is never shared
//! through `serial-bus`), opened eagerly on `acquire`.

use std::time::Duration;

use adapter::{parse_termination, Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

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
    #[serde(default = "default_timeout")]
    timeout: f64,
    write_termination: Option<String>,
    read_termination: Option<String>,
    #[serde(default = "default_inter_byte_timeout")]
    inter_byte_timeout: Option<f64>,
}

fn default_baud() -> u32 {
    9600
}
fn default_bytesize() -> u8 {
    8
}
fn default_parity() -> String {
    "N".to_string()
}
fn default_stopbits() -> f64 {
    1.0
}
fn default_timeout() -> f64 {
    1.0
}
fn default_inter_byte_timeout() -> Option<f64> {
    Some(0.02)
}

pub struct ScpiSerialAdapter {
    port_name: String,
    baudrate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    timeout: Duration,
    inter_byte_timeout: Option<Duration>,
    write_term: Option<Vec<u8>>,
    read_term: Option<Vec<u8>>,
    port: Mutex<Option<SerialStream>>,
}

impl ScpiSerialAdapter {
    pub fn new(name: &str, options: &DeviceOptions) -> Result<Self, AdapterError> {
        let settings: Settings = serde_yaml::from_value(options.clone())
            .map_err(|e| AdapterError::Config(format!("scpi-serial: {e}")))?;
        let mut port_name = settings
            .port
            .ok_or_else(|| AdapterError::Config(format!("device {name:?} missing required 'port' setting")))?;
        if cfg!(windows) && !port_name.starts_with(r"\\.\") {
            port_name = format!(r"\\.\{port_name}");
        }

        let data_bits = match settings.bytesize {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            n => return Err(AdapterError::Config(format!("invalid bytesize {n}"))),
        };
        let parity = match settings.parity.to_uppercase().as_str() {
            "N" => Parity::None,
            "E" => Parity::Even,
            "O" => Parity::Odd,
            other => {
                return Err(AdapterError::Config(format!(
                    "invalid parity {other:?}; expected one of N,E,O,M,S"
                )))
            }
        };
        let stop_bits = match settings.stopbits {
            s if (s - 1.0).abs() < f64::EPSILON => StopBits::One,
            s if (s - 2.0).abs() < f64::EPSILON => StopBits::Two,
            s if (s - 1.5).abs() < f64::EPSILON => StopBits::Two,
            other => return Err(AdapterError::Config(format!("stopbits must be 1, 1.5, or 2, got {other}"))),
        };

        Ok(Self {
            port_name,
            baudrate: settings.baudrate,
            data_bits,
            parity,
            stop_bits,
            timeout: Duration::from_secs_f64(settings.timeout),
            inter_byte_timeout: settings.inter_byte_timeout.map(Duration::from_secs_f64),
            write_term: parse_termination(settings.write_termination.as_deref()),
            read_term: parse_termination(settings.read_termination.as_deref()),
            port: Mutex::new(None),
        })
    }

    fn open(&self) -> Result<SerialStream, AdapterError> {
        tokio_serial::new(&self.port_name, self.baudrate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| AdapterError::Open(format!("failed to open serial port {}: {e}", self.port_name)))
    }
}

#[async_trait]
impl Adapter for ScpiSerialAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        let mut guard = self.port.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut guard = self.port.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        Ok(())
    }

    async fn release(&self) {
        self.port.lock().await.take();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| AdapterError::Transport("serial port is not connected".into()))?;

        let mut payload = data.to_vec();
        if let Some(term) = &self.write_term {
            if !payload.ends_with(term.as_slice()) {
                payload.extend_from_slice(term);
            }
        }

        timeout(self.timeout, port.write_all(&payload))
            .await
            .map_err(|_| AdapterError::Timeout)?
            .map_err(|e| AdapterError::Transport(format!("write failed on {}: {e}", self.port_name)))?;
        tracing::debug!(port = %self.port_name, bytes = payload.len(), "scpi-serial write");
        Ok(payload.len())
    }

    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| AdapterError::Transport("serial port is not connected".into()))?;

        let target = max_bytes.clamp(1, 65536);
        let per_byte_timeout = self.inter_byte_timeout.unwrap_or(self.timeout);
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];

        while buf.len() < target {
            match timeout(per_byte_timeout, port.read(&mut byte)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => {
                    buf.push(byte[0]);
                    if let Some(term) = &self.read_term {
                        if buf.ends_with(term.as_slice()) {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    return Err(AdapterError::Transport(format!("read failed on {}: {e}", self.port_name)));
                }
            }
        }
        tracing::debug!(port = %self.port_name, bytes = buf.len(), "scpi-serial read");
        Ok(buf)
    }

    fn requires_lock(&self) -> bool {
        true
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
        let err = ScpiSerialAdapter::new("bench1", &opts("baudrate: 9600")).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn invalid_parity_rejected() {
        let err = ScpiSerialAdapter::new("bench1", &opts("port: /dev/ttyUSB0\nparity: X")).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn invalid_stopbits_rejected() {
        let err = ScpiSerialAdapter::new("bench1", &opts("port: /dev/ttyUSB0\nstopbits: 3")).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn requires_lock_is_always_true() {
        let a = ScpiSerialAdapter::new("bench1", &opts("port: /dev/ttyUSB0")).unwrap();
        assert!(a.requires_lock());
    }
}
