// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic ASCII request/response adapter (`generic_regex.py`): renders a
//! mapping-engine request template, sends it over TCP or a dedicated
//! serial line, and (if the rule expects one) parses the response back
//! through the rule's response template.

use std::time::Duration;

use adapter::{Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use mapping_engine::{GenericOutcome, MappingRule};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const DEFAULT_TCP_CHUNK: usize = 1024;
const DEFAULT_SERIAL_CHUNK: usize = 16;

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default = "default_transport")]
    transport: String,
    host: Option<String>,
    port: Option<u16>,
    serial_port: Option<String>,
    #[serde(default = "default_baud")]
    baudrate: u32,
    #[serde(default = "default_connect_timeout")]
    connect_timeout: f64,
    #[serde(default = "default_io_timeout")]
    io_timeout: f64,
    #[serde(default = "default_max_response_bytes")]
    max_response_bytes: usize,
    recv_chunk_size: Option<usize>,
    requires_lock: Option<bool>,
}

fn default_transport() -> String {
    "tcp".to_string()
}
fn default_baud() -> u32 {
    9600
}
fn default_connect_timeout() -> f64 {
    5.0
}
fn default_io_timeout() -> f64 {
    2.0
}
fn default_max_response_bytes() -> usize {
    4096
}

enum Target {
    Tcp { host: String, port: u16 },
    Serial { port: String, baudrate: u32 },
}

enum Transport {
    Tcp(TcpStream),
    Serial(SerialStream),
}

impl Transport {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(data).await,
            Transport::Serial(s) => s.write_all(data).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf).await,
            Transport::Serial(s) => s.read(buf).await,
        }
    }
}

pub struct GenericRegexAdapter {
    target: Target,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_response_bytes: usize,
    recv_chunk_size: usize,
    requires_lock: bool,
    rules: Vec<MappingRule>,
    conn: Mutex<Option<Transport>>,
    pending_response: Mutex<Vec<u8>>,
}

impl GenericRegexAdapter {
    pub fn new(name: &str, options: &DeviceOptions, rules: &[MappingRule]) -> Result<Self, AdapterError> {
        let settings: Settings = serde_yaml::from_value(options.clone())
            .map_err(|e| AdapterError::Config(format!("generic-regex device {name:?}: {e}")))?;

        let (target, default_requires_lock, default_chunk) = match settings.transport.as_str() {
            "tcp" => {
                let host = settings.host.clone().ok_or_else(|| AdapterError::Config(format!("device {name:?} missing required 'host' setting")))?;
                let port = settings.port.ok_or_else(|| AdapterError::Config(format!("device {name:?} missing required 'port' setting")))?;
                (Target::Tcp { host, port }, false, DEFAULT_TCP_CHUNK)
            }
            "serial" => {
                let port = settings
                    .serial_port
                    .clone()
                    .ok_or_else(|| AdapterError::Config(format!("device {name:?} missing required 'serial_port' setting")))?;
                (Target::Serial { port, baudrate: settings.baudrate }, true, DEFAULT_SERIAL_CHUNK)
            }
            other => return Err(AdapterError::Config(format!("device {name:?} has unknown transport {other:?}; expected 'tcp' or 'serial'"))),
        };

        Ok(Self {
            target,
            connect_timeout: Duration::from_secs_f64(settings.connect_timeout),
            io_timeout: Duration::from_secs_f64(settings.io_timeout),
            max_response_bytes: settings.max_response_bytes,
            recv_chunk_size: settings.recv_chunk_size.unwrap_or(default_chunk),
            requires_lock: settings.requires_lock.unwrap_or(default_requires_lock),
            rules: rules.to_vec(),
            conn: Mutex::new(None),
            pending_response: Mutex::new(Vec::new()),
        })
    }

    async fn open(&self) -> Result<Transport, AdapterError> {
        match &self.target {
            Target::Tcp { host, port } => {
                let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| AdapterError::Open(format!("timed out connecting to {host}:{port}")))?
                    .map_err(|e| AdapterError::Open(format!("failed to connect to {host}:{port}: {e}")))?;
                Ok(Transport::Tcp(stream))
            }
            Target::Serial { port, baudrate } => {
                let stream = tokio_serial::new(port, *baudrate)
                    .timeout(self.io_timeout)
                    .open_native_async()
                    .map_err(|e| AdapterError::Open(format!("failed to open serial port {port}: {e}")))?;
                Ok(Transport::Serial(stream))
            }
        }
    }

    /// Reads up to `max_response_bytes`, stopping early once `terminator`
    /// is seen or the per-chunk timeout elapses with no new bytes
    /// (`generic_regex.py:_receive_response`).
    async fn receive(&self, transport: &mut Transport, terminator: Option<&str>) -> Result<Vec<u8>, AdapterError> {
        let term_bytes = terminator.map(|t| t.as_bytes());
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; self.recv_chunk_size];
        while buf.len() < self.max_response_bytes {
            match timeout(self.io_timeout, transport.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(term) = term_bytes {
                        if buf.ends_with(term) {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => return Err(AdapterError::Transport(format!("read failed: {e}"))),
            }
        }
        Ok(buf)
    }
}

#[async_trait]
impl Adapter for GenericRegexAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    async fn release(&self) {
        self.conn.lock().await.take();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = std::str::from_utf8(data).map_err(|_| AdapterError::Transport("command is not valid ASCII/UTF-8".into()))?.trim();

        let outcome = mapping_engine::translate_generic(command, &self.rules).map_err(|e| AdapterError::Transport(e.to_string()))?;

        let response = match outcome {
            GenericOutcome::Static(resp) => resp,
            GenericOutcome::Exchange { request, template } => {
                let mut payload = request.into_bytes();
                if let Some(term) = &template.terminator {
                    if !payload.ends_with(term.as_bytes()) {
                        payload.extend_from_slice(term.as_bytes());
                    }
                }

                let mut guard = self.conn.lock().await;
                if guard.is_none() {
                    *guard = Some(self.open().await?);
                }
                let transport = guard.as_mut().expect("just ensured open");
                timeout(self.io_timeout, transport.write_all(&payload))
                    .await
                    .map_err(|_| AdapterError::Timeout)?
                    .map_err(|e| AdapterError::Transport(format!("write failed: {e}")))?;

                if !template.expects_response {
                    String::new()
                } else {
                    let raw = self.receive(transport, template.terminator.as_deref()).await?;
                    let mut text = String::from_utf8_lossy(&raw).into_owned();
                    if let Some(term) = &template.terminator {
                        if text.ends_with(term.as_str()) {
                            text.truncate(text.len() - term.len());
                        }
                    }
                    mapping_engine::parse_generic_response(&template, &text).map_err(|e| AdapterError::Transport(e.to_string()))?
                }
            }
        };

        tracing::debug!(command, "generic-regex write");
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
    fn tcp_transport_requires_host_and_port() {
        assert!(GenericRegexAdapter::new("bench1", &opts("transport: tcp\nport: 5025"), &[]).is_err());
        assert!(GenericRegexAdapter::new("bench1", &opts("transport: tcp\nhost: 10.0.0.5"), &[]).is_err());
    }

    #[test]
    fn serial_transport_requires_serial_port() {
        assert!(GenericRegexAdapter::new("bench1", &opts("transport: serial"), &[]).is_err());
    }

    #[test]
    fn unknown_transport_rejected() {
        let err = GenericRegexAdapter::new("bench1", &opts("transport: carrier-pigeon"), &[]).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn requires_lock_defaults_differ_by_transport() {
        let tcp = GenericRegexAdapter::new("bench1", &opts("transport: tcp\nhost: 10.0.0.5\nport: 5025"), &[]).unwrap();
        assert!(!tcp.requires_lock());
        let serial = GenericRegexAdapter::new("bench1", &opts("transport: serial\nserial_port: /dev/ttyUSB0"), &[]).unwrap();
        assert!(serial.requires_lock());
    }

    #[test]
    fn recv_chunk_size_defaults_differ_by_transport() {
        let tcp = GenericRegexAdapter::new("bench1", &opts("transport: tcp\nhost: 10.0.0.5\nport: 5025"), &[]).unwrap();
        assert_eq!(tcp.recv_chunk_size, DEFAULT_TCP_CHUNK);
        let serial = GenericRegexAdapter::new("bench1", &opts("transport: serial\nserial_port: /dev/ttyUSB0"), &[]).unwrap();
        assert_eq!(serial.recv_chunk_size, DEFAULT_SERIAL_CHUNK);
    }
}
