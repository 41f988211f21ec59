// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MODBUS-TCP adapter (`modbus_tcp.py`): translates SCPI-style ASCII
//! commands to MODBUS function calls via the mapping engine and talks
//! MBAP-framed MODBUS over a plain TCP socket.

use std::time::Duration;

use adapter::{Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use mapping_engine::MappingRule;
use modbus_common::{build_mbap_header, build_pdu, decode_response, parse_mbap_header, ModbusResult};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Debug, Deserialize)]
struct Settings {
    host: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_unit_id")]
    unit_id: u8,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    requires_lock: bool,
}

fn default_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}
fn default_timeout() -> f64 {
    5.0
}

struct Connection {
    socket: Option<TcpStream>,
    transaction_id: u16,
    read_buffer: String,
}

pub struct ModbusTcpAdapter {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    requires_lock: bool,
    rules: Vec<MappingRule>,
    conn: Mutex<Connection>,
}

impl ModbusTcpAdapter {
    pub fn new(options: &DeviceOptions, rules: &[MappingRule]) -> Result<Self, AdapterError> {
        let settings: Settings = serde_yaml::from_value(options.clone())
            .map_err(|e| AdapterError::Config(format!("modbus-tcp: {e}")))?;
        let host = settings.host.ok_or_else(|| AdapterError::Config("modbus-tcp 'host' setting is required".into()))?;
        if !(1..=65535).contains(&settings.port) {
            return Err(AdapterError::Config(format!("invalid port: {}", settings.port)));
        }
        Ok(Self {
            host,
            port: settings.port,
            unit_id: settings.unit_id,
            timeout: Duration::from_secs_f64(settings.timeout),
            requires_lock: settings.requires_lock,
            rules: rules.to_vec(),
            conn: Mutex::new(Connection { socket: None, transaction_id: 0, read_buffer: String::new() }),
        })
    }

    async fn open(&self) -> Result<TcpStream, AdapterError> {
        let stream = timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| AdapterError::Open(format!("timed out connecting to {}:{}", self.host, self.port)))?
            .map_err(|e| AdapterError::Open(format!("failed to connect to {}:{}: {e}", self.host, self.port)))?;
        Ok(stream)
    }

    async fn send_request(&self, conn: &mut Connection, pdu: &[u8]) -> Result<Vec<u8>, AdapterError> {
        if conn.socket.is_none() {
            conn.socket = Some(self.open().await?);
        }
        let socket = conn.socket.as_mut().expect("just ensured open");

        conn.transaction_id = conn.transaction_id.wrapping_add(1);
        let transaction_id = conn.transaction_id;
        let header = build_mbap_header(transaction_id, self.unit_id, pdu.len());

        let mut request = Vec::with_capacity(header.len() + pdu.len());
        request.extend_from_slice(&header);
        request.extend_from_slice(pdu);

        let result: Result<Vec<u8>, AdapterError> = async {
            timeout(self.timeout, socket.write_all(&request))
                .await
                .map_err(|_| AdapterError::Timeout)?
                .map_err(|e| AdapterError::Transport(format!("MODBUS write failed: {e}")))?;

            let mut recv_header = [0u8; 7];
            timeout(self.timeout, socket.read_exact(&mut recv_header))
                .await
                .map_err(|_| AdapterError::Timeout)?
                .map_err(|e| AdapterError::Transport(format!("incomplete MBAP header: {e}")))?;
            let pdu_len = parse_mbap_header(&recv_header, transaction_id)
                .map_err(|e| AdapterError::Transport(e.to_string()))?;

            let mut response_pdu = vec![0u8; pdu_len];
            timeout(self.timeout, socket.read_exact(&mut response_pdu))
                .await
                .map_err(|_| AdapterError::Timeout)?
                .map_err(|e| AdapterError::Transport(format!("incomplete MODBUS PDU: {e}")))?;
            Ok(response_pdu)
        }
        .await;

        if result.is_err() {
            conn.socket = None;
        }
        result
    }
}

#[async_trait]
impl Adapter for ModbusTcpAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut conn = self.conn.lock().await;
        if conn.socket.is_none() {
            conn.socket = Some(self.open().await?);
        }
        Ok(())
    }

    async fn release(&self) {
        let mut conn = self.conn.lock().await;
        conn.socket = None;
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let command = std::str::from_utf8(data).map_err(|_| AdapterError::Transport("command is not valid ASCII/UTF-8".into()))?.trim();

        let outcome = mapping_engine::translate_modbus(command, &self.rules)
            .map_err(|e| AdapterError::Transport(format!("command mapping failed: {e}")))?;

        let mut conn = self.conn.lock().await;
        match outcome {
            mapping_engine::ModbusOutcome::Static(resp) => {
                conn.read_buffer = resp;
            }
            mapping_engine::ModbusOutcome::Action(action) => {
                let pdu = build_pdu(&action).map_err(|e| AdapterError::Transport(e.to_string()))?;
                let response_pdu = self.send_request(&mut conn, &pdu).await?;
                let decoded = decode_response(&action, &response_pdu).map_err(|e| AdapterError::Transport(e.to_string()))?;
                conn.read_buffer = match decoded {
                    ModbusResult::Registers(regs) => mapping_engine::decode_registers(&regs, action.data_type, action.response_scale)
                        .map_err(|e| AdapterError::Transport(e.to_string()))?,
                    ModbusResult::Bits(bits) => bits,
                    ModbusResult::Ok => String::new(),
                };
            }
        }
        tracing::debug!(host = %self.host, port = self.port, command, "modbus-tcp write");
        Ok(data.len())
    }

    async fn read(&self, _max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        let mut conn = self.conn.lock().await;
        let response = std::mem::take(&mut conn.read_buffer);
        Ok(response.into_bytes())
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
    fn missing_host_rejected() {
        let err = ModbusTcpAdapter::new(&opts("port: 502"), &[]).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn defaults_match_original() {
        let a = ModbusTcpAdapter::new(&opts("host: 10.0.0.5"), &[]).unwrap();
        assert_eq!(a.port, 502);
        assert_eq!(a.unit_id, 1);
        assert!(!a.requires_lock());
        assert_eq!(a.timeout, Duration::from_secs_f64(5.0));
    }

    #[test]
    fn invalid_port_rejected() {
        let err = ModbusTcpAdapter::new(&opts("host: 10.0.0.5\nport: 0"), &[]).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[tokio::test]
    async fn static_rule_short_circuits_without_a_transaction() {
        use mapping_engine::{MappingRule, RuleAction};
        let rules = vec![MappingRule { pattern: regex::Regex::new(r"^\*IDN\?$").unwrap(), action: RuleAction::Static("ACME,BENCH,1,1.0".to_string()) }];
        let adapter = ModbusTcpAdapter::new(&opts("host: 10.0.0.5"), &rules).unwrap();
        adapter.write(b"*IDN?").await.unwrap();
        let resp = adapter.read(64).await.unwrap();
        assert_eq!(resp, b"ACME,BENCH,1,1.0");
    }
}
