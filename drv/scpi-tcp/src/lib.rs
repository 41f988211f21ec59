// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCPI-over-TCP adapter (`scpi_tcp.py`): a plain TCP socket, connected
//! lazily, with terminator-aware write/read framing.

use std::time::Duration;

use adapter::{parse_termination, Adapter, AdapterError, DeviceOptions};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Debug, Deserialize)]
struct Settings {
    host: Option<String>,
    port: Option<u16>,
    #[serde(default = "default_timeout")]
    connect_timeout: f64,
    #[serde(default = "default_timeout")]
    io_timeout: f64,
    write_termination: Option<String>,
    read_termination: Option<String>,
    #[serde(default = "default_true")]
    tcp_nodelay: bool,
    #[serde(default)]
    keepalive: bool,
    #[serde(default)]
    requires_lock: bool,
}

fn default_timeout() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

pub struct ScpiTcpAdapter {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    tcp_nodelay: bool,
    keepalive: bool,
    requires_lock: bool,
    write_term: Option<Vec<u8>>,
    read_term: Option<Vec<u8>>,
    socket: Mutex<Option<TcpStream>>,
}

impl ScpiTcpAdapter {
    pub fn new(options: &DeviceOptions) -> Result<Self, AdapterError> {
        let settings: Settings = serde_yaml::from_value(options.clone())
            .map_err(|e| AdapterError::Config(format!("scpi-tcp: {e}")))?;
        let host = settings
            .host
            .ok_or_else(|| AdapterError::Config("scpi-tcp requires 'host' and 'port' settings".into()))?;
        let port = settings
            .port
            .ok_or_else(|| AdapterError::Config("scpi-tcp requires 'host' and 'port' settings".into()))?;
        Ok(Self {
            host,
            port,
            connect_timeout: Duration::from_secs_f64(settings.connect_timeout),
            io_timeout: Duration::from_secs_f64(settings.io_timeout),
            tcp_nodelay: settings.tcp_nodelay,
            keepalive: settings.keepalive,
            requires_lock: settings.requires_lock,
            write_term: parse_termination(settings.write_termination.as_deref()),
            read_term: parse_termination(settings.read_termination.as_deref()),
            socket: Mutex::new(None),
        })
    }

    async fn open(&self) -> Result<TcpStream, AdapterError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| AdapterError::Open(format!("timed out connecting to {}:{}", self.host, self.port)))?
            .map_err(|e| AdapterError::Open(format!("{}:{}: {e}", self.host, self.port)))?;
        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        if self.keepalive {
            let sock_ref = socket2::SockRef::from(&stream);
            let _ = sock_ref.set_keepalive(true);
        }
        Ok(stream)
    }

    async fn ensure_open<'a>(&self, guard: &mut tokio::sync::MutexGuard<'a, Option<TcpStream>>) -> Result<(), AdapterError> {
        if guard.is_none() {
            **guard = Some(self.open().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for ScpiTcpAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        let mut guard = self.socket.lock().await;
        self.ensure_open(&mut guard).await
    }

    async fn release(&self) {
        self.socket.lock().await.take();
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        let mut guard = self.socket.lock().await;
        self.ensure_open(&mut guard).await?;
        let stream = guard.as_mut().expect("just ensured open");

        let mut payload = data.to_vec();
        if let Some(term) = &self.write_term {
            if !payload.ends_with(term.as_slice()) {
                payload.extend_from_slice(term);
            }
        }

        let result = timeout(self.io_timeout, stream.write_all(&payload)).await;
        match result {
            Ok(Ok(())) => {
                tracing::debug!(host = %self.host, port = self.port, bytes = payload.len(), "scpi-tcp write");
                Ok(payload.len())
            }
            Ok(Err(e)) => {
                guard.take();
                Err(AdapterError::Transport(format!("write failed for {}:{}: {e}", self.host, self.port)))
            }
            Err(_) => {
                guard.take();
                Err(AdapterError::Timeout)
            }
        }
    }

    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        let mut guard = self.socket.lock().await;
        self.ensure_open(&mut guard).await?;
        let stream = guard.as_mut().expect("just ensured open");

        let target = max_bytes.max(1);
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let deadline = self.io_timeout;

        loop {
            if buf.len() >= target {
                break;
            }
            let want = (target - buf.len()).min(chunk.len());
            match timeout(deadline, stream.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(term) = &self.read_term {
                        if buf.ends_with(term.as_slice()) {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    guard.take();
                    return Err(AdapterError::Transport(format!("read failed for {}:{}: {e}", self.host, self.port)));
                }
                Err(_) => break,
            }
        }
        tracing::debug!(host = %self.host, port = self.port, bytes = buf.len(), "scpi-tcp read");
        Ok(buf)
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
    fn missing_host_or_port_rejected() {
        let err = ScpiTcpAdapter::new(&opts("port: 5025")).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
        let err = ScpiTcpAdapter::new(&opts("host: 10.0.0.1")).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn defaults_match_original() {
        let a = ScpiTcpAdapter::new(&opts("host: 10.0.0.1\nport: 5025")).unwrap();
        assert!(!a.requires_lock());
        assert!(a.tcp_nodelay);
        assert!(!a.keepalive);
        assert_eq!(a.connect_timeout, Duration::from_secs_f64(1.0));
    }

    #[tokio::test]
    async fn echo_server_round_trip() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let adapter = ScpiTcpAdapter::new(&opts(&format!("host: 127.0.0.1\nport: {}\nread_termination: LF", addr.port())))
            .unwrap();
        adapter.write(b"*IDN?\n").await.unwrap();
        let data = adapter.read(64).await.unwrap();
        assert_eq!(data, b"*IDN?\n");
    }
}
