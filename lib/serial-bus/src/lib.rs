// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ownership of a physical serial bus across several logical
//! devices (spec.md §4.6, C7). One [`BusHandle`] exists per normalized
//! port path; its lifetime is an arena+refcount, not tied to any single
//! adapter (spec.md §9 design note).

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_serial::SerialStream;

#[derive(Debug, Error)]
pub enum SerialBusError {
    #[error("serial port {path} already open with a different {key}: existing={existing} new={new}")]
    SettingsMismatch { path: String, key: &'static str, existing: String, new: String },
    #[error("failed to open serial port {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("i/o error on {path}: {source}")]
    Io { path: String, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

/// The comparable key set from `serial_manager.py:_validate_settings`,
/// plus `write_timeout`, defaulting to `timeout` when absent (SPEC_FULL.md
/// §C.3/§C.3b).
#[derive(Debug, Clone, PartialEq)]
pub struct LineParams {
    pub baudrate: u32,
    pub bytesize: u8,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub timeout: Duration,
    pub write_timeout: Duration,
    pub xonxoff: bool,
    pub rtscts: bool,
    pub dsrdtr: bool,
}

impl LineParams {
    pub fn new(baudrate: u32, bytesize: u8, parity: Parity, stopbits: StopBits, timeout: Duration) -> Self {
        Self {
            baudrate,
            bytesize,
            parity,
            stopbits,
            timeout,
            write_timeout: timeout,
            xonxoff: false,
            rtscts: false,
            dsrdtr: false,
        }
    }

    fn describe_mismatch(&self, path: &str, other: &LineParams) -> Option<SerialBusError> {
        macro_rules! check {
            ($field:ident, $name:literal) => {
                if self.$field != other.$field {
                    return Some(SerialBusError::SettingsMismatch {
                        path: path.to_string(),
                        key: $name,
                        existing: format!("{:?}", self.$field),
                        new: format!("{:?}", other.$field),
                    });
                }
            };
        }
        check!(baudrate, "baudrate");
        check!(bytesize, "bytesize");
        check!(parity, "parity");
        check!(stopbits, "stopbits");
        check!(timeout, "timeout");
        check!(write_timeout, "write_timeout");
        check!(xonxoff, "xonxoff");
        check!(rtscts, "rtscts");
        check!(dsrdtr, "dsrdtr");
        None
    }
}

/// Either a real serial line or a `socket://host:port` stand-in used in
/// tests and simulated rigs (spec.md §8 S4).
enum PortTransport {
    Serial(SerialStream),
    Socket(TcpStream),
}

impl AsyncRead for PortTransport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PortTransport::Serial(s) => Pin::new(s).poll_read(cx, buf),
            PortTransport::Socket(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PortTransport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PortTransport::Serial(s) => Pin::new(s).poll_write(cx, buf),
            PortTransport::Socket(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PortTransport::Serial(s) => Pin::new(s).poll_flush(cx),
            PortTransport::Socket(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PortTransport::Serial(s) => Pin::new(s).poll_shutdown(cx),
            PortTransport::Socket(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Normalizes a platform-specific port path. URL-style transports
/// (`socket://`, `loop://`) are left intact; on Windows, bare device names
/// get the `\\.\` prefix (spec.md §4.6).
pub fn normalize_port(path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    if cfg!(windows) && !path.starts_with(r"\\.\") {
        return format!(r"\\.\{path}");
    }
    path.to_string()
}

/// A shared handle to one physical port: a refcount, the line parameters
/// every attacher has agreed to, and a mutex that serializes transactions
/// across every logical device multiplexed onto this bus.
pub struct BusHandle {
    path: String,
    params: LineParams,
    refcount: AtomicUsize,
    port: AsyncMutex<Option<PortTransport>>,
    transaction: AsyncMutex<()>,
}

impl BusHandle {
    async fn ensure_open(&self) -> Result<(), SerialBusError> {
        let mut slot = self.port.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let transport = if let Some(addr) = self.path.strip_prefix("socket://") {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| SerialBusError::Open { path: self.path.clone(), source: e })?;
            PortTransport::Socket(stream)
        } else {
            let builder = tokio_serial::new(&self.path, self.params.baudrate)
                .data_bits(match self.params.bytesize {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                })
                .parity(match self.params.parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Odd => tokio_serial::Parity::Odd,
                    Parity::Even | Parity::Mark | Parity::Space => tokio_serial::Parity::Even,
                })
                .stop_bits(match self.params.stopbits {
                    StopBits::One | StopBits::OnePointFive => tokio_serial::StopBits::One,
                    StopBits::Two => tokio_serial::StopBits::Two,
                })
                .timeout(self.params.timeout)
                .flow_control(if self.params.rtscts {
                    tokio_serial::FlowControl::Hardware
                } else if self.params.xonxoff {
                    tokio_serial::FlowControl::Software
                } else {
                    tokio_serial::FlowControl::None
                });
            let stream = builder
                .open_native_async()
                .map_err(|e| SerialBusError::Open { path: self.path.clone(), source: io::Error::new(io::ErrorKind::Other, e) })?;
            PortTransport::Serial(stream)
        };
        *slot = Some(transport);
        Ok(())
    }

    /// Runs `f` against the open port with the bus's transaction mutex
    /// held, so two logical devices sharing this bus never issue
    /// overlapping transactions.
    pub async fn transact<F, Fut, T>(&self, f: F) -> Result<T, SerialBusError>
    where
        F: FnOnce(BusIo<'_>) -> Fut,
        Fut: std::future::Future<Output = Result<T, SerialBusError>>,
    {
        let _txn = self.transaction.lock().await;
        self.ensure_open().await?;
        let mut guard = self.port.lock().await;
        let io = BusIo { path: &self.path, transport: guard.as_mut().expect("just opened") };
        f(io).await
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Borrowed I/O access handed to a `transact` closure.
pub struct BusIo<'a> {
    path: &'a str,
    transport: &'a mut PortTransport,
}

impl<'a> BusIo<'a> {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SerialBusError> {
        use tokio::io::AsyncWriteExt;
        self.transport
            .write_all(data)
            .await
            .map_err(|e| SerialBusError::Io { path: self.path.to_string(), source: e })
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialBusError> {
        use tokio::io::AsyncReadExt;
        self.transport
            .read(buf)
            .await
            .map_err(|e| SerialBusError::Io { path: self.path.to_string(), source: e })
    }
}

/// Process-wide registry mapping a normalized port path to its shared
/// handle.
#[derive(Default)]
pub struct SerialBusManager {
    handles: StdMutex<HashMap<String, Arc<BusHandle>>>,
}

impl SerialBusManager {
    pub fn new() -> Self {
        Self { handles: StdMutex::new(HashMap::new()) }
    }

    /// Returns the existing handle for `path`, or creates one. Fails if an
    /// existing handle's parameters differ from `params`.
    pub fn attach(&self, path: &str, params: LineParams) -> Result<Arc<BusHandle>, SerialBusError> {
        let key = normalize_port(path);
        let mut handles = self.handles.lock().unwrap();
        if let Some(existing) = handles.get(&key) {
            if let Some(mismatch) = existing.params.describe_mismatch(&key, &params) {
                return Err(mismatch);
            }
            existing.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(existing.clone());
        }
        let handle = Arc::new(BusHandle {
            path: key.clone(),
            params,
            refcount: AtomicUsize::new(1),
            port: AsyncMutex::new(None),
            transaction: AsyncMutex::new(()),
        });
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Decrements the refcount for `handle`'s path; at zero, removes it
    /// from the registry so the next `attach` opens a fresh port.
    pub fn detach(&self, handle: &Arc<BusHandle>) {
        let mut handles = self.handles.lock().unwrap();
        if handle.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            handles.remove(&handle.path);
        }
    }

    pub fn active_paths(&self) -> Vec<String> {
        self.handles.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LineParams {
        LineParams::new(9600, 8, Parity::None, StopBits::One, Duration::from_millis(500))
    }

    #[test]
    fn normalize_leaves_url_transports_intact() {
        assert_eq!(normalize_port("socket://127.0.0.1:6200"), "socket://127.0.0.1:6200");
        assert_eq!(normalize_port("loop://"), "loop://");
    }

    #[test]
    fn attach_twice_with_identical_params_shares_handle() {
        let mgr = SerialBusManager::new();
        let a = mgr.attach("socket://127.0.0.1:6200", params()).unwrap();
        let b = mgr.attach("socket://127.0.0.1:6200", params()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn attach_with_mismatched_params_fails() {
        let mgr = SerialBusManager::new();
        mgr.attach("socket://127.0.0.1:6200", params()).unwrap();
        let mut other = params();
        other.baudrate = 19200;
        let err = mgr.attach("socket://127.0.0.1:6200", other).unwrap_err();
        assert!(matches!(err, SerialBusError::SettingsMismatch { key: "baudrate", .. }));
    }

    #[test]
    fn detach_at_zero_refcount_frees_the_path() {
        let mgr = SerialBusManager::new();
        let handle = mgr.attach("socket://127.0.0.1:6200", params()).unwrap();
        assert_eq!(mgr.active_paths().len(), 1);
        mgr.detach(&handle);
        assert!(mgr.active_paths().is_empty());
    }

    #[test]
    fn write_timeout_defaults_to_read_timeout() {
        let p = params();
        assert_eq!(p.write_timeout, p.timeout);
    }
}
