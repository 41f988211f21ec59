// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VXI-11 `DEVICE_CORE` RPC program (spec.md §4.9, C10): routes each
//! decoded procedure to the link manager (C9), resource-lock manager (C8)
//! and the link's adapter (C5), and packs a well-formed reply body for
//! every outcome. Handlers never propagate an error to the wire (spec.md
//! §7): every failure path here produces a `DeviceErrorCode` instead.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use adapter::{AdapterError, AdapterRegistry};
use gateway_config::{GatewayConfig, ReloadError, Reloadable};
use link_manager::LinkManager;
use onc_rpc::RpcCall;
use resource_lock::{ResourceLockError, ResourceLockManager};
use vxi11_proto::{procedure, DeviceErrorCode};
use xdr::{Packer, Unpacker};

/// `DEFAULT_MAX_RECV_SIZE` from the original façade (`server.py`):
/// the `max_recv_size` advertised to clients in every `CREATE_LINK` reply.
pub const DEFAULT_MAX_RECV_SIZE: u32 = 1024 * 1024;

/// Tracks the `lid`s created over one TCP connection so that a client
/// disconnect (framer EOF) can tear them all down (spec.md §5: "any link
/// created by that TCP connection is destroyed and its lock is
/// force-released").
#[derive(Default)]
pub struct ConnectionLinks {
    lids: StdMutex<Vec<u32>>,
}

impl ConnectionLinks {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, lid: u32) {
        self.lids.lock().unwrap().push(lid);
    }

    fn untrack(&self, lid: u32) {
        self.lids.lock().unwrap().retain(|&l| l != lid);
    }

    fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut self.lids.lock().unwrap())
    }
}

/// `lock_timeout_ms == 0` means "wait indefinitely", matching the
/// original `timeout_s = lock_timeout_ms / 1000 if lock_timeout_ms else
/// None` (`server.py`, multiple handlers).
fn lock_timeout(ms: u32) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

/// The live, reloadable set of devices and mapping rules a [`CoreServer`]
/// dispatches against.
pub struct CoreServer {
    registry: AdapterRegistry,
    links: LinkManager,
    resources: ResourceLockManager,
    config: tokio::sync::RwLock<Arc<GatewayConfig>>,
    max_recv_size: u32,
}

impl CoreServer {
    pub fn new(registry: AdapterRegistry, config: Arc<GatewayConfig>) -> Self {
        Self {
            registry,
            links: LinkManager::new(),
            resources: ResourceLockManager::new(),
            config: tokio::sync::RwLock::new(config),
            max_recv_size: DEFAULT_MAX_RECV_SIZE,
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Dispatches one decoded `DEVICE_CORE` call and returns the
    /// XDR-encoded procedure result body (the caller wraps it in an RPC
    /// accepted-success reply envelope via `onc_rpc::encode_success_reply`).
    pub async fn dispatch(&self, call: &RpcCall, conn: &ConnectionLinks) -> Vec<u8> {
        let mut unpacker = Unpacker::new(&call.args);
        let mut packer = Packer::new();

        let result = match call.procedure {
            procedure::CREATE_LINK => self.handle_create_link(&mut unpacker, &mut packer, conn).await,
            procedure::DEVICE_WRITE => self.handle_device_write(&mut unpacker, &mut packer).await,
            procedure::DEVICE_READ => self.handle_device_read(&mut unpacker, &mut packer).await,
            procedure::DEVICE_LOCK => self.handle_device_lock(&mut unpacker, &mut packer).await,
            procedure::DEVICE_UNLOCK => self.handle_device_unlock(&mut unpacker, &mut packer).await,
            procedure::DESTROY_LINK => self.handle_destroy_link(&mut unpacker, &mut packer, conn).await,
            procedure::DEVICE_READSTB
            | procedure::DEVICE_TRIGGER
            | procedure::DEVICE_CLEAR
            | procedure::DEVICE_REMOTE
            | procedure::DEVICE_LOCAL
            | procedure::DEVICE_ENABLE_SRQ
            | procedure::DEVICE_DOCMD
            | procedure::CREATE_INTR_CHAN
            | procedure::DESTROY_INTR_CHAN => {
                vxi11_proto::pack_device_error(&mut packer, DeviceErrorCode::OperationNotSupported);
                Ok(())
            }
            other => {
                tracing::warn!(procedure = other, "unrecognized DEVICE_CORE procedure");
                vxi11_proto::pack_device_error(&mut packer, DeviceErrorCode::OperationNotSupported);
                Ok(())
            }
        };

        if let Err(()) = result {
            tracing::error!(procedure = call.procedure, "malformed procedure arguments");
        }
        packer.into_bytes()
    }

    async fn handle_create_link(&self, u: &mut Unpacker, p: &mut Packer, conn: &ConnectionLinks) -> Result<(), ()> {
        let parms = vxi11_proto::unpack_create_link_parms(u).map_err(|_| ())?;
        tracing::info!(client_id = parms.client_id, device = %parms.device, "create_link");

        let (error, lid) = self.try_create_link(&parms).await;
        if error.code() == DeviceErrorCode::NoError.code() {
            conn.track(lid);
        }
        vxi11_proto::pack_create_link_resp(
            p,
            &vxi11_proto::CreateLinkResp { error, lid, abort_port: 0, max_recv_size: self.max_recv_size },
        );
        Ok(())
    }

    /// Builds and (optionally) locks a new link, rolling back all partial
    /// state on any failure so `CREATE_LINK` either fully succeeds or is
    /// not observable at all (spec.md §7).
    async fn try_create_link(&self, parms: &vxi11_proto::CreateLinkParms) -> (DeviceErrorCode, u32) {
        let config = self.config.read().await.clone();
        let device = match config.devices.get(&parms.device) {
            Some(d) => d,
            None => return (DeviceErrorCode::DeviceNotAccessible, 0),
        };
        let mappings = config.mappings.get(&parms.device).map(Vec::as_slice).unwrap_or(&[]);

        let adapter = match self.registry.build(device.kind.tag(), &device.name, &device.settings, mappings) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(device = %parms.device, error = %e, "adapter construction failed");
                return (DeviceErrorCode::OutOfResources, 0);
            }
        };

        if let Err(e) = adapter.connect().await {
            tracing::warn!(device = %parms.device, error = %e, "adapter connect failed");
            return (DeviceErrorCode::OutOfResources, 0);
        }

        let link = self.links.create_link(parms.device.clone(), adapter, parms.client_id);

        if parms.lock_device {
            let timeout = lock_timeout(parms.lock_timeout_ms);
            match self.resources.lock(&parms.device, link.lid, timeout).await {
                Ok(()) => match link.adapter.acquire().await {
                    Ok(()) => {
                        link.set_has_lock(true);
                    }
                    Err(e) => {
                        tracing::warn!(device = %parms.device, error = %e, "adapter acquire failed during create_link");
                        self.resources.force_unlock(&parms.device);
                        let _ = self.links.destroy_link(link.lid);
                        link.adapter.disconnect().await;
                        return (DeviceErrorCode::OutOfResources, 0);
                    }
                },
                Err(ResourceLockError::Timeout) => {
                    let _ = self.links.destroy_link(link.lid);
                    link.adapter.disconnect().await;
                    return (DeviceErrorCode::DeviceLockedByAnotherLink, 0);
                }
                Err(ResourceLockError::NotOwner) => unreachable!("lock() never returns NotOwner"),
            }
        }

        (DeviceErrorCode::NoError, link.lid)
    }

    async fn handle_device_write(&self, u: &mut Unpacker, p: &mut Packer) -> Result<(), ()> {
        let parms = vxi11_proto::unpack_device_write_parms(u).map_err(|_| ())?;
        tracing::debug!(lid = parms.lid, len = parms.data.len(), "device_write");

        let (error, written) = match self.links.get(parms.lid) {
            Err(_) => (DeviceErrorCode::InvalidLinkIdentifier, 0),
            Ok(link) => {
                if link.adapter.requires_lock() && !link.has_lock() {
                    (DeviceErrorCode::NoLockHeldByThisLink, 0)
                } else {
                    match link.adapter.write(&parms.data).await {
                        Ok(n) => (DeviceErrorCode::NoError, n as u32),
                        Err(e) => (adapter_io_error(&e), 0),
                    }
                }
            }
        };
        vxi11_proto::pack_device_write_resp(p, error, written);
        Ok(())
    }

    async fn handle_device_read(&self, u: &mut Unpacker, p: &mut Packer) -> Result<(), ()> {
        let parms = vxi11_proto::unpack_device_read_parms(u).map_err(|_| ())?;
        tracing::debug!(lid = parms.lid, request_size = parms.request_size, "device_read");

        let (error, reason, data) = match self.links.get(parms.lid) {
            Err(_) => (DeviceErrorCode::InvalidLinkIdentifier, 0, Vec::new()),
            Ok(link) => {
                if link.adapter.requires_lock() && !link.has_lock() {
                    (DeviceErrorCode::NoLockHeldByThisLink, 0, Vec::new())
                } else {
                    match link.adapter.read(parms.request_size as usize).await {
                        Ok(bytes) => {
                            // reason=0 on an empty payload, matching the original
                            // façade; some clients treat 0 as "continue" (spec.md §9).
                            let reason = if bytes.is_empty() { 0 } else { vxi11_proto::RX_END };
                            (DeviceErrorCode::NoError, reason, bytes)
                        }
                        Err(e) => (adapter_io_error(&e), 0, Vec::new()),
                    }
                }
            }
        };
        vxi11_proto::pack_device_read_resp(p, error, reason, &data);
        Ok(())
    }

    async fn handle_device_lock(&self, u: &mut Unpacker, p: &mut Packer) -> Result<(), ()> {
        let parms = vxi11_proto::unpack_device_lock_parms(u).map_err(|_| ())?;
        tracing::debug!(lid = parms.lid, "device_lock");

        let error = match self.links.get(parms.lid) {
            Err(_) => DeviceErrorCode::InvalidLinkIdentifier,
            Ok(link) => {
                let timeout = lock_timeout(parms.lock_timeout_ms);
                match self.resources.lock(&link.device_name, link.lid, timeout).await {
                    Ok(()) => match link.adapter.acquire().await {
                        Ok(()) => {
                            link.set_has_lock(true);
                            DeviceErrorCode::NoError
                        }
                        Err(e) => {
                            tracing::warn!(lid = link.lid, error = %e, "adapter acquire failed during device_lock");
                            self.resources.force_unlock(&link.device_name);
                            DeviceErrorCode::IoError
                        }
                    },
                    Err(ResourceLockError::Timeout) => DeviceErrorCode::DeviceLockedByAnotherLink,
                    Err(ResourceLockError::NotOwner) => unreachable!("lock() never returns NotOwner"),
                }
            }
        };
        vxi11_proto::pack_device_error(p, error);
        Ok(())
    }

    async fn handle_device_unlock(&self, u: &mut Unpacker, p: &mut Packer) -> Result<(), ()> {
        let lid = vxi11_proto::unpack_device_link(u).map_err(|_| ())?;
        tracing::debug!(lid, "device_unlock");

        let error = match self.links.get(lid) {
            Err(_) => DeviceErrorCode::InvalidLinkIdentifier,
            Ok(link) => {
                if !link.has_lock() {
                    DeviceErrorCode::NoLockHeldByThisLink
                } else {
                    match self.resources.unlock(&link.device_name, link.lid) {
                        Ok(()) => {
                            link.adapter.release().await;
                            link.set_has_lock(false);
                            DeviceErrorCode::NoError
                        }
                        Err(ResourceLockError::NotOwner) => DeviceErrorCode::NoLockHeldByThisLink,
                        Err(ResourceLockError::Timeout) => unreachable!("unlock() never times out"),
                    }
                }
            }
        };
        vxi11_proto::pack_device_error(p, error);
        Ok(())
    }

    async fn handle_destroy_link(&self, u: &mut Unpacker, p: &mut Packer, conn: &ConnectionLinks) -> Result<(), ()> {
        let lid = vxi11_proto::unpack_device_link(u).map_err(|_| ())?;
        tracing::info!(lid, "destroy_link");

        let error = self.destroy_link(lid).await;
        conn.untrack(lid);
        vxi11_proto::pack_device_error(p, error);
        Ok(())
    }

    async fn destroy_link(&self, lid: u32) -> DeviceErrorCode {
        match self.links.destroy_link(lid) {
            Err(_) => DeviceErrorCode::InvalidLinkIdentifier,
            Ok(link) => {
                if link.has_lock() {
                    self.resources.force_unlock(&link.device_name);
                }
                link.adapter.disconnect().await;
                DeviceErrorCode::NoError
            }
        }
    }

    /// Tears down every link this connection created (spec.md §5), called
    /// when the RPC framer observes a clean client disconnect.
    pub async fn cleanup_connection(&self, conn: &ConnectionLinks) {
        for lid in conn.drain() {
            self.destroy_link(lid).await;
        }
    }
}

impl Reloadable for CoreServer {
    /// Swaps in a freshly validated configuration; existing links keep
    /// their already-built adapters, only future `CREATE_LINK` calls see
    /// the new device/mapping set (spec.md §9 REDESIGN FLAGS).
    fn reload_config(&self, new_config: Arc<GatewayConfig>) -> Result<(), ReloadError> {
        match self.config.try_write() {
            Ok(mut guard) => {
                *guard = new_config;
                Ok(())
            }
            Err(_) => Err(ReloadError::Unsupported),
        }
    }
}

fn adapter_io_error(err: &AdapterError) -> DeviceErrorCode {
    match err {
        AdapterError::Timeout => DeviceErrorCode::IoTimeout,
        _ => DeviceErrorCode::IoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_config::parse_config_str;
    use std::sync::Arc as StdArc;

    struct EchoAdapter {
        requires_lock: bool,
    }

    #[async_trait]
    impl adapter::Adapter for EchoAdapter {
        async fn acquire(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn release(&self) {}
        async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
            Ok(data.len())
        }
        async fn read(&self, _max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
            Ok(b"hello".to_vec())
        }
        fn requires_lock(&self) -> bool {
            self.requires_lock
        }
    }

    fn server_with_echo(requires_lock: bool) -> CoreServer {
        let yaml = "devices:\n  d0:\n    type: loopback\nmappings: {}\n";
        let config = StdArc::new(parse_config_str(yaml).unwrap());
        let mut registry = AdapterRegistry::new();
        registry.register(
            "loopback",
            StdArc::new(move |_name, _opts, _rules| Ok(StdArc::new(EchoAdapter { requires_lock }) as StdArc<dyn adapter::Adapter>)),
        );
        CoreServer::new(registry, config)
    }

    fn create_link_call(xid: u32, device: &str, lock_device: bool, lock_timeout_ms: u32) -> RpcCall {
        let mut p = Packer::new();
        p.pack_int(1);
        p.pack_bool(lock_device);
        p.pack_uint(lock_timeout_ms);
        p.pack_string(device);
        RpcCall {
            xid,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::CREATE_LINK,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: p.into_bytes(),
        }
    }

    fn device_link_call(procedure: u32, lid: u32) -> RpcCall {
        let mut p = Packer::new();
        p.pack_uint(lid);
        RpcCall {
            xid: 1,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: p.into_bytes(),
        }
    }

    #[tokio::test]
    async fn s1_loopback_echo_scenario() {
        let server = server_with_echo(true);
        let conn = ConnectionLinks::new();

        let body = server.dispatch(&create_link_call(1, "d0", false, 0), &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        let lid = u.unpack_uint().unwrap();
        assert_eq!(lid, 1);

        let mut write_args = Packer::new();
        write_args.pack_uint(lid);
        write_args.pack_uint(0);
        write_args.pack_uint(0);
        write_args.pack_uint(0);
        write_args.pack_opaque(b"hello");
        let write_call = RpcCall {
            xid: 2,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_WRITE,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: write_args.into_bytes(),
        };
        let body = server.dispatch(&write_call, &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoLockHeldByThisLink.code());

        let mut lock_args = Packer::new();
        lock_args.pack_uint(lid);
        lock_args.pack_uint(0);
        lock_args.pack_uint(1000);
        let lock_call = RpcCall {
            xid: 3,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_LOCK,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: lock_args.into_bytes(),
        };
        let body = server.dispatch(&lock_call, &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());

        let body = server.dispatch(&write_call, &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        assert_eq!(u.unpack_uint().unwrap(), 5);

        let mut read_args = Packer::new();
        read_args.pack_uint(lid);
        read_args.pack_uint(1024);
        read_args.pack_uint(0);
        read_args.pack_uint(0);
        read_args.pack_uint(0);
        read_args.pack_uint(0);
        let read_call = RpcCall {
            xid: 4,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_READ,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: read_args.into_bytes(),
        };
        let body = server.dispatch(&read_call, &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        assert_eq!(u.unpack_uint().unwrap(), vxi11_proto::RX_END);
        assert_eq!(u.unpack_opaque().unwrap(), b"hello");

        let body = server.dispatch(&device_link_call(procedure::DEVICE_UNLOCK, lid), &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());

        let body = server.dispatch(&device_link_call(procedure::DESTROY_LINK, lid), &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        assert_eq!(server.link_count(), 0);
    }

    #[tokio::test]
    async fn create_link_rejects_unknown_device() {
        let server = server_with_echo(false);
        let conn = ConnectionLinks::new();
        let body = server.dispatch(&create_link_call(1, "ghost", false, 0), &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::DeviceNotAccessible.code());
        assert_eq!(u.unpack_uint().unwrap(), 0);
    }

    #[tokio::test]
    async fn unsupported_procedures_reply_without_crashing() {
        let server = server_with_echo(false);
        let conn = ConnectionLinks::new();
        let call = RpcCall {
            xid: 1,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_TRIGGER,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: Vec::new(),
        };
        let body = server.dispatch(&call, &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::OperationNotSupported.code());
    }

    #[tokio::test]
    async fn s2_lock_contention_then_release() {
        let server = Arc::new(server_with_echo(true));
        let conn_a = ConnectionLinks::new();
        let conn_b = ConnectionLinks::new();

        let body = server.dispatch(&create_link_call(1, "d0", false, 0), &conn_a).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        let lid_a = u.unpack_uint().unwrap();

        let body = server.dispatch(&create_link_call(2, "d0", false, 0), &conn_b).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        let lid_b = u.unpack_uint().unwrap();

        let mut lock_a = Packer::new();
        lock_a.pack_uint(lid_a);
        lock_a.pack_uint(0);
        lock_a.pack_uint(0);
        let lock_a_call = RpcCall {
            xid: 3,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_LOCK,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: lock_a.into_bytes(),
        };
        let body = server.dispatch(&lock_a_call, &conn_a).await;
        assert_eq!(Unpacker::new(&body).unpack_uint().unwrap(), DeviceErrorCode::NoError.code());

        let mut lock_b = Packer::new();
        lock_b.pack_uint(lid_b);
        lock_b.pack_uint(0);
        lock_b.pack_uint(200);
        let lock_b_call = RpcCall {
            xid: 4,
            program: vxi11_proto::DEVICE_CORE,
            version: vxi11_proto::DEVICE_CORE_VERSION,
            procedure: procedure::DEVICE_LOCK,
            cred: onc_rpc::OpaqueAuth::null(),
            verf: onc_rpc::OpaqueAuth::null(),
            args: lock_b.into_bytes(),
        };
        let body = server.dispatch(&lock_b_call, &conn_b).await;
        assert_eq!(Unpacker::new(&body).unpack_uint().unwrap(), DeviceErrorCode::DeviceLockedByAnotherLink.code());

        let body = server.dispatch(&device_link_call(procedure::DEVICE_UNLOCK, lid_a), &conn_a).await;
        assert_eq!(Unpacker::new(&body).unpack_uint().unwrap(), DeviceErrorCode::NoError.code());

        let body = server.dispatch(&lock_b_call, &conn_b).await;
        assert_eq!(Unpacker::new(&body).unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
    }

    #[tokio::test]
    async fn connection_cleanup_destroys_tracked_links() {
        let server = server_with_echo(false);
        let conn = ConnectionLinks::new();
        let body = server.dispatch(&create_link_call(1, "d0", false, 0), &conn).await;
        let mut u = Unpacker::new(&body);
        assert_eq!(u.unpack_uint().unwrap(), DeviceErrorCode::NoError.code());
        assert_eq!(server.link_count(), 1);

        server.cleanup_connection(&conn).await;
        assert_eq!(server.link_count(), 0);
    }
}
