// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `server --config <path>`: loads a gateway configuration, wires the
//! backend-adapter registry, and runs the VXI-11 `DEVICE_CORE` listener
//! (spec.md §6 CLI surface; `scripts/start_server.py`,
//! `scripts/docker_entrypoint.py`).

use std::path::PathBuf;
use std::sync::Arc;

use adapter::AdapterRegistry;
use anyhow::{Context, Result};
use clap::Parser;
use gateway_config::GatewayConfig;
use onc_rpc::{decode_call, encode_success_reply, read_tcp_message, write_tcp_message};
use serial_bus::SerialBusManager;
use tokio::net::{TcpListener, TcpStream};
use vxi11_core::{ConnectionLinks, CoreServer, DEFAULT_MAX_RECV_SIZE};

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "server", about = "VXI-11 protocol gateway core")]
struct Args {
    /// Path to the gateway's YAML configuration file.
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Applies `SERVER_HOST_OVERRIDE` to the loaded configuration unless
/// `DISABLE_SERVER_HOST_OVERRIDE=1`, mirroring the container entrypoint's
/// `maybe_override_server_host` (spec.md §6 env vars).
fn apply_host_override(config: &mut GatewayConfig) {
    if std::env::var("DISABLE_SERVER_HOST_OVERRIDE").as_deref() == Ok("1") {
        return;
    }
    let host = std::env::var("SERVER_HOST_OVERRIDE").unwrap_or_else(|_| "0.0.0.0".to_string());
    tracing::info!(host = %host, "applying server host override");
    config.server.host = host;
}

/// Builds the kind-tag -> factory registry for every backend adapter this
/// gateway supports (spec.md §4.4/§9). MODBUS-RTU and MODBUS-ASCII share
/// one process-wide [`SerialBusManager`] so two logical devices on the
/// same physical bus serialize their transactions (spec.md §4.6).
fn build_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    let bus_manager = Arc::new(SerialBusManager::new());

    registry.register(
        "loopback",
        Arc::new(|_name, _opts, _rules| Ok(Arc::new(drv_loopback::LoopbackAdapter::new()) as Arc<dyn adapter::Adapter>)),
    );
    registry.register(
        "scpi-tcp",
        Arc::new(|_name, opts, _rules| Ok(Arc::new(drv_scpi_tcp::ScpiTcpAdapter::new(opts)?) as Arc<dyn adapter::Adapter>)),
    );
    registry.register(
        "scpi-serial",
        Arc::new(|name, opts, _rules| Ok(Arc::new(drv_scpi_serial::ScpiSerialAdapter::new(name, opts)?) as Arc<dyn adapter::Adapter>)),
    );
    registry.register(
        "usbtmc",
        Arc::new(|name, opts, _rules| Ok(Arc::new(drv_usbtmc::UsbtmcAdapter::new(name, opts)?) as Arc<dyn adapter::Adapter>)),
    );
    registry.register(
        "modbus-tcp",
        Arc::new(|_name, opts, rules| Ok(Arc::new(drv_modbus_tcp::ModbusTcpAdapter::new(opts, rules)?) as Arc<dyn adapter::Adapter>)),
    );
    {
        let bus_manager = bus_manager.clone();
        registry.register(
            "modbus-rtu",
            Arc::new(move |name, opts, rules| {
                Ok(Arc::new(drv_modbus_rtu::ModbusRtuAdapter::new(name, opts, rules, bus_manager.clone())?) as Arc<dyn adapter::Adapter>)
            }),
        );
    }
    {
        let bus_manager = bus_manager.clone();
        registry.register(
            "modbus-ascii",
            Arc::new(move |name, opts, rules| {
                Ok(Arc::new(drv_modbus_ascii::ModbusAsciiAdapter::new(name, opts, rules, bus_manager.clone())?) as Arc<dyn adapter::Adapter>)
            }),
        );
    }
    registry.register(
        "generic-regex",
        Arc::new(|name, opts, rules| Ok(Arc::new(drv_generic_regex::GenericRegexAdapter::new(name, opts, rules)?) as Arc<dyn adapter::Adapter>)),
    );

    registry
}

/// Serves one accepted TCP connection until the client disconnects
/// (framer EOF), tearing down any links it created (spec.md §5).
async fn run_session(stream: TcpStream, server: Arc<CoreServer>) {
    let (mut reader, mut writer) = stream.into_split();
    let conn = ConnectionLinks::new();

    loop {
        let message = match read_tcp_message(&mut reader, MAX_MESSAGE_SIZE).await {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "connection closed with an error");
                break;
            }
        };
        let call = match decode_call(&message) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode RPC call, dropping connection");
                break;
            }
        };
        let body = server.dispatch(&call, &conn).await;
        let reply = encode_success_reply(call.xid, &body);
        if let Err(e) = write_tcp_message(&mut writer, &reply).await {
            tracing::debug!(error = %e, "failed to write reply, dropping connection");
            break;
        }
    }

    server.cleanup_connection(&conn).await;
}

async fn run(args: Args) -> Result<()> {
    if std::env::var("DISABLE_FACADE").as_deref() == Ok("1") {
        tracing::info!("DISABLE_FACADE=1, exiting without starting the VXI-11 core");
        return Ok(());
    }

    let mut config = gateway_config::load_config(&args.config)
        .with_context(|| format!("loading gateway config from {}", args.config.display()))?;
    apply_host_override(&mut config);

    let host = config.server.host.clone();
    let port = config.server.port;
    let portmapper_enabled = config.server.portmapper_enabled;

    let registry = build_registry();
    let server = Arc::new(CoreServer::new(registry, Arc::new(config)));

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding VXI-11 core listener on {host}:{port}"))?;
    let bound_addr = listener.local_addr()?;
    tracing::info!(addr = %bound_addr, max_recv_size = DEFAULT_MAX_RECV_SIZE, "VXI-11 core service listening");

    let mut portmapper_handles = Vec::new();
    if portmapper_enabled {
        portmapper_handles = portmapper_proto::serve(portmapper_proto::PortmapperConfig {
            host: "0.0.0.0".to_string(),
            port: 111,
            vxi_tcp_port: bound_addr.port(),
            enable_udp: true,
            enable_tcp: true,
        })
        .await;
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(peer = %peer, "accepted connection");
                let server = server.clone();
                tokio::spawn(run_session(stream, server));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    for handle in portmapper_handles {
        handle.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
