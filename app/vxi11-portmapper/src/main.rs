// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `portmapper --host H --port 111 --vxi-port N [--no-udp] [--no-tcp]`:
//! the standalone mini-portmapper, run separately from the VXI-11 core
//! when the two need different privilege levels (the core binds a high
//! port; this binds the privileged port 111) (spec.md §6;
//! `scripts/run_portmapper.py`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use portmapper_proto::PortmapperConfig;

#[derive(Parser, Debug)]
#[command(name = "portmapper", about = "Minimal ONC portmapper for VXI-11 discovery")]
struct Args {
    /// Host/interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (111 requires elevated privileges on most systems).
    #[arg(long, default_value_t = 111)]
    port: u16,

    /// VXI-11 core TCP port to answer GETPORT requests with.
    #[arg(long = "vxi-port")]
    vxi_port: Option<u16>,

    /// Optional gateway config.yaml to read `server.port` from when
    /// `--vxi-port` is not given.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    no_udp: bool,

    #[arg(long)]
    no_tcp: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn resolve_vxi_port(args: &Args) -> Result<u16> {
    if let Some(port) = args.vxi_port {
        return Ok(port);
    }
    if let Some(config_path) = &args.config {
        let config = gateway_config::load_config(config_path)
            .with_context(|| format!("loading gateway config from {}", config_path.display()))?;
        return Ok(config.server.port);
    }
    tracing::warn!("neither --vxi-port nor --config given; GETPORT will answer 0 for every program");
    Ok(0)
}

async fn run(args: Args) -> Result<()> {
    let vxi_tcp_port = resolve_vxi_port(&args)?;
    tracing::info!(host = %args.host, port = args.port, vxi_tcp_port, "starting portmapper");

    let handles = portmapper_proto::serve(PortmapperConfig {
        host: args.host.clone(),
        port: args.port,
        vxi_tcp_port,
        enable_udp: !args.no_udp,
        enable_tcp: !args.no_tcp,
    })
    .await;

    if handles.is_empty() {
        bail!("neither UDP nor TCP listener could be bound");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "portmapper failed");
        std::process::exit(1);
    }
}
