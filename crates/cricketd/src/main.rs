use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cricketd::discovery;
use cricketd::telemetry;
use cricketd::types::{ClientId, NetLocation};
use cricketd::Server;

/// The cricket fleet controller.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Drive a virtual cricket instead of real hardware: "builtin"
    /// starts one in-process, "ip:port" points at one running
    /// elsewhere, and empty expects an external discovery feed.
    #[arg(long, default_value = "")]
    r#virtual: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    let config = cricketconf::Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let virtual_location = resolve_virtual(&cli.r#virtual, &config).await?;
    let server =
        Server::new(&config, virtual_location.is_some()).context("compiling configuration")?;

    let (announcements_tx, announcements_rx) = mpsc::channel(16);
    let _announcements_keepalive = match virtual_location {
        Some(location) => {
            let roster: Vec<ClientId> = config
                .clients
                .keys()
                .map(|id| ClientId::from(id.as_str()))
                .collect();
            if roster.is_empty() {
                bail!("virtual mode needs at least one configured client");
            }
            discovery::spawn_virtual_announcer(roster, location, announcements_tx);
            None
        }
        None => {
            // mDNS browsing is a collaborator, not part of the daemon;
            // whatever runs it feeds announcements in. Without one the
            // server idles with an empty fleet.
            warn!("no discovery source configured; waiting for nothing");
            Some(announcements_tx)
        }
    };

    server.start(announcements_rx);
    info!("cricket server running");

    wait_for_shutdown().await;
    info!("shutting down");
    Ok(())
}

/// Work out where the virtual cricket lives, starting one if asked.
async fn resolve_virtual(
    flag: &str,
    config: &cricketconf::Config,
) -> Result<Option<NetLocation>> {
    match flag {
        "" => Ok(None),
        "builtin" => {
            let mut catalog = vcricket::Catalog::new();
            for file in config.files.values() {
                catalog.insert(u32::from(file.folder), u32::from(file.file), file.duration);
            }
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let bound = vcricket::serve(addr, catalog)
                .await
                .context("starting builtin virtual cricket")?;
            Ok(Some(NetLocation {
                addr: bound.ip(),
                port: bound.port(),
            }))
        }
        addr => {
            let location = addr
                .parse::<NetLocation>()
                .map_err(|err| anyhow::anyhow!("bad --virtual address {addr:?}: {err}"))?;
            Ok(Some(location))
        }
    }
}

async fn wait_for_shutdown() {
    // SIGINT from a terminal, SIGTERM from everything else.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM");
        }
    }
}
