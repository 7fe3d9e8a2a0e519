// meshecho: LXMF-style echo bot on a LAN mesh.

mod announcer;
mod bot;
mod config;
mod discovery;
mod mesh;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use meshecho_core::destination::{DELIVERY_APP, DELIVERY_ASPECTS};
use meshecho_core::{
    AnnounceSchedule, AppNamespace, Destination, EchoError, EchoHandler, Identity, IdentitySource,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bot::EchoBot;
use crate::mesh::{Mesh, MeshSettings};

/// Log filter when RUST_LOG is unset.
const DEFAULT_LOG_FILTER: &str = "info,meshecho=info";

/// Echo bot: replies to every message with the same title, content and fields.
#[derive(Debug, Parser)]
#[command(name = "meshecho", version)]
struct Cli {
    /// Identity file; created with a fresh identity when missing.
    #[arg(long)]
    identity_file: Option<PathBuf>,
    /// Name carried in announces.
    #[arg(long)]
    display_name: Option<String>,
    /// Seconds between announces; 0 or less announces only at startup.
    #[arg(long, allow_negative_numbers = true)]
    announce_interval_seconds: Option<i64>,
    /// Skip replies to peers requiring a higher stamp cost.
    #[arg(long)]
    max_outbound_stamp_cost: Option<u8>,
    /// Config file (default: ~/.config/meshecho/config.toml, then /etc/meshecho/config.toml).
    #[arg(long = "config")]
    config_file: Option<PathBuf>,
    #[arg(long)]
    discovery_port: Option<u16>,
    #[arg(long)]
    link_port: Option<u16>,
}

impl Cli {
    fn overrides(self) -> config::Overrides {
        config::Overrides {
            config_file: self.config_file,
            identity_file: self.identity_file,
            display_name: self.display_name,
            announce_interval_seconds: self.announce_interval_seconds,
            max_outbound_stamp_cost: self.max_outbound_stamp_cost,
            discovery_port: self.discovery_port,
            link_port: self.link_port,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cfg = config::load(&cli.overrides())?;

    let (identity, source) = Identity::load_or_create(&cfg.identity_file)?;
    match source {
        IdentitySource::Created => info!(
            identity = %identity.hash(),
            path = ?cfg.identity_file,
            "created new identity"
        ),
        IdentitySource::Loaded => info!(
            identity = %identity.hash(),
            path = ?cfg.identity_file,
            "loaded identity"
        ),
    }
    let identity = Arc::new(identity);
    let destination = Arc::new(register_delivery(&identity, &cfg.display_name)?);
    info!(
        destination = %destination.hash(),
        display_name = %destination.display_name(),
        "echo bot ready"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (mesh, channels) = Mesh::start(
            identity.clone(),
            destination.clone(),
            MeshSettings::from_config(&cfg),
        )
        .await
        .context("cannot start mesh transport")?;
        let mesh = Arc::new(mesh);

        let schedule = AnnounceSchedule::from_interval_seconds(cfg.announce_interval_seconds);
        let announcer = announcer::spawn_announcer(mesh.clone(), schedule);

        let handler = EchoHandler::new(destination.hash(), cfg.max_outbound_stamp_cost);
        let bot = Arc::new(EchoBot::new(handler, mesh));
        tokio::spawn(bot.run(channels.inbound));
        tokio::spawn(bot::log_outcomes(channels.reports));

        shutdown_signal().await?;
        info!("shutting down");
        announcer.abort();
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Register the delivery destination; a bad namespace is a configuration error.
fn register_delivery(identity: &Identity, display_name: &str) -> Result<Destination, EchoError> {
    let namespace = AppNamespace::new(DELIVERY_APP, DELIVERY_ASPECTS)?;
    Ok(Destination::register(identity, namespace, display_name))
}

/// Wait for Ctrl+C or SIGTERM (Unix). In-flight deliveries are dropped with the runtime.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
