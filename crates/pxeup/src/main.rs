mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail};
use clap::Parser;
use ipnet::Ipv4Net;
use px_distro::Catalog;
use px_net::iface;
use session::SessionConfig;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::info;

/// Automatically sets up everything for a PXE Linux install.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Config file to read distributions from
    #[arg(short = 'd', long, value_name = "FILE", default_value = "distros.json")]
    distribution_config: PathBuf,

    /// List available distributions & exit
    #[arg(short = 'l', long)]
    list_distributions: bool,

    /// (Wired) interface to handle clients on; defaults to the first
    /// ethernet interface found
    #[arg(short = 'i', long, value_name = "NAME")]
    interface: Option<String>,

    /// Private subnet to use for server & clients
    #[arg(short = 'n', long, value_name = "CIDR", default_value = "10.94.0.0/16")]
    network: Ipv4Net,

    /// Interface with an internet connection to masquerade on, so that
    /// clients have an internet connection; defaults to the default-route
    /// interface
    #[arg(short = 'm', long, value_name = "NAME")]
    masquerade_interface: Option<String>,

    /// Don't masquerade; clients get no internet connection
    #[arg(long, conflicts_with = "masquerade_interface")]
    no_masquerade: bool,

    /// Preseed file for the debian installer
    #[arg(short = 'p', long, value_name = "FILE")]
    preseed_file: Option<PathBuf>,

    /// Port to serve the preseed file on
    #[arg(long, value_name = "PORT", default_value_t = 8000)]
    preseed_port: u16,

    /// How many clients can get an address
    #[arg(long, value_name = "N", default_value_t = 20)]
    dhcp_range_size: u32,

    /// Directory netboot archives are cached in
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Verbosity for log messages (overridden by RUST_LOG)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Distribution to install
    distribution: Option<String>,
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(dir).join("pxeup");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache").join("pxeup");
    }
    PathBuf::from(".cache/pxeup")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let catalog = Catalog::load(&cli.distribution_config)?;
    if cli.list_distributions {
        for name in catalog.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let Some(name) = &cli.distribution else {
        bail!("you must provide a distribution to install, use -l to list them");
    };
    let distribution = catalog
        .get(name)
        .ok_or_else(|| anyhow!("{name}: unknown distribution"))?
        .clone();

    let pxe_iface = match &cli.interface {
        Some(name) => iface::lookup(name).await?,
        None => iface::first_wired_interface().await?,
    };
    let masquerade_iface = if cli.no_masquerade {
        None
    } else {
        Some(match &cli.masquerade_interface {
            Some(name) => iface::lookup(name).await?,
            None => iface::default_route_interface().await?,
        })
    };
    info!(
        "serving {} on {pxe_iface}, network {}",
        distribution.name, cli.network
    );

    let stop = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            info!("received signal {signal}, asking the session to stop");
            stop_on_signal.store(true, Ordering::Relaxed);
        }
    });

    let config = SessionConfig {
        distribution,
        pxe_iface,
        network: cli.network,
        masquerade_iface,
        dhcp_range_size: cli.dhcp_range_size,
        preseed_file: cli.preseed_file,
        preseed_port: cli.preseed_port,
        cache_dir: cli.cache_dir.unwrap_or_else(default_cache_dir),
        stop,
    };

    let code = session::run(config).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
