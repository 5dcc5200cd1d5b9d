//! The lvmd daemon: loads the device class configuration, binds the gRPC
//! services to a Unix domain socket and serves until signalled. SIGHUP
//! reloads the configuration without disturbing requests in flight.

use clap::Parser;
use lvmd::{config::Config, device_class::Registry, grpc::LvmdGrpcServer, lvm};
use std::{path::PathBuf, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[clap(
    name = "lvmd",
    about = "Node-local logical volume manager daemon",
    version
)]
struct CliArgs {
    /// Path to the configuration file.
    #[clap(long, default_value = "/etc/lvmd/lvmd.yaml")]
    config: PathBuf,
    /// Wrap every lvm invocation with nsenter to administer the host's
    /// LVM state from within a container.
    #[clap(long)]
    container: bool,
    /// Unix domain socket to listen on, overriding the configuration
    /// file.
    #[clap(long)]
    socket_name: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = CliArgs::parse();

    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    lvm::set_containerized(args.container);

    let config = Config::load(&args.config).map_err(|e| e.to_string())?;
    let socket = args
        .socket_name
        .unwrap_or_else(|| PathBuf::from(&config.socket_name));
    let registry = Arc::new(Registry::new(&config));
    info!(
        "loaded {} device classes from {}",
        config.device_classes.len(),
        args.config.display()
    );

    let mut hangup = signal(SignalKind::hangup())
        .map_err(|e| format!("failed to install SIGHUP handler: {e}"))?;
    tokio::spawn({
        let registry = registry.clone();
        let path = args.config.clone();
        async move {
            while hangup.recv().await.is_some() {
                match Config::load(&path) {
                    Ok(config) => {
                        registry.reload(&config);
                        info!("configuration reloaded from {}", path.display());
                    }
                    Err(error) => error!("failed to reload configuration: {error}"),
                }
            }
        }
    });

    LvmdGrpcServer::run(&socket, registry).await
}
