//! Jiva CSI plugin server.
//!
//! Serves the CSI Identity service plus either the Controller or the Node
//! service, depending on the plugin role, on a unix socket or tcp endpoint.

use std::{io::ErrorKind, path::Path, sync::Arc};

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jiva_csi::{
    config::{CliArgs, Config, Endpoint, PluginRole},
    controller::Controller,
    csi::{
        controller_server::ControllerServer,
        identity_server::IdentityServer,
        node_server::NodeServer,
    },
    dev::Iscsiadm,
    identity::Identity,
    mount::SysMounter,
    node::Node,
    shutdown_event,
    store::KubeVolumeStore,
    volume::VolumeDefaults,
};

/// Remove a socket left behind by a previous run.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::try_from(CliArgs::parse())?;

    // env var takes precedence over cmd line options
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directives()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        driver = config.driver_name(),
        role = ?config.role(),
        endpoint = ?config.endpoint(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting jiva CSI plugin"
    );

    let store = Arc::new(KubeVolumeStore::new().await?);
    let router = Server::builder()
        .add_service(IdentityServer::new(Identity::new(config.driver_name())));
    let router = match config.role() {
        PluginRole::Controller => {
            let defaults =
                VolumeDefaults::default().with_namespace(config.namespace());
            router.add_service(ControllerServer::new(Controller::new(
                store, defaults,
            )))
        }
        PluginRole::Node => {
            let node = Node::new(
                config.node_id(),
                config.namespace(),
                store,
                Arc::new(Iscsiadm::new()),
                Arc::new(SysMounter::new()),
            )
            .with_readiness(config.retry_policy())
            .with_reachability(config.retry_policy());
            router.add_service(NodeServer::new(node))
        }
    };

    let shutdown = async {
        let signal = shutdown_event::wait().await;
        warn!(?signal, "Shutting down the CSI server");
    };

    match config.endpoint() {
        Endpoint::Unix(path) => {
            remove_stale_socket(path)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(path)?;
            info!("CSI plugin bound to {}", path.display());
            router
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    shutdown,
                )
                .await?;
        }
        Endpoint::Tcp(address) => {
            info!("CSI plugin bound to {}", address);
            router.serve_with_shutdown(*address, shutdown).await?;
        }
    }

    Ok(())
}
