use crate::{
    device_class::Registry,
    proto::{lv_service_server::LvServiceServer, vg_service_server::VgServiceServer},
};

use super::{lv::LvSvc, notify::Notifier, vg::VgSvc};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{
    net::UnixListener,
    signal::unix::{signal, SignalKind},
};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

/// The lvmd gRPC server, serving the LV and VG services over a Unix
/// domain socket until SIGINT or SIGTERM.
pub struct LvmdGrpcServer;

impl LvmdGrpcServer {
    pub async fn run(socket: &Path, registry: Arc<Registry>) -> Result<(), String> {
        // Remove a stale socket left behind by a previous instance
        match fs::remove_file(socket) {
            Ok(_) => info!("removed stale socket {}", socket.display()),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    return Err(format!(
                        "error removing stale socket {}: {}",
                        socket.display(),
                        err
                    ));
                }
            }
        }
        if let Some(parent) = socket.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("error creating {}: {}", parent.display(), e))?;
        }

        let uds = UnixListener::bind(socket)
            .map_err(|e| format!("error binding {}: {}", socket.display(), e))?;
        info!("lvmd bound to {}", socket.display());

        let notifier = Notifier::new();
        let lv_svc = LvSvc::new(registry.clone(), notifier.clone());
        let vg_svc = VgSvc::new(registry, notifier);

        Server::builder()
            .add_service(LvServiceServer::new(lv_svc))
            .add_service(VgServiceServer::new(vg_svc))
            .serve_with_incoming_shutdown(UnixListenerStream::new(uds), shutdown_signal())
            .await
            .map_err(|e| format!("gRPC server failed with error: {e}"))
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                error!("failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
