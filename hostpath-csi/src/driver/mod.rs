//! CSI driver implementation.
//!
//! This module contains the core driver components:
//! - `Driver`: The main CSI driver that runs gRPC servers
//! - `DriverState`: Shared state implementing the volume lifecycles (in `state` submodule)

mod state;

pub use state::{DriverState, PathStats};

use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::signal;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::config::{Config, Endpoint};
use crate::controller::ControllerService;
use crate::csi::{
    FILE_DESCRIPTOR_SET, controller_server::ControllerServer, identity_server::IdentityServer,
    node_server::NodeServer,
};
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::mount::{HostMounter, Mounter};
use crate::node::NodeService;

/// Execute a cleanup operation, logging any errors without failing.
///
/// Use this for cleanup paths where we want to attempt recovery but
/// cannot let cleanup failures mask the original error.
fn log_cleanup_error<F, E>(operation: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = f() {
        warn!(operation, error = %e, "cleanup failed");
    }
}

/// Run `fut` on its own task so it completes even if the caller is dropped.
///
/// tonic drops the handler future when a client cancels the RPC.
pub(crate) async fn detach<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut).await.map_err(Error::join)?
}

/// The CSI driver.
pub struct Driver {
    state: Arc<DriverState>,
}

impl Driver {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_mounter(config, Arc::new(HostMounter))
    }

    pub fn with_mounter(config: Config, mounter: Arc<dyn Mounter>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.volume_root)?;
        Ok(Self {
            state: Arc::new(DriverState::new(config, mounter)),
        })
    }

    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    /// Run the CSI driver until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        let config = &self.state.config;
        info!(
            name = %config.name,
            version = %config.version,
            endpoint = %config.endpoint,
            volume_root = %config.volume_root.display(),
            stage_mode = ?config.stage_mode,
            "starting CSI driver"
        );

        match Endpoint::parse(&config.endpoint)? {
            Endpoint::Unix(path) => self.run_unix(&path).await,
            Endpoint::Tcp(addr) => self.run_tcp(addr).await,
        }
    }

    async fn run_unix(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

        let served = self.serve_grpc(incoming).await;
        log_cleanup_error("remove CSI socket", || fs::remove_file(path));
        served
    }

    async fn run_tcp(&self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        self.serve_grpc(incoming).await
    }

    async fn serve_grpc<S, IO, E>(&self, incoming: S) -> Result<()>
    where
        S: tokio_stream::Stream<Item = std::result::Result<IO, E>> + Send + 'static,
        IO: tokio::io::AsyncRead
            + tokio::io::AsyncWrite
            + tonic::transport::server::Connected
            + Send
            + Unpin
            + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        Server::builder()
            .add_service(reflection)
            .add_service(IdentityServer::new(IdentityService::new(
                self.state.clone(),
            )))
            .add_service(ControllerServer::new(ControllerService::new(
                self.state.clone(),
            )))
            .add_service(NodeServer::new(NodeService::new(self.state.clone())))
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        info!("CSI driver stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            if let Err(e) = ctrl_c.await {
                warn!(error = %e, "failed to wait for SIGINT");
            }
        }
    }
}
