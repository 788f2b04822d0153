//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage → listeners
//! - Shutdown order: listeners → storage

use crate::adapters::etcd::{HeaderTemplate, LimitedServer};
use crate::core::config::Config;
use crate::kv::{Backend, SqlLog};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
#[cfg(feature = "grpc")]
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Datastore connection and schema.
    pub storage: ComponentHealth,
    /// gRPC listener.
    pub listeners: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            listeners: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.storage == ComponentHealth::Healthy && self.listeners == ComponentHealth::Healthy
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        self.storage != ComponentHealth::Failed && self.listeners != ComponentHealth::Failed
    }
}

/// Statebase runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Storage engine, once the datastore is open.
    backend: Option<Arc<SqlLog>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// gRPC server task handle.
    #[cfg(feature = "grpc")]
    grpc_handle: Option<JoinHandle<crate::core::error::StatebaseResult<()>>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            backend: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            #[cfg(feature = "grpc")]
            grpc_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the storage engine (if initialized).
    pub fn backend(&self) -> Option<Arc<SqlLog>> {
        self.backend.clone()
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Open the datastore and start the listener.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            dialect = %self.config.datastore.dialect_kind()?,
            bind = %self.config.listener.bind,
            "starting statebase runtime"
        );

        self.init_storage().await?;
        self.start_listeners().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("statebase runtime started");

        Ok(())
    }

    /// Connect to the datastore and migrate the schema.
    async fn init_storage(&mut self) -> Result<()> {
        tracing::debug!("initializing storage layer");

        match SqlLog::open(&self.config.datastore).await {
            Ok(engine) => {
                let revision = engine.current_revision().await?;
                self.backend = Some(Arc::new(engine));
                self.health.storage = ComponentHealth::Healthy;
                tracing::info!(
                    endpoint = %self.config.datastore.redacted_endpoint(),
                    revision,
                    "storage layer initialized"
                );
                Ok(())
            }
            Err(err) => {
                self.health.storage = ComponentHealth::Failed;
                Err(err).context("failed to open datastore")
            }
        }
    }

    /// Build the request translator over the opened backend.
    fn limited_server(&self) -> Result<LimitedServer> {
        let backend: Arc<dyn Backend> = self
            .backend
            .clone()
            .context("storage layer is not initialized")?;
        Ok(LimitedServer::new(
            backend,
            HeaderTemplate::from(&self.config.listener),
        ))
    }

    /// Start network listeners.
    async fn start_listeners(&mut self) -> Result<()> {
        tracing::debug!("starting network listeners");
        let server = self.limited_server()?;

        #[cfg(feature = "grpc")]
        {
            use crate::adapters::etcd::grpc::EtcdGrpcServer;

            let listener = &self.config.listener;
            let bind_addr: std::net::SocketAddr = listener
                .bind
                .parse()
                .context("invalid gRPC bind address")?;

            if !listener.has_tls() && !listener.insecure {
                anyhow::bail!(
                    "gRPC listener requires TLS configuration or insecure=true. \
                    Set tls_chain_path and tls_key_path, or set insecure=true for testing."
                );
            }

            if !listener.has_tls() {
                tracing::warn!(
                    bind = %bind_addr,
                    "starting gRPC server in INSECURE mode (no TLS)"
                );
            }

            let grpc = EtcdGrpcServer::new(
                bind_addr,
                listener.clone(),
                server,
                self.shutdown_rx.clone(),
            );

            // Spawn the gRPC server as a background task
            let handle = tokio::spawn(async move { grpc.run().await });

            self.grpc_handle = Some(handle);
            tracing::info!(bind = %bind_addr, "gRPC listener started");
        }

        #[cfg(not(feature = "grpc"))]
        {
            let _ = server;
            tracing::warn!("built without the grpc feature; no listener started");
        }

        self.health.listeners = ComponentHealth::Healthy;
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_requested = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        #[cfg(feature = "grpc")]
        let server_exit = async {
            match self.grpc_handle.as_mut() {
                Some(handle) => match handle.await {
                    Ok(Ok(())) => tracing::info!("gRPC server stopped normally"),
                    Ok(Err(e)) => tracing::error!(error = %e, "gRPC server failed"),
                    Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
                },
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(feature = "grpc"))]
        let server_exit = std::future::pending::<()>();

        let mut server_exited = false;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = shutdown_requested => {
                tracing::info!("shutdown requested by component");
            }
            _ = server_exit => {
                server_exited = true;
            }
        }

        #[cfg(feature = "grpc")]
        if server_exited {
            self.grpc_handle = None;
        }
        #[cfg(not(feature = "grpc"))]
        let _ = server_exited;

        self.stop().await?;
        Ok(())
    }

    /// Stop all runtime components.
    ///
    /// Components are stopped in reverse order:
    /// 1. Network listeners
    /// 2. Storage layer
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping statebase runtime");
        self.running.store(false, Ordering::Release);

        // Signal shutdown to all components
        let _ = self.shutdown_tx.send(true);

        self.stop_listeners().await?;
        self.stop_storage().await?;

        tracing::info!("statebase runtime stopped");
        Ok(())
    }

    /// Stop network listeners.
    async fn stop_listeners(&mut self) -> Result<()> {
        tracing::debug!("stopping network listeners");
        self.health.listeners = ComponentHealth::Stopping;

        #[cfg(feature = "grpc")]
        {
            if let Some(handle) = self.grpc_handle.take() {
                // The server drains in-flight calls after the shutdown signal
                match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                    Ok(Ok(Ok(()))) => {
                        tracing::info!("gRPC server stopped");
                    }
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(error = %e, "gRPC server stopped with error");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "gRPC server task panicked");
                    }
                    Err(_) => {
                        tracing::warn!("gRPC server stop timed out");
                    }
                }
            }
        }

        self.health.listeners = ComponentHealth::Stopped;
        Ok(())
    }

    /// Close the connection pool.
    async fn stop_storage(&mut self) -> Result<()> {
        tracing::debug!("stopping storage layer");
        self.health.storage = ComponentHealth::Stopping;

        if let Some(backend) = self.backend.take() {
            backend.driver().close().await;
        }

        self.health.storage = ComponentHealth::Stopped;
        Ok(())
    }

    /// Open storage only, without listeners or signal handling.
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.init_storage().await?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the runtime for tests.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::Release);
        self.stop_storage().await
    }
}
