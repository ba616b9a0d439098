use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use data_model::FunctionRegistry;
use runtime_driver::{DockerDriver, MemoryDriver, RuntimeDriver};
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    adopt_sync::AdoptSync,
    config::{DriverConfig, OrchestratorConfig, load_functions},
    ensure::Provisioner,
    lifecycle_store::LifecycleStore,
    ports::PortAllocator,
    reaper::Reaper,
    routes::{RouteState, create_routes},
};

#[derive(Clone)]
pub struct Service {
    pub config: Arc<OrchestratorConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<LifecycleStore>,
    pub driver: Arc<dyn RuntimeDriver>,
    pub registry: Arc<FunctionRegistry>,
    pub ports: Arc<PortAllocator>,
    pub provisioner: Arc<Provisioner>,
    pub reaper: Arc<Reaper>,
}

impl Service {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let registry = Arc::new(FunctionRegistry::new(
            load_functions(&config.functions_config_path)
                .context("error loading functions config")?,
        ));
        let driver = build_driver(&config)?;
        Self::with_parts(config, driver, registry)
    }

    /// Wire the service from pre-built parts; tests inject the memory driver
    /// and an in-code registry here.
    pub fn with_parts(
        config: OrchestratorConfig,
        driver: Arc<dyn RuntimeDriver>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store = Arc::new(LifecycleStore::new());
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start..config.port_range_end,
        ));
        let provisioner = Arc::new(Provisioner::new(
            driver.clone(),
            store.clone(),
            registry.clone(),
            ports.clone(),
            config.clone(),
        ));
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            driver.clone(),
            ports.clone(),
            registry.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            driver,
            registry,
            ports,
            provisioner,
            reaper,
        })
    }

    /// Reconcile with the runtime, then serve RPCs until shutdown.
    pub async fn start(&mut self) -> Result<()> {
        let adopt_sync = AdoptSync::new(
            self.store.clone(),
            self.driver.clone(),
            self.ports.clone(),
        );
        adopt_sync
            .run()
            .await
            .context("Adopt & Sync failed on startup")?;

        let reaper = self.reaper.clone();
        let reaper_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            reaper.start(reaper_shutdown).await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
        });

        let route_state = RouteState {
            store: self.store.clone(),
            provisioner: self.provisioner.clone(),
        };

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("orchestrator api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        Ok(())
    }
}

fn build_driver(config: &OrchestratorConfig) -> Result<Arc<dyn RuntimeDriver>> {
    let driver: Arc<dyn RuntimeDriver> = match &config.driver {
        DriverConfig::Docker { address } => {
            let driver = match address {
                Some(address) => DockerDriver::with_address(
                    address,
                    config.lambda_network.clone(),
                    config.advertise_ip.clone(),
                )?,
                None => DockerDriver::new(
                    config.lambda_network.clone(),
                    config.advertise_ip.clone(),
                )?,
            };
            Arc::new(driver)
        }
        DriverConfig::Memory => Arc::new(MemoryDriver::new()),
    };
    Ok(driver)
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
    shutdown_tx.send(()).unwrap();
    info!("signal received, shutting down server gracefully");
}
