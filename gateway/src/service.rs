use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use data_model::FunctionRegistry;
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    circuit_breaker::BreakerMap,
    config::{GatewayConfig, load_functions},
    heartbeat::HeartbeatJanitor,
    host_cache::ContainerHostCache,
    orchestrator_client::{HttpOrchestratorClient, OrchestratorBackend},
    pool::PoolManager,
    pool_orchestrator::PoolOrchestrator,
    route_matcher::RouteMatcher,
    routes::{RouteState, create_routes},
};

#[derive(Clone)]
pub struct Service {
    pub config: Arc<GatewayConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub registry: Arc<FunctionRegistry>,
    pub matcher: Arc<RouteMatcher>,
    pub cache: Arc<ContainerHostCache>,
    pub pools: Arc<PoolManager>,
    pub breakers: Arc<BreakerMap>,
    pub pool_orchestrator: Arc<PoolOrchestrator>,
    pub heartbeat: Arc<HeartbeatJanitor>,
}

impl Service {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let registry = Arc::new(FunctionRegistry::new(
            load_functions(&config.functions_config_path)
                .context("error loading functions config")?,
        ));
        let backend: Arc<dyn OrchestratorBackend> =
            Arc::new(HttpOrchestratorClient::new(&config));
        Self::with_backend(config, registry, backend)
    }

    /// Wire the service from pre-built parts; tests inject an in-process
    /// orchestrator backend here.
    pub fn with_backend(
        config: GatewayConfig,
        registry: Arc<FunctionRegistry>,
        backend: Arc<dyn OrchestratorBackend>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let matcher = Arc::new(RouteMatcher::new(&registry));
        let cache = Arc::new(ContainerHostCache::new(
            config.cache_ttl(),
            config.container_cache_size,
        ));
        let pools = Arc::new(PoolManager::new(
            registry.clone(),
            config.enable_container_pooling,
        ));
        let breakers = Arc::new(BreakerMap::new(
            config.circuit_breaker_threshold,
            config.breaker_recovery_timeout(),
        ));
        let pool_orchestrator = Arc::new(PoolOrchestrator::new(
            pools.clone(),
            breakers.clone(),
            cache.clone(),
            backend.clone(),
            registry.clone(),
            config.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatJanitor::new(
            pools.clone(),
            cache.clone(),
            backend,
            config.heartbeat_interval(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            registry,
            matcher,
            cache,
            pools,
            breakers,
            pool_orchestrator,
            heartbeat,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let heartbeat = self.heartbeat.clone();
        let heartbeat_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            heartbeat.start(heartbeat_shutdown).await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
        });

        let route_state = RouteState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            matcher: self.matcher.clone(),
            pool_orchestrator: self.pool_orchestrator.clone(),
            pools: self.pools.clone(),
        };
        let routes = create_routes(route_state);

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        match (&self.config.ssl_cert_path, &self.config.ssl_key_path) {
            (Some(cert), Some(key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .context("error loading TLS cert/key")?;
                info!("gateway listening on {} (TLS)", self.config.listen_addr);
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(routes.into_make_service())
                    .await?;
            }
            _ => {
                info!("gateway listening on {}", self.config.listen_addr);
                axum_server::bind(addr)
                    .handle(handle)
                    .serve(routes.into_make_service())
                    .await?;
            }
        }
        Ok(())
    }
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
