use std::sync::Arc;

use anyhow::Result;
use data_model::{FunctionDescriptor, FunctionRegistry};
use runtime_driver::MemoryDriver;
use tracing::subscriber;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::{adopt_sync::AdoptSync, config::OrchestratorConfig, service::Service};

pub struct TestService {
    pub service: Service,
    pub driver: Arc<MemoryDriver>,
}

impl TestService {
    pub fn new(descriptors: Vec<FunctionDescriptor>) -> Result<Self> {
        Self::with_config(descriptors, test_config())
    }

    pub fn with_config(
        descriptors: Vec<FunctionDescriptor>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let driver = Arc::new(MemoryDriver::new());
        let registry = Arc::new(FunctionRegistry::new(descriptors));
        let service = Service::with_parts(config, driver.clone(), registry)?;

        Ok(Self { service, driver })
    }

    /// Run the startup reconciliation against the memory driver.
    pub async fn adopt_sync(&self) -> Result<()> {
        AdoptSync::new(
            self.service.store.clone(),
            self.service.driver.clone(),
            self.service.ports.clone(),
        )
        .run()
        .await
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        driver: crate::config::DriverConfig::Memory,
        probe_readiness: false,
        cold_start_timeout: 2,
        ..Default::default()
    }
}
