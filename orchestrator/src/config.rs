use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use data_model::{FunctionDescriptor, FunctionsFile};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Environment variables recognised on top of the YAML config.
const ENV_KEYS: &[&str] = &[
    "idle_timeout_minutes",
    "reaper_interval",
    "cold_start_timeout",
    "lambda_network",
    "lambda_port",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriverConfig {
    Docker {
        /// Docker daemon address (`unix://...` or `tcp://...`). Defaults to
        /// the local socket.
        #[serde(default)]
        address: Option<String>,
    },
    /// In-memory runtime, for development and tests.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub listen_addr: String,
    pub functions_config_path: String,
    pub driver: DriverConfig,
    /// Runtime network workers attach to.
    pub lambda_network: Option<String>,
    /// Port workers listen on inside the container.
    pub lambda_port: u16,
    /// Address the gateway uses to reach published ports.
    pub advertise_ip: String,
    /// Publish worker ports on the host instead of relying on a shared
    /// container network.
    pub publish_ports: bool,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub idle_timeout_minutes: u64,
    /// Seconds between reaper sweeps.
    pub reaper_interval: u64,
    /// Ceiling on create + start + readiness, in seconds.
    pub cold_start_timeout: u64,
    /// Probe worker readiness after start. Disabled in tests where no real
    /// worker is listening.
    pub probe_readiness: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_string(),
            functions_config_path: "config/functions.yml".to_string(),
            driver: DriverConfig::Docker { address: None },
            lambda_network: Some("lambda-net".to_string()),
            lambda_port: 8080,
            advertise_ip: "127.0.0.1".to_string(),
            publish_ports: false,
            port_range_start: 31000,
            port_range_end: 32000,
            idle_timeout_minutes: 5,
            reaper_interval: 60,
            cold_start_timeout: 30,
            probe_readiness: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(OrchestratorConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: OrchestratorConfig =
            figment.merge(Env::raw().only(ENV_KEYS)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(anyhow::anyhow!(
                "invalid port range: {}..{}",
                self.port_range_start,
                self.port_range_end
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval)
    }

    pub fn cold_start_timeout(&self) -> Duration {
        Duration::from_secs(self.cold_start_timeout)
    }
}

/// Load the declared functions from the shared functions config file.
pub fn load_functions(path: &str) -> Result<Vec<FunctionDescriptor>> {
    let file: FunctionsFile = Figment::from(Serialized::defaults(FunctionsFile::default()))
        .merge(Yaml::file(path))
        .extract()?;
    Ok(file.functions)
}
