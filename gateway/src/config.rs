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
    "container_cache_ttl",
    "pool_acquire_timeout",
    "circuit_breaker_threshold",
    "circuit_breaker_recovery_timeout",
    "heartbeat_interval",
    "lambda_invoke_timeout",
    "enable_container_pooling",
    "orchestrator_url",
    "x_api_key",
    "jwt_secret_key",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// TLS cert/key pair; both set enables HTTPS termination.
    pub ssl_cert_path: Option<String>,
    pub ssl_key_path: Option<String>,
    pub functions_config_path: String,
    pub orchestrator_url: String,
    /// Seconds before an orchestrator RPC is abandoned.
    pub orchestrator_timeout: f64,
    /// Host-cache TTL in seconds.
    pub container_cache_ttl: f64,
    pub container_cache_size: usize,
    /// Seconds an acquire waits for a pool permit.
    pub pool_acquire_timeout: f64,
    /// Consecutive failures before a function's breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Seconds an open breaker waits before allowing a probe.
    pub circuit_breaker_recovery_timeout: f64,
    /// Seconds between heartbeat reports to the orchestrator.
    pub heartbeat_interval: u64,
    /// Default per-invocation ceiling in seconds; functions may override.
    pub lambda_invoke_timeout: u64,
    /// When false every pool is clamped to a single permit.
    pub enable_container_pooling: bool,
    // Auth.
    pub auth_endpoint_path: String,
    pub x_api_key: String,
    pub auth_user: String,
    pub auth_pass: String,
    pub jwt_secret_key: String,
    /// Token lifetime in seconds.
    pub jwt_expires_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            ssl_cert_path: None,
            ssl_key_path: None,
            functions_config_path: "config/functions.yml".to_string(),
            orchestrator_url: "http://orchestrator:8081".to_string(),
            orchestrator_timeout: 30.0,
            container_cache_ttl: 30.0,
            container_cache_size: 100,
            pool_acquire_timeout: 5.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_timeout: 30.0,
            heartbeat_interval: 30,
            lambda_invoke_timeout: 300,
            enable_container_pooling: false,
            auth_endpoint_path: "/user/auth/ver1.0".to_string(),
            x_api_key: "dummy-api-key-for-local-dev".to_string(),
            auth_user: "admin".to_string(),
            auth_pass: "password".to_string(),
            jwt_secret_key: "dummy-secret-key-for-local-dev".to_string(),
            jwt_expires_secs: 3000,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: GatewayConfig = figment.merge(Env::raw().only(ENV_KEYS)).extract()?;
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
        if self.ssl_cert_path.is_some() != self.ssl_key_path.is_some() {
            return Err(anyhow::anyhow!(
                "ssl_cert_path and ssl_key_path must be set together"
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.container_cache_ttl)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pool_acquire_timeout)
    }

    pub fn breaker_recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.circuit_breaker_recovery_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn orchestrator_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.orchestrator_timeout)
    }

    /// Per-invocation deadline, honoring the function's override.
    pub fn invoke_timeout(&self, descriptor: Option<&FunctionDescriptor>) -> Duration {
        descriptor
            .and_then(|d| d.invoke_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.lambda_invoke_timeout))
    }
}

/// Load the declared functions from the shared functions config file.
pub fn load_functions(path: &str) -> Result<Vec<FunctionDescriptor>> {
    let file: FunctionsFile = Figment::from(Serialized::defaults(FunctionsFile::default()))
        .merge(Yaml::file(path))
        .extract()?;
    Ok(file.functions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.pool_acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert!(!config.enable_container_pooling);
        config.validate().unwrap();
    }

    #[test]
    fn test_tls_paths_must_pair() {
        let config = GatewayConfig {
            ssl_cert_path: Some("/tmp/server.crt".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invoke_timeout_override() {
        let config = GatewayConfig::default();
        let mut descriptor = FunctionDescriptor::new("hello", "hello:latest");
        assert_eq!(
            config.invoke_timeout(Some(&descriptor)),
            Duration::from_secs(300)
        );
        descriptor.invoke_timeout_ms = Some(1500);
        assert_eq!(
            config.invoke_timeout(Some(&descriptor)),
            Duration::from_millis(1500)
        );
    }
}
