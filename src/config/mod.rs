//! Configuration management module
//!
//! Handles loading configuration from multiple sources with proper precedence:
//! CLI arguments > environment variables > TOML files > defaults

use crate::error::ConfigError;
use crate::network::{BackendKind, InternalDnsPolicy, DEFAULT_NETWORK_NAME, DEFAULT_SUBNET};
use ipnetwork::IpNetwork;

pub mod cli;
pub mod env;
pub mod toml;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendKind,
    /// Network definitions; the backend's standard directory when unset.
    pub network_config_dir: Option<String>,
    /// Runtime state such as IPAM leases.
    pub run_dir: String,
    pub default_network: String,
    pub default_subnet: String,
    pub cni_plugin_dirs: Vec<String>,
    pub netavark_binary: String,
    pub plugin_timeout_secs: u64,
    /// Unset means the backend default.
    pub internal_dns_conflict: Option<InternalDnsPolicy>,
    /// Running inside a podman machine VM.
    pub machine: bool,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Netavark,
            network_config_dir: None,
            run_dir: "/run/containers/networks".to_string(),
            default_network: DEFAULT_NETWORK_NAME.to_string(),
            default_subnet: DEFAULT_SUBNET.to_string(),
            cni_plugin_dirs: vec![
                "/usr/local/libexec/cni".to_string(),
                "/usr/libexec/cni".to_string(),
                "/usr/local/lib/cni".to_string(),
                "/usr/lib/cni".to_string(),
                "/opt/cni/bin".to_string(),
            ],
            netavark_binary: "/usr/libexec/podman/netavark".to_string(),
            plugin_timeout_secs: 300,
            internal_dns_conflict: None,
            machine: false,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Configured directory or the backend's standard one.
    pub fn network_config_dir(&self) -> &str {
        self.network_config_dir
            .as_deref()
            .unwrap_or_else(|| self.backend.default_config_dir())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_subnet.parse::<IpNetwork>().map_err(|e| {
            ConfigError::ValidationError(format!(
                "default_subnet '{}' is not a valid CIDR: {}",
                self.default_subnet, e
            ))
        })?;

        if !crate::network::validation::is_valid_name(&self.default_network) {
            return Err(ConfigError::ValidationError(format!(
                "default_network '{}' is not a valid network name",
                self.default_network
            )));
        }

        if self.plugin_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "plugin_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.backend == BackendKind::Cni && self.cni_plugin_dirs.is_empty() {
            return Err(ConfigError::ValidationError(
                "cni_plugin_dirs must not be empty for the cni backend".to_string(),
            ));
        }

        if !["trace", "debug", "info", "warn", "warning", "error", "off"]
            .contains(&self.log_level.to_lowercase().as_str())
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Log level as understood by `EnvFilter`.
    pub fn log_filter(&self) -> String {
        match self.log_level.to_lowercase().as_str() {
            "warning" => "warn".to_string(),
            other => other.to_string(),
        }
    }
}

/// Build the effective configuration: defaults, then the TOML file, then
/// environment variables, then command-line flags.
pub fn load_configuration(cli: &cli::CliArgs) -> Result<AppConfig, ConfigError> {
    let mut config = AppConfig::default();

    if let Some(path) = &cli.config {
        let file = toml::load_toml_config(path)?;
        config = file.apply_to_config(config)?;
    }

    config = env::apply_env_config(config)?;
    config = cli.apply_to_config(config)?;
    config.validate()?;
    Ok(config)
}
