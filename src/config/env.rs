//! Environment variable configuration handling

use crate::config::AppConfig;
use crate::error::ConfigError;
use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "PODNET_";

fn var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

/// Apply environment variable configuration over base configuration
pub fn apply_env_config(mut base_config: AppConfig) -> Result<AppConfig, ConfigError> {
    if let Some(backend) = var("BACKEND") {
        base_config.backend = backend.parse().map_err(ConfigError::InvalidFormat)?;
    }

    if let Some(dir) = var("NETWORK_CONFIG_DIR") {
        base_config.network_config_dir = Some(dir);
    }

    if let Some(dir) = var("RUN_DIR") {
        base_config.run_dir = dir;
    }

    if let Some(name) = var("DEFAULT_NETWORK") {
        base_config.default_network = name;
    }

    if let Some(subnet) = var("DEFAULT_SUBNET") {
        base_config.default_subnet = subnet;
    }

    // Format: PODNET_CNI_PLUGIN_DIRS="/usr/libexec/cni:/opt/cni/bin"
    if let Some(dirs) = var("CNI_PLUGIN_DIRS") {
        base_config.cni_plugin_dirs = parse_path_list(&dirs);
    }

    if let Some(binary) = var("NETAVARK_BINARY") {
        base_config.netavark_binary = binary;
    }

    if let Some(secs) = var("PLUGIN_TIMEOUT_SECS") {
        base_config.plugin_timeout_secs = secs.parse().map_err(|_| {
            ConfigError::InvalidFormat(format!("Invalid plugin timeout: '{}'", secs))
        })?;
    }

    if let Some(policy) = var("INTERNAL_DNS_CONFLICT") {
        base_config.internal_dns_conflict =
            Some(policy.parse().map_err(ConfigError::InvalidFormat)?);
    }

    if let Some(machine) = var("MACHINE") {
        base_config.machine = parse_bool(&machine)?;
    }

    if let Some(level) = var("LOG_LEVEL") {
        base_config.log_level = level;
    }

    Ok(base_config)
}

/// Split a colon separated path list, dropping empty entries.
pub fn parse_path_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFormat(format!(
            "Invalid boolean value: '{}'",
            value
        ))),
    }
}
