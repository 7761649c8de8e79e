//! TOML configuration file parsing

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::network::{BackendKind, InternalDnsPolicy};
use serde::Deserialize;

/// TOML configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    pub backend: Option<BackendKind>,
    pub network_config_dir: Option<String>,
    pub run_dir: Option<String>,
    pub default_network: Option<String>,
    pub default_subnet: Option<String>,
    pub internal_dns_conflict: Option<InternalDnsPolicy>,
    pub machine: Option<bool>,
    pub logging: Option<LoggingConfig>,
    pub cni: Option<CniConfig>,
    pub netavark: Option<NetavarkConfig>,
}

/// Logging configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

/// `[cni]` table
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CniConfig {
    pub plugin_dirs: Option<Vec<String>>,
    pub plugin_timeout_secs: Option<u64>,
}

/// `[netavark]` table
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetavarkConfig {
    pub binary: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl TomlConfig {
    /// Apply the values present in the file over `base_config`.
    pub fn apply_to_config(self, mut base_config: AppConfig) -> Result<AppConfig, ConfigError> {
        if let Some(backend) = self.backend {
            base_config.backend = backend;
        }
        if let Some(dir) = self.network_config_dir {
            base_config.network_config_dir = Some(dir);
        }
        if let Some(dir) = self.run_dir {
            base_config.run_dir = dir;
        }
        if let Some(name) = self.default_network {
            base_config.default_network = name;
        }
        if let Some(subnet) = self.default_subnet {
            base_config.default_subnet = subnet;
        }
        if let Some(policy) = self.internal_dns_conflict {
            base_config.internal_dns_conflict = Some(policy);
        }
        if let Some(machine) = self.machine {
            base_config.machine = machine;
        }
        if let Some(level) = self.logging.and_then(|l| l.level) {
            base_config.log_level = level;
        }

        // Both tables may set the timeout; the one for the active backend wins.
        let cni = self.cni.unwrap_or_default();
        let netavark = self.netavark.unwrap_or_default();
        if let Some(dirs) = cni.plugin_dirs {
            base_config.cni_plugin_dirs = dirs;
        }
        if let Some(binary) = netavark.binary {
            base_config.netavark_binary = binary;
        }
        let timeout = match base_config.backend {
            BackendKind::Cni => cni.plugin_timeout_secs.or(netavark.timeout_secs),
            BackendKind::Netavark => netavark.timeout_secs.or(cni.plugin_timeout_secs),
        };
        if let Some(secs) = timeout {
            base_config.plugin_timeout_secs = secs;
        }

        Ok(base_config)
    }
}

/// Load configuration from TOML file
pub fn load_toml_config(path: &str) -> Result<TomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_string(),
    })?;

    parse_toml_config(&content)
}

pub fn parse_toml_config(content: &str) -> Result<TomlConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::InvalidFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
backend = "cni"
network_config_dir = "/srv/cni"
default_subnet = "10.77.0.0/16"
internal_dns_conflict = "reject"
machine = true

[logging]
level = "debug"

[cni]
plugin_dirs = ["/opt/cni/bin"]
plugin_timeout_secs = 30

[netavark]
binary = "/usr/bin/netavark"
timeout_secs = 60
"#;

    #[test]
    fn test_parse_and_apply() {
        let file = parse_toml_config(SAMPLE).unwrap();
        let config = file.apply_to_config(AppConfig::default()).unwrap();

        assert_eq!(config.backend, BackendKind::Cni);
        assert_eq!(config.network_config_dir(), "/srv/cni");
        assert_eq!(config.default_subnet, "10.77.0.0/16");
        assert_eq!(config.internal_dns_conflict, Some(InternalDnsPolicy::Reject));
        assert!(config.machine);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.cni_plugin_dirs, vec!["/opt/cni/bin".to_string()]);
        assert_eq!(config.netavark_binary, "/usr/bin/netavark");
        assert_eq!(config.plugin_timeout_secs, 30);
        // untouched keys keep their defaults
        assert_eq!(config.default_network, "podman");
    }

    #[test]
    fn test_empty_file_changes_nothing() {
        let file = parse_toml_config("").unwrap();
        let config = file.apply_to_config(AppConfig::default()).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            parse_toml_config("backend = \"docker\""),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(parse_toml_config("unknown_key = 1").is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = load_toml_config("/nonexistent/podnet.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }
}
