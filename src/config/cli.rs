//! Command-line argument parsing

use crate::config::AppConfig;
use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use std::collections::HashMap;

/// Command-line arguments structure
#[derive(Parser, Debug)]
#[command(name = "podnet")]
#[command(about = "Inspect container networks managed by the netavark or CNI backend")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to TOML configuration file")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, help = "Set the logging level")]
    pub log_level: Option<String>,

    /// Network backend (netavark, cni)
    #[arg(long, help = "Network backend to use")]
    pub backend: Option<String>,

    #[arg(long, help = "Directory holding the network definitions")]
    pub network_config_dir: Option<String>,

    #[arg(long, help = "Directory for runtime state such as IPAM leases")]
    pub run_dir: Option<String>,

    #[arg(long, help = "Name of the default network")]
    pub default_network: Option<String>,

    #[arg(long, help = "Subnet of the default network")]
    pub default_subnet: Option<String>,

    /// Colon separated, like `PATH`
    #[arg(long, help = "Directories searched for CNI plugins")]
    pub cni_plugin_dirs: Option<String>,

    #[arg(long, help = "Path to the netavark binary")]
    pub netavark_binary: Option<String>,

    #[arg(long, help = "Seconds to wait for a plugin or netavark to finish")]
    pub plugin_timeout_secs: Option<u64>,

    /// Internal network with DNS enabled: reject or disable
    #[arg(long, help = "Policy for internal networks with DNS enabled")]
    pub internal_dns_conflict: Option<String>,

    #[arg(long, help = "Running inside a podman machine")]
    pub machine: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    pub print_default_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List networks, optionally filtered
    List {
        /// key=value, may be repeated (name, id, driver, label, until)
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Show one network by name or ID
    Inspect { name: String },
}

impl CliArgs {
    /// Apply CLI arguments over base configuration
    pub fn apply_to_config(&self, mut base_config: AppConfig) -> Result<AppConfig, ConfigError> {
        if let Some(ref backend) = self.backend {
            base_config.backend = backend.parse().map_err(ConfigError::InvalidFormat)?;
        }

        if let Some(ref dir) = self.network_config_dir {
            base_config.network_config_dir = Some(dir.clone());
        }

        if let Some(ref dir) = self.run_dir {
            base_config.run_dir = dir.clone();
        }

        if let Some(ref name) = self.default_network {
            base_config.default_network = name.clone();
        }

        if let Some(ref subnet) = self.default_subnet {
            base_config.default_subnet = subnet.clone();
        }

        if let Some(ref dirs) = self.cni_plugin_dirs {
            base_config.cni_plugin_dirs = crate::config::env::parse_path_list(dirs);
        }

        if let Some(ref binary) = self.netavark_binary {
            base_config.netavark_binary = binary.clone();
        }

        if let Some(secs) = self.plugin_timeout_secs {
            base_config.plugin_timeout_secs = secs;
        }

        if let Some(ref policy) = self.internal_dns_conflict {
            base_config.internal_dns_conflict =
                Some(policy.parse().map_err(ConfigError::InvalidFormat)?);
        }

        // A flag can only switch machine mode on.
        if self.machine {
            base_config.machine = true;
        }

        if let Some(ref level) = self.log_level {
            base_config.log_level = level.clone();
        }

        Ok(base_config)
    }
}

/// Turn repeated `key=value` arguments into the filter map understood by
/// `generate_filters`.
pub fn parse_filter_args(args: &[String]) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let mut filters: HashMap<String, Vec<String>> = HashMap::new();
    for arg in args {
        let (key, value) = arg.split_once('=').ok_or_else(|| {
            ConfigError::InvalidFormat(format!("filter '{}' must be in key=value form", arg))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidFormat(format!(
                "filter '{}' has an empty key",
                arg
            )));
        }
        filters
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    Ok(filters)
}

/// Print default configuration in TOML format
pub fn print_default_config() {
    let default_config = AppConfig::default();

    println!("# podnet configuration");
    println!("# This is the default configuration with all available options");
    println!();
    println!("# Network backend: netavark or cni");
    println!("backend = \"{}\"", default_config.backend);
    println!();
    println!("# Directory holding the network definitions");
    println!(
        "network_config_dir = \"{}\"",
        default_config.network_config_dir()
    );
    println!();
    println!("# Directory for runtime state such as IPAM leases");
    println!("run_dir = \"{}\"", default_config.run_dir);
    println!();
    println!("# Default network, always present");
    println!("default_network = \"{}\"", default_config.default_network);
    println!("default_subnet = \"{}\"", default_config.default_subnet);
    println!();
    println!("# Internal networks with DNS enabled: reject or disable");
    println!("# Unset uses the backend default (netavark: reject, cni: disable)");
    println!("# internal_dns_conflict = \"reject\"");
    println!();
    println!("# Add the podman-machine plugin to CNI network configs");
    println!("machine = {}", default_config.machine);
    println!();
    println!("[logging]");
    println!("# Log level: trace, debug, info, warn, error");
    println!("level = \"{}\"", default_config.log_level);
    println!();
    println!("[cni]");
    println!("plugin_dirs = [");
    for dir in &default_config.cni_plugin_dirs {
        println!("    \"{}\",", dir);
    }
    println!("]");
    println!("plugin_timeout_secs = {}", default_config.plugin_timeout_secs);
    println!();
    println!("[netavark]");
    println!("binary = \"{}\"", default_config.netavark_binary);
    println!("timeout_secs = {}", default_config.plugin_timeout_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BackendKind, InternalDnsPolicy};
    use clap::Parser;

    #[test]
    fn test_cli_args_parsing() {
        let args = CliArgs::try_parse_from([
            "podnet",
            "--config",
            "/etc/podnet.toml",
            "--log-level",
            "debug",
            "--backend",
            "cni",
            "--network-config-dir",
            "/srv/net.d",
            "--cni-plugin-dirs",
            "/opt/cni/bin:/usr/lib/cni",
            "--plugin-timeout-secs",
            "10",
            "--internal-dns-conflict",
            "reject",
            "--machine",
            "list",
            "--filter",
            "driver=bridge",
            "--filter",
            "label=env=prod",
        ])
        .unwrap();

        assert_eq!(args.config, Some("/etc/podnet.toml".to_string()));
        assert_eq!(args.log_level, Some("debug".to_string()));
        assert_eq!(args.backend, Some("cni".to_string()));
        assert!(args.machine);
        assert!(!args.validate_config);
        assert_eq!(
            args.command,
            Some(Command::List {
                filters: vec!["driver=bridge".to_string(), "label=env=prod".to_string()]
            })
        );
    }

    #[test]
    fn test_cli_args_minimal() {
        let args = CliArgs::try_parse_from(["podnet"]).unwrap();

        assert_eq!(args.config, None);
        assert_eq!(args.backend, None);
        assert_eq!(args.command, None);
        assert!(!args.machine);
        assert!(!args.print_default_config);
    }

    #[test]
    fn test_inspect_subcommand() {
        let args = CliArgs::try_parse_from(["podnet", "inspect", "podman"]).unwrap();
        assert_eq!(
            args.command,
            Some(Command::Inspect {
                name: "podman".to_string()
            })
        );
        assert!(CliArgs::try_parse_from(["podnet", "inspect"]).is_err());
    }

    #[test]
    fn test_apply_cli_to_config() {
        let args = CliArgs::try_parse_from([
            "podnet",
            "--backend",
            "cni",
            "--run-dir",
            "/tmp/run",
            "--default-network",
            "bridge0",
            "--default-subnet",
            "10.1.0.0/24",
            "--cni-plugin-dirs",
            "/opt/cni/bin",
            "--netavark-binary",
            "/bin/netavark",
            "--plugin-timeout-secs",
            "5",
            "--internal-dns-conflict",
            "disable",
            "--log-level",
            "trace",
        ])
        .unwrap();

        let config = args.apply_to_config(AppConfig::default()).unwrap();
        assert_eq!(config.backend, BackendKind::Cni);
        assert_eq!(config.run_dir, "/tmp/run");
        assert_eq!(config.default_network, "bridge0");
        assert_eq!(config.default_subnet, "10.1.0.0/24");
        assert_eq!(config.cni_plugin_dirs, vec!["/opt/cni/bin".to_string()]);
        assert_eq!(config.netavark_binary, "/bin/netavark");
        assert_eq!(config.plugin_timeout_secs, 5);
        assert_eq!(config.internal_dns_conflict, Some(InternalDnsPolicy::Disable));
        assert_eq!(config.log_level, "trace");
        assert!(!config.machine);
    }

    #[test]
    fn test_apply_cli_to_config_no_overrides() {
        let args = CliArgs::try_parse_from(["podnet"]).unwrap();
        let base_config = AppConfig {
            machine: true,
            ..Default::default()
        };
        let config = args.apply_to_config(base_config.clone()).unwrap();
        assert_eq!(config, base_config);
    }

    #[test]
    fn test_apply_cli_rejects_unknown_backend() {
        let args = CliArgs::try_parse_from(["podnet", "--backend", "slirp"]).unwrap();
        assert!(matches!(
            args.apply_to_config(AppConfig::default()),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_filter_args() {
        let filters = parse_filter_args(&[
            "name=web".to_string(),
            "name=db".to_string(),
            "label=env=prod".to_string(),
        ])
        .unwrap();
        assert_eq!(filters["name"], vec!["web".to_string(), "db".to_string()]);
        assert_eq!(filters["label"], vec!["env=prod".to_string()]);

        assert!(parse_filter_args(&["driver".to_string()]).is_err());
        assert!(parse_filter_args(&["=x".to_string()]).is_err());
    }
}
