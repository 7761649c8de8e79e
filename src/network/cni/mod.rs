//! CNI backend
//!
//! Networks are `.conflist` files loaded once per instance; call
//! [`CniNetwork::reload`] to pick up changes made by other processes. Each
//! network is connected by running its plugin chain.

pub mod config;
pub mod exec;
pub mod result;

use crate::error::{NetworkError, Result};
use crate::network::create::{prepare_network, CreateContext, InternalDnsPolicy};
use crate::network::filters::NetworkFilter;
use crate::network::host::{HostInterfaces, SystemInterfaces};
use crate::network::lock::NetworkLock;
use crate::network::types::{Network, NetworkOptions, PerNetworkOptions, PortMapping, StatusBlock};
use crate::network::validation::validate_setup_options;
use crate::network::{find_network, list_networks, ContainerNetwork};
use config::{LoadedNetwork, NetworkConfigList};
use exec::{CniExec, ProcessCni, RuntimeConf};
use ipnetwork::IpNetwork;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bridge names handed out to new networks: cni-podman1, cni-podman2, ...
pub const DEVICE_PREFIX: &str = "cni-podman";

const LOCK_FILE: &str = "cni.lock";

/// Settings for [`CniNetwork::new`].
#[derive(Debug, Clone)]
pub struct CniOptions {
    pub config_dir: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
    pub default_network: String,
    pub default_subnet: IpNetwork,
    pub dns_policy: InternalDnsPolicy,
    /// Append the podman-machine plugin to new networks.
    pub is_machine: bool,
    pub timeout: Duration,
}

#[derive(Default)]
struct State {
    networks: HashMap<String, LoadedNetwork>,
    loaded: bool,
    /// Creation time given to the synthesized default network.
    default_created: Option<chrono::DateTime<chrono::Utc>>,
}

impl State {
    fn definitions(&self) -> HashMap<String, Network> {
        self.networks
            .iter()
            .map(|(name, loaded)| (name.clone(), loaded.network.clone()))
            .collect()
    }
}

pub struct CniNetwork {
    config_dir: PathBuf,
    default_network: String,
    default_subnet: IpNetwork,
    dns_policy: InternalDnsPolicy,
    is_machine: bool,
    lock: NetworkLock,
    host: Arc<dyn HostInterfaces>,
    exec: Arc<dyn CniExec>,
    state: Mutex<State>,
}

impl CniNetwork {
    pub fn new(options: CniOptions) -> Self {
        Self {
            lock: NetworkLock::new(options.config_dir.join(LOCK_FILE)),
            exec: Arc::new(ProcessCni::new(options.plugin_dirs, options.timeout)),
            config_dir: options.config_dir,
            default_network: options.default_network,
            default_subnet: options.default_subnet,
            dns_policy: options.dns_policy,
            is_machine: options.is_machine,
            host: Arc::new(SystemInterfaces::new()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_host(mut self, host: Arc<dyn HostInterfaces>) -> Self {
        self.host = host;
        self
    }

    pub fn with_executor(mut self, exec: Arc<dyn CniExec>) -> Self {
        self.exec = exec;
        self
    }

    /// Drop the cached networks; the next call reads the directory again.
    pub async fn reload(&self) {
        self.state.lock().await.loaded = false;
    }

    fn load(&self, state: &mut State) -> Result<()> {
        if state.loaded {
            return Ok(());
        }

        let mut networks = config::load_networks(&self.config_dir)?;
        if !networks.contains_key(&self.default_network) {
            let mut network = config::default_network(&self.default_network, self.default_subnet);
            network.created = Some(*state.default_created.get_or_insert(chrono::Utc::now()));
            let list = config::to_conflist(&network, self.is_machine)?;
            networks.insert(
                self.default_network.clone(),
                LoadedNetwork {
                    network,
                    config: list,
                    path: None,
                },
            );
        }
        debug!(count = networks.len(), dir = %self.config_dir.display(), "loaded CNI networks");

        state.networks = networks;
        state.loaded = true;
        Ok(())
    }

    async fn teardown_network(
        &self,
        config: &NetworkConfigList,
        namespace_path: &str,
        options: &NetworkOptions,
        network: &Network,
        opts: &PerNetworkOptions,
    ) -> Result<()> {
        let rt = runtime_conf(namespace_path, options, network, opts);
        self.exec
            .del_network_list(config, &rt)
            .await
            .map_err(|e| e.context(format!("teardown network {}", network.name)))
    }
}

impl ContainerNetwork for CniNetwork {
    async fn network_create(&self, network: Network) -> Result<Network> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;

        let definitions = state.definitions();
        let ctx = CreateContext {
            networks: &definitions,
            host: self.host.as_ref(),
            device_prefix: DEVICE_PREFIX,
            dns_policy: self.dns_policy,
        };
        let mut network = prepare_network(network, &ctx)?;
        network.id = config::network_id(&network.name);

        let list = config::to_conflist(&network, self.is_machine)?;
        let path = config::write_config(&self.config_dir, &list)?;
        network.created = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(chrono::DateTime::<chrono::Utc>::from);
        info!(network = %network.name, path = %path.display(), "created network");

        state.networks.insert(
            network.name.clone(),
            LoadedNetwork {
                network: network.clone(),
                config: list,
                path: Some(path),
            },
        );
        Ok(network)
    }

    async fn network_remove(&self, name_or_id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;

        let definitions = state.definitions();
        let network = find_network(&definitions, name_or_id)?;
        let name = network.name.clone();
        if name == self.default_network {
            return Err(NetworkError::DefaultNetworkRemoval(name));
        }

        if network.is_bridge() && !network.network_interface.is_empty() {
            if let Err(e) = self.host.remove_link(&network.network_interface).await {
                debug!(link = %network.network_interface, error = %e, "bridge not removed");
            }
        }

        if let Some(path) = state.networks.get(&name).and_then(|l| l.path.clone()) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        state.networks.remove(&name);
        info!(network = %name, "removed network");
        Ok(name)
    }

    async fn network_list(&self, filters: &[NetworkFilter]) -> Result<Vec<Network>> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;
        Ok(list_networks(&state.definitions(), filters))
    }

    async fn network_inspect(&self, name_or_id: &str) -> Result<Network> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;
        find_network(&state.definitions(), name_or_id).cloned()
    }

    async fn setup(
        &self,
        namespace_path: &str,
        options: &NetworkOptions,
    ) -> Result<HashMap<String, StatusBlock>> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;

        let selected = validate_setup_options(namespace_path, options, &state.definitions())?;

        let mut results = HashMap::with_capacity(selected.len());
        let mut connected: Vec<&str> = Vec::new();
        let mut failure = None;

        for (name, opts) in &options.networks {
            let network = &selected[name];
            let config = &state.networks[name].config;
            let rt = runtime_conf(namespace_path, options, network, opts);
            debug!(container = %options.container_id, network = %name, "CNI add");

            // A failed chain may be partly applied, so it is torn down too.
            connected.push(name);
            match self.exec.add_network_list(config, &rt).await {
                Ok(result) => {
                    match result::to_status_block(&result, &opts.interface_name) {
                        Ok(block) => {
                            results.insert(name.clone(), block);
                        }
                        Err(e) => {
                            failure = Some(e.context(format!("setup network {}", name)));
                            break;
                        }
                    }
                }
                Err(e) => {
                    failure = Some(e.context(format!("setup network {}", name)));
                    break;
                }
            }
        }

        let Some(err) = failure else {
            return Ok(results);
        };

        // Disconnect everything this call touched.
        for name in connected {
            let network = &selected[name];
            let config = &state.networks[name].config;
            if let Err(e) = self
                .teardown_network(config, namespace_path, options, network, &options.networks[name])
                .await
            {
                warn!(container = %options.container_id, network = %name, error = %e, "cleanup after failed setup");
            }
        }
        Err(err)
    }

    async fn teardown(&self, namespace_path: &str, options: &NetworkOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.load(&mut state)?;

        if namespace_path.is_empty() {
            return Err(NetworkError::InvalidArgument(
                "namespace path is empty".to_string(),
            ));
        }

        let mut errors = Vec::new();
        for (name, opts) in &options.networks {
            let Some(loaded) = state.networks.get(name) else {
                errors.push(NetworkError::NoSuchNetwork(name.clone()));
                continue;
            };
            debug!(container = %options.container_id, network = %name, "CNI del");
            if let Err(e) = self
                .teardown_network(&loaded.config, namespace_path, options, &loaded.network, opts)
                .await
            {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NetworkError::Multiple(errors)),
        }
    }

    fn default_network(&self) -> &str {
        &self.default_network
    }
}

/// CNI_ARGS and capability arguments for one container on one network.
fn runtime_conf(
    namespace_path: &str,
    options: &NetworkOptions,
    network: &Network,
    opts: &PerNetworkOptions,
) -> RuntimeConf {
    let args = vec![
        ("IgnoreUnknown".to_string(), "1".to_string()),
        ("K8S_POD_NAMESPACE".to_string(), options.container_name.clone()),
        ("K8S_POD_INFRA_CONTAINER_ID".to_string(), options.container_id.clone()),
        ("K8S_POD_NAME".to_string(), options.container_name.clone()),
    ];

    let mut capability_args = Map::new();
    let ports = port_mappings(&options.port_mappings);
    if !ports.is_empty() {
        capability_args.insert("portMappings".to_string(), Value::Array(ports));
    }

    let ips: Vec<Value> = opts
        .static_ips
        .iter()
        .filter_map(|ip| {
            let subnet = network.subnets.iter().find(|s| s.subnet.contains(*ip))?;
            Some(Value::String(format!("{}/{}", ip, subnet.subnet.prefix())))
        })
        .collect();
    if !ips.is_empty() {
        capability_args.insert("ips".to_string(), Value::Array(ips));
    }

    if let Some(mac) = &opts.static_mac {
        capability_args.insert("mac".to_string(), Value::String(mac.clone()));
    }
    if !opts.aliases.is_empty() {
        let mut aliases = Map::new();
        aliases.insert(network.name.clone(), json!(opts.aliases));
        capability_args.insert("aliases".to_string(), Value::Object(aliases));
    }

    RuntimeConf {
        container_id: options.container_id.clone(),
        netns: namespace_path.to_string(),
        if_name: opts.interface_name.clone(),
        args,
        capability_args,
    }
}

/// One portmap entry per port and protocol.
fn port_mappings(mappings: &[PortMapping]) -> Vec<Value> {
    let mut out = Vec::new();
    for mapping in mappings {
        let range = mapping.range.max(1);
        for protocol in mapping.protocol.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            for i in 0..range {
                out.push(json!({
                    "hostPort": u32::from(mapping.host_port) + u32::from(i),
                    "containerPort": u32::from(mapping.container_port) + u32::from(i),
                    "protocol": protocol,
                    "hostIP": mapping.host_ip,
                }));
            }
        }
    }
    out
}
