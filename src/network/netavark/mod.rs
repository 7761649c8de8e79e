//! netavark backend
//!
//! Networks are stored one per `<name>.json` file. The in-memory copy is
//! refreshed whenever the config directory's mtime changes, so edits from
//! other processes are picked up on the next call.

pub mod config;
pub mod exec;
pub mod ipam;

use crate::error::{NetworkError, Result};
use crate::network::create::{prepare_network, CreateContext, InternalDnsPolicy};
use crate::network::filters::NetworkFilter;
use crate::network::host::{HostInterfaces, SystemInterfaces};
use crate::network::lock::NetworkLock;
use crate::network::types::{Network, NetworkOptions, StatusBlock};
use crate::network::validation::validate_setup_options;
use crate::network::{find_network, list_networks, ContainerNetwork};
use exec::{NetavarkExec, NetavarkRequest, ProcessNetavark};
use ipam::Ipam;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bridge names handed out to new networks: podman1, podman2, ...
pub const DEVICE_PREFIX: &str = "podman";

const LOCK_FILE: &str = "netavark.lock";
const IPAM_FILE: &str = "ipam.json";

/// Settings for [`NetavarkNetwork::new`].
#[derive(Debug, Clone)]
pub struct NetavarkOptions {
    pub config_dir: PathBuf,
    pub run_dir: PathBuf,
    pub binary: PathBuf,
    pub default_network: String,
    pub default_subnet: IpNetwork,
    pub dns_policy: InternalDnsPolicy,
    pub timeout: Duration,
}

#[derive(Default)]
struct State {
    networks: HashMap<String, Network>,
    /// Directory mtime at the last load, None forces a reload.
    loaded_mtime: Option<SystemTime>,
    loaded: bool,
    /// Creation time given to the synthesized default network.
    default_created: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct NetavarkNetwork {
    config_dir: PathBuf,
    default_network: String,
    default_subnet: IpNetwork,
    dns_policy: InternalDnsPolicy,
    lock: NetworkLock,
    ipam: Ipam,
    host: Arc<dyn HostInterfaces>,
    exec: Arc<dyn NetavarkExec>,
    state: Mutex<State>,
}

impl NetavarkNetwork {
    pub fn new(options: NetavarkOptions) -> Self {
        let exec = ProcessNetavark::new(
            options.binary.clone(),
            options.run_dir.clone(),
            options.timeout,
        );
        Self {
            lock: NetworkLock::new(options.config_dir.join(LOCK_FILE)),
            ipam: Ipam::new(options.run_dir.join(IPAM_FILE)),
            config_dir: options.config_dir,
            default_network: options.default_network,
            default_subnet: options.default_subnet,
            dns_policy: options.dns_policy,
            host: Arc::new(SystemInterfaces::new()),
            exec: Arc::new(exec),
            state: Mutex::new(State::default()),
        }
    }

    /// Replace the host interface source.
    pub fn with_host(mut self, host: Arc<dyn HostInterfaces>) -> Self {
        self.host = host;
        self
    }

    /// Replace the netavark executor.
    pub fn with_executor(mut self, exec: Arc<dyn NetavarkExec>) -> Self {
        self.exec = exec;
        self
    }

    /// Reload from disk when the directory changed since the last load.
    fn refresh(&self, state: &mut State) -> Result<()> {
        let mtime = config::dir_mtime(&self.config_dir);
        if state.loaded && mtime.is_some() && mtime == state.loaded_mtime {
            return Ok(());
        }

        let mut networks = config::load_networks(&self.config_dir)?;
        if !networks.contains_key(&self.default_network) {
            let mut network = config::default_network(&self.default_network, self.default_subnet);
            network.created = Some(*state.default_created.get_or_insert(chrono::Utc::now()));
            networks.insert(self.default_network.clone(), network);
        }
        debug!(count = networks.len(), dir = %self.config_dir.display(), "loaded netavark networks");

        state.networks = networks;
        state.loaded_mtime = mtime;
        state.loaded = true;
        Ok(())
    }
}

impl ContainerNetwork for NetavarkNetwork {
    async fn network_create(&self, network: Network) -> Result<Network> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;

        let ctx = CreateContext {
            networks: &state.networks,
            host: self.host.as_ref(),
            device_prefix: DEVICE_PREFIX,
            dns_policy: self.dns_policy,
        };
        let mut network = prepare_network(network, &ctx)?;
        network.id = config::generate_id(&state.networks);
        network.created = Some(chrono::Utc::now());

        config::write_network(&self.config_dir, &network)?;
        info!(network = %network.name, id = %network.id, "created network");

        state.networks.insert(network.name.clone(), network.clone());
        state.loaded_mtime = None;
        Ok(network)
    }

    async fn network_remove(&self, name_or_id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;

        let network = find_network(&state.networks, name_or_id)?.clone();
        if network.name == self.default_network {
            return Err(NetworkError::DefaultNetworkRemoval(network.name));
        }

        if network.is_bridge() && !network.network_interface.is_empty() {
            if let Err(e) = self.host.remove_link(&network.network_interface).await {
                debug!(
                    link = %network.network_interface,
                    error = %e,
                    "bridge not removed"
                );
            }
        }

        config::remove_network_file(&self.config_dir, &network.name)?;
        if let Err(e) = self.ipam.remove_network(&network.name) {
            warn!(network = %network.name, error = %e, "failed to drop address leases");
        }
        state.networks.remove(&network.name);
        state.loaded_mtime = None;
        info!(network = %network.name, "removed network");
        Ok(network.name)
    }

    async fn network_list(&self, filters: &[NetworkFilter]) -> Result<Vec<Network>> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;
        Ok(list_networks(&state.networks, filters))
    }

    async fn network_inspect(&self, name_or_id: &str) -> Result<Network> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;
        find_network(&state.networks, name_or_id).cloned()
    }

    async fn setup(
        &self,
        namespace_path: &str,
        options: &NetworkOptions,
    ) -> Result<HashMap<String, StatusBlock>> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;

        let network_info = validate_setup_options(namespace_path, options, &state.networks)?;
        let mut request_options = options.clone();
        self.ipam.allocate(&mut request_options, &network_info)?;
        let request = NetavarkRequest {
            options: request_options,
            network_info,
        };

        debug!(container = %options.container_id, ns = namespace_path, "netavark setup");
        match self.exec.setup(namespace_path, &request).await {
            Ok(status) => Ok(status),
            Err(err) => {
                // Undo whatever part of the setup netavark got through.
                if let Err(e) = self.exec.teardown(namespace_path, &request).await {
                    warn!(container = %options.container_id, error = %e, "cleanup after failed setup");
                }
                if let Err(e) = self
                    .ipam
                    .release(&options.container_id, request.network_info.keys())
                {
                    warn!(container = %options.container_id, error = %e, "failed to release addresses");
                }
                Err(err)
            }
        }
    }

    async fn teardown(&self, namespace_path: &str, options: &NetworkOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        let _guard = self.lock.acquire().await?;
        self.refresh(&mut state)?;

        if namespace_path.is_empty() {
            return Err(NetworkError::InvalidArgument(
                "namespace path is empty".to_string(),
            ));
        }

        let mut errors = Vec::new();
        let mut request_options = options.clone();
        let mut network_info = HashMap::new();
        for name in options.networks.keys() {
            match state.networks.get(name) {
                Some(network) => {
                    network_info.insert(name.clone(), network.clone());
                }
                None => {
                    request_options.networks.remove(name);
                    errors.push(NetworkError::NoSuchNetwork(name.clone()));
                }
            }
        }

        if !network_info.is_empty() {
            let request = NetavarkRequest {
                options: request_options,
                network_info,
            };
            debug!(container = %options.container_id, ns = namespace_path, "netavark teardown");
            if let Err(e) = self.exec.teardown(namespace_path, &request).await {
                errors.push(e);
            }
            if let Err(e) = self
                .ipam
                .release(&options.container_id, request.network_info.keys())
            {
                errors.push(e.context("release addresses"));
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
