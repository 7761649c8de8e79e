//! `<name>.json` network files

use crate::error::{NetworkError, Result};
use crate::network::types::{Network, Subnet, IPAM_DRIVER_KEY, IPAM_HOST_LOCAL};
use crate::network::validation::{is_valid_name, validate_stored_subnets};
use ipnetwork::IpNetwork;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// ID of the built-in default network, identical on every host.
pub const DEFAULT_NETWORK_ID: &str =
    "2f259bab93aaaaa2542ba43ef33eb990d0999ee1b9924b557b7be53c0b7a1bb9";

pub const DEFAULT_INTERFACE: &str = "podman0";

const ID_LEN: usize = 64;

pub fn config_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Modification time of the config directory, None when it does not exist.
pub fn dir_mtime(dir: &Path) -> Option<SystemTime> {
    fs::metadata(dir).and_then(|m| m.modified()).ok()
}

/// Read every valid network file in `dir`. Invalid files are skipped.
pub fn load_networks(dir: &Path) -> Result<HashMap<String, Network>> {
    let mut networks = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(networks),
        Err(e) => {
            return Err(NetworkError::ConfigFile {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })
        }
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_network(&path) {
            Ok(network) => {
                if networks.contains_key(&network.name) {
                    warn!(
                        path = %path.display(),
                        network = %network.name,
                        "skipping network file with duplicate name"
                    );
                    continue;
                }
                debug!(path = %path.display(), network = %network.name, "loaded network");
                networks.insert(network.name.clone(), network);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid network file"),
        }
    }
    Ok(networks)
}

fn load_network(path: &Path) -> Result<Network> {
    let invalid = |message: String| NetworkError::ConfigFile {
        path: path.to_path_buf(),
        message,
    };

    let data = fs::read(path).map_err(|e| invalid(e.to_string()))?;
    let network: Network = serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;

    if !is_valid_name(&network.name) {
        return Err(invalid(format!("invalid network name {:?}", network.name)));
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if stem != network.name {
        return Err(invalid(format!(
            "network name {} does not match file name",
            network.name
        )));
    }
    if !is_valid_id(&network.id) {
        return Err(invalid(format!("invalid network ID {:?}", network.id)));
    }
    validate_stored_subnets(&network).map_err(|e| invalid(e.to_string()))?;
    Ok(network)
}

/// Write atomically through a temp file in the same directory.
pub fn write_network(dir: &Path, network: &Network) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = config_path(dir, &network.name);
    let tmp = dir.join(format!(".{}.json.tmp", network.name));
    let data = serde_json::to_vec_pretty(network)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Remove a network file; a missing file is not an error.
pub fn remove_network_file(dir: &Path, name: &str) -> Result<()> {
    match fs::remove_file(config_path(dir, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn default_network(name: &str, subnet: IpNetwork) -> Network {
    let mut network = Network {
        name: name.to_string(),
        id: DEFAULT_NETWORK_ID.to_string(),
        network_interface: DEFAULT_INTERFACE.to_string(),
        created: Some(chrono::Utc::now()),
        subnets: vec![Subnet {
            gateway: crate::network::util::add_to_ip(subnet.network(), 1),
            subnet,
            lease_range: None,
        }],
        ..Default::default()
    };
    network
        .ipam_options
        .insert(IPAM_DRIVER_KEY.to_string(), IPAM_HOST_LOCAL.to_string());
    network
}

pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Random 64 hex character ID not used by any of `networks`.
pub fn generate_id(networks: &HashMap<String, Network>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; ID_LEN / 2];
        rng.fill_bytes(&mut bytes);
        let id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        if !networks.values().any(|n| n.id == id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Network {
        Network {
            name: name.to_string(),
            id: "ab".repeat(32),
            network_interface: "podman1".to_string(),
            subnets: vec![Subnet {
                subnet: "10.89.0.0/24".parse().unwrap(),
                gateway: Some("10.89.0.1".parse().unwrap()),
                lease_range: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut network = sample("web");
        network.created = Some(chrono::Utc::now());
        network.labels.insert("app".to_string(), "web".to_string());
        write_network(dir.path(), &network).unwrap();

        let loaded = load_networks(dir.path()).unwrap();
        assert_eq!(loaded.get("web"), Some(&network));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_networks(&dir.path().join("nope")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_invalid_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_network(dir.path(), &sample("good")).unwrap();

        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        // name does not match file
        let data = serde_json::to_vec(&sample("other")).unwrap();
        fs::write(dir.path().join("renamed.json"), data).unwrap();
        // bad id
        let mut bad_id = sample("badid");
        bad_id.id = "xyz".to_string();
        fs::write(dir.path().join("badid.json"), serde_json::to_vec(&bad_id).unwrap()).unwrap();
        // gateway outside subnet
        let mut bad_gw = sample("badgw");
        bad_gw.subnets[0].gateway = Some("10.90.0.1".parse().unwrap());
        fs::write(dir.path().join("badgw.json"), serde_json::to_vec(&bad_gw).unwrap()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_networks(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("good"));
    }

    #[test]
    fn test_remove_missing_file_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_network_file(dir.path(), "ghost").is_ok());
    }

    #[test]
    fn test_default_network_shape() {
        let network = default_network("podman", "10.88.0.0/16".parse().unwrap());
        assert_eq!(network.id, DEFAULT_NETWORK_ID);
        assert_eq!(network.network_interface, "podman0");
        assert_eq!(network.subnets[0].gateway.unwrap().to_string(), "10.88.0.1");
        assert!(is_valid_id(&network.id));
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id(&HashMap::new());
        assert!(is_valid_id(&id));
        assert!(!is_valid_id("ABCD"));
    }
}
