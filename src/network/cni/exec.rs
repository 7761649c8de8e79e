//! Running CNI plugin chains
//!
//! Each plugin binary gets its config on stdin and the CNI_* variables in its
//! environment. ADD runs the chain in order, threading each result into the
//! next plugin as `prevResult`; DEL runs it in reverse.

use crate::error::{NetworkError, Result};
use crate::network::cni::config::{plugin_type, NetworkConfigList};
use crate::network::cni::result::{CniErrorOutput, CniResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Per invocation parameters shared by every plugin in a chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    /// Joined into CNI_ARGS as `K=V;K=V`.
    pub args: Vec<(String, String)>,
    /// Capability name to value, handed to plugins declaring the capability.
    pub capability_args: Map<String, Value>,
}

impl RuntimeConf {
    fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Executes whole plugin chains.
#[async_trait]
pub trait CniExec: Send + Sync {
    async fn add_network_list(&self, list: &NetworkConfigList, rt: &RuntimeConf)
        -> Result<CniResult>;

    async fn del_network_list(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<()>;
}

/// [`CniExec`] running plugin binaries found in the plugin directories.
#[derive(Debug, Clone)]
pub struct ProcessCni {
    plugin_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl ProcessCni {
    pub fn new(plugin_dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            plugin_dirs,
            timeout,
        }
    }

    fn find_plugin(&self, kind: &str) -> Result<PathBuf> {
        if !kind.contains('/') {
            for dir in &self.plugin_dirs {
                let candidate = dir.join(kind);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        Err(NetworkError::Exec {
            binary: kind.to_string(),
            source: std::io::Error::new(
                ErrorKind::NotFound,
                format!("failed to find plugin {:?} in path {:?}", kind, self.plugin_dirs),
            ),
        })
    }

    async fn exec_plugin(
        &self,
        command: &str,
        list: &NetworkConfigList,
        plugin: &Value,
        rt: &RuntimeConf,
        prev_result: Option<&Value>,
    ) -> Result<Vec<u8>> {
        let kind = plugin_type(plugin).unwrap_or_default();
        let binary = self.find_plugin(kind)?;
        let stdin_config = plugin_config(list, plugin, rt, prev_result)?;
        trace!(plugin = kind, command, config = %String::from_utf8_lossy(&stdin_config), "running CNI plugin");

        let cni_path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| NetworkError::InvalidArgument(format!("invalid CNI plugin path: {}", e)))?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.if_name)
            .env("CNI_ARGS", rt.cni_args())
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NetworkError::Exec {
                binary: binary.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        let run = async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&stdin_config).await {
                    if e.kind() != ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| NetworkError::Timeout {
                binary: binary.display().to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| NetworkError::Exec {
                binary: binary.display().to_string(),
                source,
            })?;

        if !output.stderr.is_empty() {
            debug!(plugin = kind, stderr = %String::from_utf8_lossy(&output.stderr).trim_end(), "CNI plugin stderr");
        }
        if output.status.success() {
            return Ok(output.stdout);
        }

        Err(match serde_json::from_slice::<CniErrorOutput>(&output.stdout) {
            Ok(err) => NetworkError::CniPlugin {
                plugin: kind.to_string(),
                code: err.code,
                message: err.msg,
                details: err.details,
            },
            Err(_) => NetworkError::CniPlugin {
                plugin: kind.to_string(),
                code: 0,
                message: format!("exited with {}", output.status),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
        })
    }
}

#[async_trait]
impl CniExec for ProcessCni {
    async fn add_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<CniResult> {
        let mut prev_result: Option<Value> = None;
        for plugin in &list.plugins {
            let stdout = self
                .exec_plugin("ADD", list, plugin, rt, prev_result.as_ref())
                .await?;
            if !stdout.iter().all(u8::is_ascii_whitespace) {
                let value: Value = serde_json::from_slice(&stdout).map_err(|e| {
                    NetworkError::Internal(format!(
                        "failed to decode result of plugin {}: {}",
                        plugin_type(plugin).unwrap_or_default(),
                        e
                    ))
                })?;
                prev_result = Some(value);
            }
        }

        match prev_result {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                NetworkError::Internal(format!("failed to decode CNI result: {}", e))
            }),
            None => Ok(CniResult::default()),
        }
    }

    async fn del_network_list(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<()> {
        for plugin in list.plugins.iter().rev() {
            self.exec_plugin("DEL", list, plugin, rt, None).await?;
        }
        Ok(())
    }
}

/// Stdin document for one plugin of the chain.
fn plugin_config(
    list: &NetworkConfigList,
    plugin: &Value,
    rt: &RuntimeConf,
    prev_result: Option<&Value>,
) -> Result<Vec<u8>> {
    let Value::Object(base) = plugin else {
        return Err(NetworkError::InvalidArgument(format!(
            "plugin config of network {} is not an object",
            list.name
        )));
    };
    let mut config = base.clone();
    config.insert("name".to_string(), Value::String(list.name.clone()));
    config.insert(
        "cniVersion".to_string(),
        Value::String(list.cni_version.clone()),
    );
    if let Some(prev) = prev_result {
        config.insert("prevResult".to_string(), prev.clone());
    }

    let mut runtime_config = Map::new();
    if let Some(Value::Object(capabilities)) = base.get("capabilities") {
        for (name, enabled) in capabilities {
            if enabled.as_bool() != Some(true) {
                continue;
            }
            if let Some(value) = rt.capability_args.get(name) {
                runtime_config.insert(name.clone(), value.clone());
            }
        }
    }
    if !runtime_config.is_empty() {
        config.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
    }

    Ok(serde_json::to_vec(&Value::Object(config))?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::network::cni::result::{CniInterface, CniIpConfig};
    use std::sync::Mutex;

    /// Records calls; fails ADD for the networks named in `fail_add`.
    #[derive(Default)]
    pub struct FakeCni {
        pub adds: Mutex<Vec<(String, RuntimeConf)>>,
        pub dels: Mutex<Vec<String>>,
        pub fail_add: Vec<String>,
        pub fail_del: Vec<String>,
    }

    #[async_trait]
    impl CniExec for FakeCni {
        async fn add_network_list(
            &self,
            list: &NetworkConfigList,
            rt: &RuntimeConf,
        ) -> Result<CniResult> {
            self.adds.lock().unwrap().push((list.name.clone(), rt.clone()));
            if self.fail_add.contains(&list.name) {
                return Err(NetworkError::CniPlugin {
                    plugin: "bridge".to_string(),
                    code: 11,
                    message: "failed to allocate for range 0".to_string(),
                    details: String::new(),
                });
            }
            Ok(CniResult {
                cni_version: "1.0.0".to_string(),
                interfaces: vec![
                    CniInterface {
                        name: "cni-podman0".to_string(),
                        mac: "de:ad:be:ef:00:01".to_string(),
                        sandbox: String::new(),
                    },
                    CniInterface {
                        name: rt.if_name.clone(),
                        mac: "0a:58:0a:58:00:02".to_string(),
                        sandbox: rt.netns.clone(),
                    },
                ],
                ips: vec![CniIpConfig {
                    address: "10.88.0.2/16".parse().unwrap(),
                    gateway: Some("10.88.0.1".parse().unwrap()),
                    interface: Some(1),
                }],
                ..Default::default()
            })
        }

        async fn del_network_list(&self, list: &NetworkConfigList, _rt: &RuntimeConf) -> Result<()> {
            self.dels.lock().unwrap().push(list.name.clone());
            if self.fail_del.contains(&list.name) {
                return Err(NetworkError::CniPlugin {
                    plugin: "bridge".to_string(),
                    code: 999,
                    message: "link not found".to_string(),
                    details: String::new(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn list() -> NetworkConfigList {
        serde_json::from_value(json!({
            "cniVersion": "1.0.0",
            "name": "web",
            "plugins": [
                {"type": "bridge", "bridge": "cni-podman1", "capabilities": {"ips": true}},
                {"type": "portmap", "capabilities": {"portMappings": true}},
                {"type": "tuning"}
            ]
        }))
        .unwrap()
    }

    fn runtime() -> RuntimeConf {
        let mut rt = RuntimeConf {
            container_id: "abc".to_string(),
            netns: "/run/netns/x".to_string(),
            if_name: "eth0".to_string(),
            args: vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAME".to_string(), "web".to_string()),
            ],
            ..Default::default()
        };
        rt.capability_args
            .insert("portMappings".to_string(), json!([{"hostPort": 8080}]));
        rt.capability_args.insert("ips".to_string(), json!(["10.89.0.5/24"]));
        rt
    }

    #[test]
    fn test_plugin_config_capabilities() {
        let list = list();
        let rt = runtime();

        let bridge: Value =
            serde_json::from_slice(&plugin_config(&list, &list.plugins[0], &rt, None).unwrap()).unwrap();
        assert_eq!(bridge["name"], "web");
        assert_eq!(bridge["cniVersion"], "1.0.0");
        assert_eq!(bridge["runtimeConfig"]["ips"][0], "10.89.0.5/24");
        assert!(bridge["runtimeConfig"].get("portMappings").is_none());
        assert!(bridge.get("prevResult").is_none());

        let prev = json!({"cniVersion": "1.0.0", "ips": []});
        let portmap: Value = serde_json::from_slice(
            &plugin_config(&list, &list.plugins[1], &rt, Some(&prev)).unwrap(),
        )
        .unwrap();
        assert_eq!(portmap["runtimeConfig"]["portMappings"][0]["hostPort"], 8080);
        assert_eq!(portmap["prevResult"], prev);

        let tuning: Value =
            serde_json::from_slice(&plugin_config(&list, &list.plugins[2], &rt, None).unwrap()).unwrap();
        assert!(tuning.get("runtimeConfig").is_none());
    }

    #[test]
    fn test_cni_args() {
        assert_eq!(runtime().cni_args(), "IgnoreUnknown=1;K8S_POD_NAME=web");
    }

    #[tokio::test]
    async fn test_missing_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ProcessCni::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        let err = exec.add_network_list(&list(), &runtime()).await.unwrap_err();
        assert!(err.to_string().contains("failed to find plugin"));
    }

    fn write_plugin(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_chain_threads_prev_result() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "bridge",
            "cat > /dev/null\necho '{\"cniVersion\":\"1.0.0\",\"interfaces\":[{\"name\":\"eth0\",\"sandbox\":\"/run/netns/x\"}],\"ips\":[{\"address\":\"10.89.0.5/24\",\"interface\":0}]}'\n",
        );
        // chained plugins must see the previous result
        write_plugin(
            dir.path(),
            "portmap",
            "if grep -q prevResult; then echo '{\"cniVersion\":\"1.0.0\",\"ips\":[{\"address\":\"10.89.0.5/24\"}]}'; else echo '{\"code\":1,\"msg\":\"missing prevResult\"}'; exit 1; fi\n",
        );
        write_plugin(dir.path(), "tuning", "cat > /dev/null\n");

        let exec = ProcessCni::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        let result = exec.add_network_list(&list(), &runtime()).await.unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].address.to_string(), "10.89.0.5/24");
    }

    #[tokio::test]
    async fn test_timeout_covers_stdin_write() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "bridge", "sleep 5\n");

        // larger than a pipe buffer, so the write blocks while nothing reads
        let mut rt = runtime();
        rt.capability_args
            .insert("ips".to_string(), json!(vec!["10.89.0.5/24"; 20_000]));

        let exec = ProcessCni::new(vec![dir.path().to_path_buf()], Duration::from_millis(200));
        let start = std::time::Instant::now();
        let err = exec.add_network_list(&list(), &rt).await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_plugin_error_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "bridge",
            "cat > /dev/null\necho '{\"code\":11,\"msg\":\"no IP addresses available\",\"details\":\"range full\"}'\nexit 1\n",
        );

        let exec = ProcessCni::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        let err = exec.add_network_list(&list(), &runtime()).await.unwrap_err();
        match err {
            NetworkError::CniPlugin { plugin, code, message, details } => {
                assert_eq!(plugin, "bridge");
                assert_eq!(code, 11);
                assert_eq!(message, "no IP addresses available");
                assert_eq!(details, "range full");
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_del_runs_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order");
        for name in ["bridge", "portmap", "tuning"] {
            write_plugin(
                dir.path(),
                name,
                &format!("cat > /dev/null\necho \"$CNI_COMMAND {}\" >> {}\n", name, log.display()),
            );
        }

        let exec = ProcessCni::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        exec.del_network_list(&list(), &runtime()).await.unwrap();
        let order = std::fs::read_to_string(log).unwrap();
        assert_eq!(order, "DEL tuning\nDEL portmap\nDEL bridge\n");
    }
}
