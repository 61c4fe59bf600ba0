//! Container enrichment — pid → container/pod identity
//!
//! `Containers` resolves a process to its container through the cgroup
//! path in `/proc/<pid>/cgroup` and looks the id up in a map refreshed from
//! a pluggable `ContainerRuntime`. The same map backs `ContainersDataSource`,
//! which exposes container metadata to signatures.

use crate::datasource::DataSource;
use crate::error::{Result, WatchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Pod identity of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    /// The container is the pod's sandbox (pause) container
    #[serde(default)]
    pub sandbox: bool,
}

/// Container identity resolved for a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    pub container_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_digest: String,
    #[serde(default)]
    pub pod: PodMetadata,
}

/// Resolves process ids to container metadata
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Container metadata of the process; fails when it is not in a container
    async fn enrich(&self, pid: u32) -> Result<ContainerMetadata>;

    /// Refresh the internal container map
    async fn populate(&self) -> Result<()>;
}

/// Source of the containers currently running on the host
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn list(&self) -> Result<Vec<ContainerMetadata>>;
}

/// Runtime with a fixed container list
#[derive(Debug, Clone, Default)]
pub struct StaticRuntime {
    containers: Vec<ContainerMetadata>,
}

impl StaticRuntime {
    pub fn new(containers: Vec<ContainerMetadata>) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    fn name(&self) -> &str {
        "static"
    }

    async fn list(&self) -> Result<Vec<ContainerMetadata>> {
        Ok(self.containers.clone())
    }
}

/// cgroup-based enricher over a container runtime
pub struct Containers {
    runtime: Arc<dyn ContainerRuntime>,
    proc_root: PathBuf,
    known: RwLock<HashMap<String, ContainerMetadata>>,
}

impl Containers {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            proc_root: proc_root.into(),
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Known metadata for a container id
    pub fn get(&self, container_id: &str) -> Option<ContainerMetadata> {
        self.known.read().ok()?.get(container_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.known.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn container_id_of(&self, pid: u32) -> Result<String> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| WatchError::Enrichment(format!("{}: {}", path.display(), e)))?;
        parse_container_id(&content)
            .ok_or_else(|| WatchError::Enrichment(format!("process {} is not in a container", pid)))
    }
}

#[async_trait]
impl Enricher for Containers {
    async fn enrich(&self, pid: u32) -> Result<ContainerMetadata> {
        let container_id = self.container_id_of(pid).await?;
        if let Some(meta) = self.get(&container_id) {
            return Ok(meta);
        }

        self.populate().await?;
        match self.get(&container_id) {
            Some(meta) => Ok(meta),
            None => {
                // Started after the last refresh or unknown to the runtime
                tracing::debug!(
                    pid,
                    container_id = %container_id,
                    runtime = self.runtime.name(),
                    "Container not listed by runtime"
                );
                Ok(ContainerMetadata {
                    container_id,
                    ..Default::default()
                })
            }
        }
    }

    async fn populate(&self) -> Result<()> {
        let listed = self.runtime.list().await?;
        let refreshed: HashMap<String, ContainerMetadata> = listed
            .into_iter()
            .map(|meta| (meta.container_id.clone(), meta))
            .collect();

        let mut known = self
            .known
            .write()
            .map_err(|e| WatchError::Enrichment(format!("Container map lock poisoned: {}", e)))?;
        *known = refreshed;
        tracing::trace!(containers = known.len(), "Container map refreshed");
        Ok(())
    }
}

/// Extract the container id from `/proc/<pid>/cgroup` content
///
/// Handles cgroup v1 (`N:controller:/path`) and v2 (`0::/path`) lines and
/// the common runtime layouts: `/docker/<id>`, `docker-<id>.scope`,
/// `cri-containerd-<id>.scope`, `crio-<id>.scope`, `libpod-<id>.scope` and
/// kubepods paths ending in the bare id.
pub fn parse_container_id(content: &str) -> Option<String> {
    const PREFIXES: [&str; 5] = ["docker-", "cri-containerd-", "containerd-", "crio-", "libpod-"];

    for line in content.lines() {
        let mut parts = line.trim().splitn(3, ':');
        let path = match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(_), Some(path)) => path,
            _ => continue,
        };
        if path.is_empty() || path == "/" {
            continue;
        }

        for segment in path.rsplit('/') {
            let segment = segment.strip_suffix(".scope").unwrap_or(segment);
            let id = PREFIXES
                .iter()
                .find_map(|prefix| segment.strip_prefix(prefix))
                .unwrap_or(segment);
            if is_container_id(id) {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Container metadata exposed to signatures, keyed by container id
pub struct ContainersDataSource {
    containers: Arc<Containers>,
}

impl ContainersDataSource {
    pub const NAMESPACE: &'static str = "watch";
    pub const ID: &'static str = "containers";

    pub fn new(containers: Arc<Containers>) -> Self {
        Self { containers }
    }
}

impl DataSource for ContainersDataSource {
    fn get(&self, key: &serde_json::Value) -> Result<HashMap<String, serde_json::Value>> {
        let container_id = key.as_str().ok_or(WatchError::KeyNotSupported)?;
        let meta = self
            .containers
            .get(container_id)
            .ok_or(WatchError::DataNotFound)?;

        Ok(HashMap::from([
            ("container_id".to_string(), meta.container_id.into()),
            ("container_name".to_string(), meta.name.into()),
            ("container_image".to_string(), meta.image.into()),
            ("k8s_pod_id".to_string(), meta.pod.uid.into()),
            ("k8s_pod_name".to_string(), meta.pod.name.into()),
            ("k8s_pod_namespace".to_string(), meta.pod.namespace.into()),
            ("k8s_pod_sandbox".to_string(), meta.pod.sandbox.into()),
        ]))
    }

    fn version(&self) -> u32 {
        1
    }

    fn keys(&self) -> Vec<String> {
        vec!["string".to_string()]
    }

    fn schema(&self) -> String {
        serde_json::json!({
            "container_id": "string",
            "container_name": "string",
            "container_image": "string",
            "k8s_pod_id": "string",
            "k8s_pod_name": "string",
            "k8s_pod_namespace": "string",
            "k8s_pod_sandbox": "bool",
        })
        .to_string()
    }

    fn namespace(&self) -> &str {
        Self::NAMESPACE
    }

    fn id(&self) -> &str {
        Self::ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "4f1c2b0d9e8a7f6e5d4c3b2a19081726354453627180918273645546372819ab";

    fn web() -> ContainerMetadata {
        ContainerMetadata {
            container_id: ID.to_string(),
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            image_digest: "sha256:abc".to_string(),
            pod: PodMetadata {
                name: "web-0".to_string(),
                namespace: "default".to_string(),
                uid: "pod-uid".to_string(),
                sandbox: false,
            },
        }
    }

    fn fake_proc(pid: u32, cgroup: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join(pid.to_string());
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("cgroup"), cgroup).unwrap();
        dir
    }

    #[test]
    fn test_parse_container_id_layouts() {
        let cases = [
            format!("12:pids:/docker/{}", ID),
            format!("0::/system.slice/docker-{}.scope", ID),
            format!(
                "0::/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1.slice/cri-containerd-{}.scope",
                ID
            ),
            format!("0::/kubepods/burstable/pod1234/{}", ID),
            format!("0::/machine.slice/libpod-{}.scope", ID),
            format!("1:name=systemd:/\n0::/crio-{}.scope", ID),
        ];
        for content in &cases {
            assert_eq!(parse_container_id(content).as_deref(), Some(ID), "{}", content);
        }
    }

    #[test]
    fn test_parse_container_id_host() {
        assert_eq!(parse_container_id("0::/"), None);
        assert_eq!(parse_container_id("0::/user.slice/user-1000.slice/session-2.scope"), None);
        assert_eq!(parse_container_id("garbage"), None);
        assert_eq!(parse_container_id(""), None);
    }

    #[tokio::test]
    async fn test_enrich_known_container() {
        let proc = fake_proc(42, &format!("0::/docker/{}\n", ID));
        let containers = Containers::new(Arc::new(StaticRuntime::new(vec![web()])), proc.path());

        // Unknown until the first miss populates the map
        assert!(containers.is_empty());
        let meta = containers.enrich(42).await.unwrap();
        assert_eq!(meta, web());
        assert_eq!(containers.len(), 1);
    }

    #[tokio::test]
    async fn test_enrich_unlisted_container_keeps_id() {
        let proc = fake_proc(42, &format!("0::/docker/{}\n", ID));
        let containers = Containers::new(Arc::new(StaticRuntime::default()), proc.path());

        let meta = containers.enrich(42).await.unwrap();
        assert_eq!(meta.container_id, ID);
        assert!(meta.name.is_empty());
    }

    #[tokio::test]
    async fn test_enrich_host_process_fails() {
        let proc = fake_proc(7, "0::/init.scope\n");
        let containers = Containers::new(Arc::new(StaticRuntime::new(vec![web()])), proc.path());

        assert!(matches!(containers.enrich(7).await, Err(WatchError::Enrichment(_))));
        assert!(matches!(containers.enrich(8).await, Err(WatchError::Enrichment(_))));
    }

    #[tokio::test]
    async fn test_data_source_get() {
        let containers = Arc::new(Containers::new(
            Arc::new(StaticRuntime::new(vec![web()])),
            "/nonexistent",
        ));
        containers.populate().await.unwrap();
        let source = ContainersDataSource::new(containers);

        let result = source.get(&ID.into()).unwrap();
        assert_eq!(result["container_name"], "web");
        assert_eq!(result["container_image"], "nginx:1.25");
        assert_eq!(result["k8s_pod_name"], "web-0");
        assert_eq!(result["k8s_pod_sandbox"], false);
        assert_eq!(result.len(), 7);

        assert!(matches!(source.get(&"nope".into()), Err(WatchError::DataNotFound)));
        assert!(matches!(
            source.get(&serde_json::json!(1)),
            Err(WatchError::KeyNotSupported)
        ));

        let schema: serde_json::Value = serde_json::from_str(&source.schema()).unwrap();
        assert_eq!(schema["k8s_pod_sandbox"], "bool");
        assert_eq!(source.namespace(), "watch");
        assert_eq!(source.id(), "containers");
    }
}
