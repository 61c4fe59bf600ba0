//! Configuration for the engine and the event pipeline
//!
//! Loaded from TOML; every field has a default so an empty or missing
//! file yields a working configuration.

use crate::containers::ContainerMetadata;
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub decode: DecodeConfig,

    #[serde(default)]
    pub containers: ContainersConfig,
}

impl WatchConfig {
    /// Load configuration from a TOML file; defaults when the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: WatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.signature_buffer_size == 0 {
            return Err(WatchError::Config(
                "engine.signature_buffer_size must be >= 1".to_string(),
            ));
        }
        if self.engine.findings_buffer_size == 0 {
            return Err(WatchError::Config(
                "engine.findings_buffer_size must be >= 1".to_string(),
            ));
        }
        if self.pipeline.stage_buffer_size == 0 || self.pipeline.output_buffer_size == 0 {
            return Err(WatchError::Config(
                "pipeline buffer sizes must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// What dispatch does when a signature's buffer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Wait for room; a slow signature throttles the shared dispatch loop
    #[default]
    Block,
    /// Never wait; the event is dropped for that signature and counted
    Drop,
}

/// Detection engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run the signatures engine in the events pipeline
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Capacity of each signature's input channel
    #[serde(default = "default_signature_buffer_size")]
    pub signature_buffer_size: usize,

    /// Capacity of the engine's findings channel
    #[serde(default = "default_findings_buffer_size")]
    pub findings_buffer_size: usize,

    #[serde(default)]
    pub dispatch_policy: DispatchPolicy,

    /// Longest wait for one send while draining, and for stages forwarding
    /// after cancellation
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl EngineConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signature_buffer_size: default_signature_buffer_size(),
            findings_buffer_size: default_findings_buffer_size(),
            dispatch_policy: DispatchPolicy::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Stage channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the channels between stages
    #[serde(default = "default_stage_buffer_size")]
    pub stage_buffer_size: usize,

    /// Capacity of the output boundary channel
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_buffer_size: default_stage_buffer_size(),
            output_buffer_size: default_output_buffer_size(),
        }
    }
}

/// Decode stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// procfs mount used for process inspection
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Process names whose events are never decoded
    ///
    /// The first entry is treated as the container runtime; its container
    /// id marks host events.
    #[serde(default = "default_exclude_process_names")]
    pub exclude_process_names: Vec<String>,

    #[serde(default)]
    pub extra_excluded_pids: Vec<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            exclude_process_names: default_exclude_process_names(),
            extra_excluded_pids: Vec::new(),
        }
    }
}

/// Container enrichment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainersConfig {
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Containers known up front
    #[serde(default, rename = "static")]
    pub static_containers: Vec<ContainerMetadata>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            static_containers: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_signature_buffer_size() -> usize {
    1000
}

fn default_findings_buffer_size() -> usize {
    100
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_stage_buffer_size() -> usize {
    10_000
}

fn default_output_buffer_size() -> usize {
    1000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_exclude_process_names() -> Vec<String> {
    vec![
        "containerd".to_string(),
        "kubelet".to_string(),
        "falcon-sensor".to_string(),
    ]
}
