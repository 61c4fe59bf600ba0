//! Core event types for the a3s-watch pipeline
//!
//! All types use camelCase JSON serialization for the output boundary.

use crate::selector::{Envelope, Selector, TRACE_SOURCE};
use crate::signature::{Finding, SignatureMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Distinguishes trace-derived events from events synthesized out of findings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Normalized from a raw trace record
    #[default]
    Raw,
    /// Synthesized from a signature finding
    Finding,
}

/// Where an event occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    /// Inside a container, after the entrypoint started
    Container,
    /// Inside a container, before the entrypoint started
    ContainerInit,
    /// On the host
    Host,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Container => "container",
            EventOrigin::ContainerInit => "container-init",
            EventOrigin::Host => "host",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container identity attached to an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_digest: String,
}

/// Kubernetes pod identity attached to an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubernetes {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    #[serde(default, rename = "podUID", skip_serializing_if = "String::is_empty")]
    pub pod_uid: String,
    #[serde(default)]
    pub pod_sandbox: bool,
}

/// Context flags carried alongside an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFlags {
    /// The container entrypoint has started
    #[serde(default)]
    pub container_started: bool,
    #[serde(default)]
    pub is_compat: bool,
}

/// Signature metadata copied onto a finding event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingMetadata {
    /// Unique finding identifier (fnd-<uuid>)
    pub finding_id: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Signature properties plus `signatureID` and `signatureName`
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl FindingMetadata {
    fn from_signature(finding_id: &str, meta: &SignatureMetadata) -> Self {
        let mut properties = meta.properties.clone();
        properties.insert("signatureID".to_string(), meta.id.clone().into());
        properties.insert("signatureName".to_string(), meta.name.clone().into());
        Self {
            finding_id: finding_id.to_string(),
            version: meta.version.clone(),
            description: meta.description.clone(),
            tags: meta.tags.clone(),
            properties,
        }
    }
}

/// A raw platform trace record, as handed over by the trace source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Trace provider that emitted the record
    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub event_id: u16,

    #[serde(default)]
    pub event_name: String,

    /// Operation code (1 = process start)
    #[serde(default)]
    pub opcode: u8,

    #[serde(default)]
    pub task: u16,

    #[serde(default)]
    pub host_name: String,

    /// Emitting process, when the record header carries it
    #[serde(default)]
    pub process_id: Option<u32>,

    #[serde(default)]
    pub thread_id: Option<u32>,

    /// Provider-specific key/value data
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: String::new(),
            event_id: 0,
            event_name: event_name.into(),
            opcode: 0,
            task: 0,
            host_name: String::new(),
            process_id: None,
            thread_id: None,
            data: HashMap::new(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Data field as a u32; providers report ids as numbers or decimal strings
    pub fn data_u32(&self, key: &str) -> Option<u32> {
        match self.data.get(key)? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key)?.as_str()
    }

    /// The `ProcessID` data field: the process the record is about
    ///
    /// For a process start this is the new child, while the header names
    /// the process that created it.
    pub fn subject_pid(&self) -> Option<u32> {
        self.data_u32("ProcessID")
    }

    /// Header process id, falling back to the `ProcessID` data field
    pub fn pid(&self) -> Option<u32> {
        self.process_id.or_else(|| self.data_u32("ProcessID"))
    }

    /// Header thread id, falling back to the `ThreadID` data field
    pub fn tid(&self) -> Option<u32> {
        self.thread_id.or_else(|| self.data_u32("ThreadID"))
    }
}

/// Normalized unit flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub process_id: u32,
    pub thread_id: u32,
    pub parent_process_id: u32,
    pub is_host: bool,
    pub process_name: String,
    #[serde(rename = "cmdLine")]
    pub cmdline: String,
    pub host_name: String,
    pub container_id: String,
    #[serde(default)]
    pub container: Container,
    #[serde(default)]
    pub kubernetes: Kubernetes,
    pub event_id: u16,
    pub event_name: String,
    #[serde(default)]
    pub context_flags: ContextFlags,
    #[serde(default)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FindingMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawRecord>,
    /// Human-readable finding text; empty for raw events
    #[serde(default)]
    pub message: String,
}

impl Event {
    /// An empty raw event stamped with the current time
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            process_id: 0,
            thread_id: 0,
            parent_process_id: 0,
            is_host: false,
            process_name: String::new(),
            cmdline: String::new(),
            host_name: String::new(),
            container_id: String::new(),
            container: Container::default(),
            kubernetes: Kubernetes::default(),
            event_id: 0,
            event_name: event_name.into(),
            context_flags: ContextFlags::default(),
            kind: EventKind::Raw,
            metadata: None,
            raw: None,
            message: String::new(),
        }
    }

    pub fn is_finding(&self) -> bool {
        self.kind == EventKind::Finding
    }

    /// Derive the event origin from context flags and container identity
    pub fn origin(&self) -> EventOrigin {
        if self.context_flags.container_started {
            EventOrigin::Container
        } else if !self.container.id.is_empty() || !self.container_id.is_empty() {
            EventOrigin::ContainerInit
        } else {
            EventOrigin::Host
        }
    }

    pub fn selector(&self) -> Selector {
        Selector::new(TRACE_SOURCE, &self.event_name, self.origin().as_str())
    }

    /// Wrap a copy of this event for the detection engine
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.selector(), self.clone())
    }

    /// Synthesize an outbound event from a finding
    ///
    /// Identity fields are copied from the causal event; the finding's
    /// message and signature metadata are attached.
    pub fn from_finding(finding: &Finding) -> Self {
        let cause = finding.event.event();
        Self {
            timestamp: cause.timestamp,
            process_id: cause.process_id,
            thread_id: cause.thread_id,
            parent_process_id: cause.parent_process_id,
            is_host: cause.is_host,
            process_name: cause.process_name.clone(),
            cmdline: cause.cmdline.clone(),
            host_name: cause.host_name.clone(),
            container_id: cause.container_id.clone(),
            container: cause.container.clone(),
            kubernetes: cause.kubernetes.clone(),
            event_id: 0,
            event_name: finding.metadata.event_name.clone(),
            context_flags: cause.context_flags,
            kind: EventKind::Finding,
            metadata: Some(FindingMetadata::from_signature(&finding.id, &finding.metadata)),
            raw: None,
            message: finding.message.clone(),
        }
    }
}

impl From<Finding> for Event {
    fn from(finding: Finding) -> Self {
        Event::from_finding(&finding)
    }
}
