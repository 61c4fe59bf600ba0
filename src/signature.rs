//! Signature trait — the contract every detection rule implements
//!
//! Hand-written logic signatures and declarative policy signatures are
//! consumed uniformly through `Signature`. The engine calls `init` once,
//! then `on_event`/`on_signal` serially from a dedicated task, then `close`.

use crate::datasource::{DataSource, DataSourceRegistry};
use crate::error::{Result, WatchError};
use crate::selector::{Envelope, Selector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Span;

/// Information a signature declares about itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMetadata {
    pub id: String,
    pub version: String,
    pub name: String,
    /// Name given to events synthesized from this signature's findings
    pub event_name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Lifecycle notifications delivered through `Signature::on_signal`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The named input source has no more events
    SourceComplete(String),
}

/// A signature's positive-match output
#[derive(Debug, Clone)]
pub struct Finding {
    /// Unique finding identifier (fnd-<uuid>)
    pub id: String,

    /// Causal event
    pub event: Envelope,

    /// Metadata of the signature that matched
    pub metadata: SignatureMetadata,

    /// Free-form result data
    pub data: HashMap<String, serde_json::Value>,

    /// Human-readable description of the match
    pub message: String,
}

impl Finding {
    pub fn new(event: Envelope, metadata: SignatureMetadata, message: impl Into<String>) -> Self {
        Self {
            id: format!("fnd-{}", uuid::Uuid::new_v4()),
            event,
            metadata,
            data: HashMap::new(),
            message: message.into(),
        }
    }

    /// Add a result data entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Handle a signature uses to report findings back to the engine
///
/// Reporting waits for room in the engine's findings channel.
#[derive(Debug, Clone)]
pub struct FindingCallback {
    tx: mpsc::Sender<Finding>,
}

impl FindingCallback {
    pub fn new(tx: mpsc::Sender<Finding>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, finding: Finding) -> Result<()> {
        self.tx
            .send(finding)
            .await
            .map_err(|_| WatchError::Signature("findings channel closed".to_string()))
    }
}

/// Everything a signature receives at `init`
#[derive(Clone)]
pub struct SignatureContext {
    /// Finding sink
    pub callback: FindingCallback,

    /// Logging span scoped to this signature
    pub span: Span,

    data_sources: Arc<DataSourceRegistry>,
}

impl SignatureContext {
    pub fn new(callback: FindingCallback, span: Span, data_sources: Arc<DataSourceRegistry>) -> Self {
        Self {
            callback,
            span,
            data_sources,
        }
    }

    /// Look up a data source registered with the engine
    pub fn data_source(&self, namespace: &str, id: &str) -> Option<Arc<dyn DataSource>> {
        self.data_sources.get(namespace, id)
    }
}

/// Core trait for detection rules
#[async_trait]
pub trait Signature: Send + Sync {
    /// Declare information about this signature
    fn metadata(&self) -> Result<SignatureMetadata>;

    /// Declare which events this signature subscribes to
    fn selected_events(&self) -> Result<Vec<Selector>>;

    /// Prepare internal state; called once before any event is delivered
    fn init(&self, ctx: SignatureContext) -> Result<()>;

    /// Evaluate one event
    async fn on_event(&self, event: &Envelope) -> Result<()>;

    /// Handle a lifecycle signal
    ///
    /// Default implementation ignores every signal.
    async fn on_signal(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }

    /// Release resources acquired in `init`
    fn close(&self) {}
}

/// Shared state for signatures that only need their init context
///
/// Signatures are `Sync` and called through `&self`; this stores the
/// context once `init` ran.
#[derive(Default)]
pub struct ContextSlot {
    ctx: std::sync::OnceLock<SignatureContext>,
}

impl ContextSlot {
    pub fn set(&self, ctx: SignatureContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| WatchError::Signature("signature initialized twice".to_string()))
    }

    pub fn get(&self) -> Result<&SignatureContext> {
        self.ctx
            .get()
            .ok_or_else(|| WatchError::Signature("signature used before init".to_string()))
    }

    /// Emit a finding through the stored callback
    pub async fn emit(&self, finding: Finding) -> Result<()> {
        self.get()?.callback.emit(finding).await
    }
}
