//! Detection engine: signature registry, selector routing and lifecycle
//!
//! The engine consumes `Envelope`s from one input channel and fans each out
//! to every loaded signature whose selectors match. Every signature has its
//! own bounded channel and a dedicated consumer task, so signatures run
//! concurrently with each other and serially with respect to themselves.
//!
//! State machine: `Constructed → Running → (Draining) → Stopped`. Input
//! closure notifies signatures with `Signal::SourceComplete` and stops the
//! engine; cancellation first dispatches what is already buffered on the
//! input, without waiting for more.

use crate::config::{DispatchPolicy, EngineConfig};
use crate::datasource::{DataSource, DataSourceRegistry};
use crate::error::{Result, WatchError};
use crate::selector::{Envelope, Selector, SelectorIndex};
use crate::signature::{Finding, FindingCallback, Signal, Signature, SignatureContext, SignatureMetadata};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Opaque identifier assigned to a signature when it is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignatureHandle(u64);

impl fmt::Display for SignatureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig#{}", self.0)
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Signatures and data sources loaded, nothing consuming
    Constructed,
    /// Dispatching inbound events
    Running,
    /// Cancelled; dispatching what was buffered on the input
    Draining,
    /// Every signature closed and the registry cleared
    Stopped,
}

/// Item on a signature's private channel
enum Delivery {
    Event(Envelope),
    Signal(Signal),
}

struct Loaded {
    signature: Arc<dyn Signature>,
    metadata: SignatureMetadata,
    selectors: Vec<Selector>,
    tx: mpsc::Sender<Delivery>,
    /// Receiver parked until the engine starts
    idle: Option<mpsc::Receiver<Delivery>>,
    task: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    span: Span,
}

impl Loaded {
    fn start(&mut self) {
        if let Some(rx) = self.idle.take() {
            let consumer = consume(self.signature.clone(), self.metadata.id.clone(), rx);
            self.task = Some(tokio::spawn(consumer.instrument(self.span.clone())));
        }
    }

    /// Close the channel; returns the consumer task to join, if one runs
    fn shutdown(self) -> Option<JoinHandle<()>> {
        drop(self.tx);
        if self.idle.is_some() {
            // Never started: no consumer will call close for us
            self.signature.close();
        }
        self.task
    }
}

#[derive(Default)]
struct Registry {
    signatures: HashMap<SignatureHandle, Loaded>,
    index: SelectorIndex<SignatureHandle>,
}

/// Builder for `Engine`
///
/// Input and output channels are mandatory. Signatures and data sources
/// added here are registered during `build`; a failure to load one of them
/// is logged and does not fail construction.
pub struct EngineBuilder {
    config: EngineConfig,
    input: Option<mpsc::Receiver<Envelope>>,
    output: Option<mpsc::Sender<Finding>>,
    signatures: Vec<Arc<dyn Signature>>,
    data_sources: Vec<Arc<dyn DataSource>>,
    span: Option<Span>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            input: None,
            output: None,
            signatures: Vec::new(),
            data_sources: Vec::new(),
            span: None,
        }
    }

    pub fn input(mut self, input: mpsc::Receiver<Envelope>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: mpsc::Sender<Finding>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn signature(mut self, signature: Arc<dyn Signature>) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn signatures(mut self, signatures: impl IntoIterator<Item = Arc<dyn Signature>>) -> Self {
        self.signatures.extend(signatures);
        self
    }

    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_sources.push(source);
        self
    }

    /// Parent span for engine and signature logs
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let input = self.input.ok_or(WatchError::MissingChannel("input"))?;
        let findings = self.output.ok_or(WatchError::MissingChannel("output"))?;
        let (state, _) = watch::channel(EngineState::Constructed);

        let engine = Engine {
            config: self.config,
            registry: RwLock::new(Registry::default()),
            data_sources: Arc::new(DataSourceRegistry::new()),
            input: Mutex::new(Some(input)),
            findings,
            state,
            next_handle: AtomicU64::new(1),
            sealed: AtomicBool::new(false),
            span: self.span.unwrap_or_else(|| tracing::info_span!("engine")),
        };

        // Data sources first so signature init can look them up
        for source in self.data_sources {
            if let Err(e) = engine.register_data_source(source) {
                tracing::error!(parent: &engine.span, error = %e, "Failed to register data source");
            }
        }
        for signature in self.signatures {
            if let Err(e) = engine.load(signature).await {
                tracing::error!(parent: &engine.span, error = %e, "Failed to load signature");
            }
        }

        Ok(engine)
    }
}

/// Signature registry plus the dispatch loop feeding it
pub struct Engine {
    config: EngineConfig,
    registry: RwLock<Registry>,
    data_sources: Arc<DataSourceRegistry>,
    input: Mutex<Option<mpsc::Receiver<Envelope>>>,
    findings: mpsc::Sender<Finding>,
    state: watch::Sender<EngineState>,
    next_handle: AtomicU64,
    /// Set under the registry write lock once the final unload began
    sealed: AtomicBool,
    span: Span,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Resolve once the engine reached `Stopped`
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|state| *state == EngineState::Stopped).await;
    }

    pub fn register_data_source(&self, source: Arc<dyn DataSource>) -> Result<()> {
        let namespace = source.namespace().to_string();
        let id = source.id().to_string();
        self.data_sources.register(source)?;
        tracing::debug!(parent: &self.span, namespace = %namespace, id = %id, "Data source registered");
        Ok(())
    }

    pub fn get_data_source(&self, namespace: &str, id: &str) -> Option<Arc<dyn DataSource>> {
        self.data_sources.get(namespace, id)
    }

    /// Load a signature and return its declared id
    ///
    /// When the engine is already running the signature starts consuming
    /// immediately; otherwise it starts with the engine.
    pub async fn load_signature(&self, signature: Arc<dyn Signature>) -> Result<String> {
        let (_, id) = self.load(signature).await?;
        Ok(id)
    }

    async fn load(&self, signature: Arc<dyn Signature>) -> Result<(SignatureHandle, String)> {
        let metadata = signature
            .metadata()
            .map_err(|e| WatchError::Metadata(e.to_string()))?;
        let selectors = signature
            .selected_events()
            .map_err(|e| WatchError::Selector {
                signature: metadata.id.clone(),
                reason: e.to_string(),
            })?;

        let mut registry = self.registry.write().await;
        let state = self.state();
        if self.sealed.load(Ordering::Acquire)
            || matches!(state, EngineState::Draining | EngineState::Stopped)
        {
            return Err(WatchError::InvalidState(format!(
                "cannot load signature {} while engine is {:?}",
                metadata.id, state
            )));
        }
        if registry
            .signatures
            .values()
            .any(|loaded| Arc::ptr_eq(&loaded.signature, &signature))
        {
            return Err(WatchError::AlreadyLoaded(metadata.id));
        }

        let span = tracing::info_span!(parent: &self.span, "signature", id = %metadata.id);
        let ctx = SignatureContext::new(
            FindingCallback::new(self.findings.clone()),
            span.clone(),
            self.data_sources.clone(),
        );
        signature.init(ctx).map_err(|e| WatchError::Init {
            signature: metadata.id.clone(),
            reason: e.to_string(),
        })?;

        let handle = SignatureHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.signature_buffer_size.max(1));

        let mut indexed = Vec::with_capacity(selectors.len());
        for selector in selectors {
            if selector.source.is_empty() {
                tracing::warn!(
                    parent: &span,
                    name = %selector.name,
                    origin = %selector.origin,
                    "Selector without source ignored"
                );
                continue;
            }
            let selector = selector.normalized();
            registry.index.insert(selector.clone(), handle);
            indexed.push(selector);
        }

        let mut loaded = Loaded {
            signature,
            metadata: metadata.clone(),
            selectors: indexed,
            tx,
            idle: Some(rx),
            task: None,
            dropped: Arc::new(AtomicU64::new(0)),
            span,
        };
        if state == EngineState::Running {
            loaded.start();
        }
        registry.signatures.insert(handle, loaded);

        tracing::info!(
            parent: &self.span,
            signature = %metadata.id,
            name = %metadata.name,
            handle = %handle,
            "Signature loaded"
        );
        Ok((handle, metadata.id))
    }

    /// Unload one signature; its consumer finishes what is buffered, then closes
    pub async fn unload_signature(&self, handle: SignatureHandle) -> bool {
        let removed = {
            let mut registry = self.registry.write().await;
            registry.index.remove(handle);
            registry.signatures.remove(&handle)
        };
        match removed {
            Some(loaded) => {
                let id = loaded.metadata.id.clone();
                if let Some(task) = loaded.shutdown() {
                    if let Err(e) = task.await {
                        tracing::error!(parent: &self.span, signature = %id, error = %e, "Signature task failed");
                    }
                }
                tracing::info!(parent: &self.span, signature = %id, "Signature unloaded");
                true
            }
            None => false,
        }
    }

    /// Close every signature, clear the registry and index, and join all
    /// consumer tasks
    pub async fn unload_all(&self) {
        self.unload(false).await;
    }

    /// `seal` refuses every later load, checked under the same lock
    async fn unload(&self, seal: bool) {
        let unloaded: Vec<Loaded> = {
            let mut registry = self.registry.write().await;
            if seal {
                self.sealed.store(true, Ordering::Release);
            }
            registry.index.clear();
            registry.signatures.drain().map(|(_, loaded)| loaded).collect()
        };
        let count = unloaded.len();

        let tasks: Vec<JoinHandle<()>> = unloaded.into_iter().filter_map(Loaded::shutdown).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(parent: &self.span, error = %e, "Signature task failed");
            }
        }

        tracing::info!(parent: &self.span, signatures = count, "All signatures unloaded");
    }

    /// Loaded signatures ordered by handle
    pub async fn loaded(&self) -> Vec<(SignatureHandle, SignatureMetadata)> {
        let registry = self.registry.read().await;
        let mut loaded: Vec<_> = registry
            .signatures
            .iter()
            .map(|(handle, loaded)| (*handle, loaded.metadata.clone()))
            .collect();
        loaded.sort_by_key(|(handle, _)| *handle);
        loaded
    }

    /// Events dropped for a signature: a full buffer under
    /// `DispatchPolicy::Drop`, or a send that timed out while draining
    pub async fn dropped(&self, handle: SignatureHandle) -> u64 {
        let registry = self.registry.read().await;
        registry
            .signatures
            .get(&handle)
            .map(|loaded| loaded.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Run the dispatch loop until the input closes or `cancel` fires
    ///
    /// An engine runs once; a second call fails with `InvalidState`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| WatchError::InvalidState("engine already started".to_string()))?;

        self.state.send_replace(EngineState::Running);
        let started = {
            let mut registry = self.registry.write().await;
            registry.signatures.values_mut().for_each(Loaded::start);
            registry.signatures.len()
        };
        tracing::info!(parent: &self.span, signatures = started, "Engine started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain(&mut input).await;
                    break;
                }
                next = input.recv() => match next {
                    Some(envelope) => self.dispatch(&envelope, None).await,
                    None => {
                        self.signal_source_complete().await;
                        break;
                    }
                },
            }
        }

        drop(input);
        self.unload(true).await;
        self.state.send_replace(EngineState::Stopped);
        tracing::info!(parent: &self.span, "Engine stopped");
        Ok(())
    }

    /// Dispatch what is already buffered on the input, then return
    ///
    /// Events sent after the buffer ran empty are not evaluated. Under
    /// `DispatchPolicy::Block` each send waits at most the drain timeout.
    async fn drain(&self, input: &mut mpsc::Receiver<Envelope>) {
        self.state.send_replace(EngineState::Draining);
        let timeout = self.config.drain_timeout();

        let mut drained = 0usize;
        let closed = loop {
            match input.try_recv() {
                Ok(envelope) => {
                    self.dispatch(&envelope, Some(timeout)).await;
                    drained += 1;
                }
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };

        if closed {
            self.signal_source_complete().await;
        }
        tracing::info!(parent: &self.span, drained, input_closed = closed, "Engine input drained");
    }

    /// Route one event to every matching signature
    ///
    /// A signature indexed under several buckets matching this event gets
    /// it once per bucket.
    pub async fn process_event(&self, envelope: &Envelope) {
        self.dispatch(envelope, None).await;
    }

    async fn dispatch(&self, envelope: &Envelope, wait: Option<Duration>) {
        let registry = self.registry.read().await;
        for handle in registry.index.matches(&envelope.selector) {
            if let Some(loaded) = registry.signatures.get(&handle) {
                self.deliver(loaded, envelope.clone(), wait).await;
            }
        }
    }

    async fn deliver(&self, loaded: &Loaded, envelope: Envelope, wait: Option<Duration>) {
        let delivery = Delivery::Event(envelope);
        match (self.config.dispatch_policy, wait) {
            (DispatchPolicy::Block, None) => {
                if loaded.tx.send(delivery).await.is_err() {
                    tracing::debug!(parent: &loaded.span, "Signature channel closed, event discarded");
                }
            }
            (DispatchPolicy::Block, Some(wait)) => match loaded.tx.send_timeout(delivery, wait).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    let total = loaded.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        parent: &loaded.span,
                        dropped = total,
                        wait_ms = wait.as_millis() as u64,
                        "Signature did not accept event while draining, event dropped"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {}
            },
            (DispatchPolicy::Drop, _) => match loaded.tx.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let total = loaded.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!(parent: &loaded.span, dropped = total, "Signature buffer full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            },
        }
    }

    /// Tell every signature the sources it selected have no more events
    async fn signal_source_complete(&self) {
        let registry = self.registry.read().await;
        for loaded in registry.signatures.values() {
            let sources: BTreeSet<&str> = loaded.selectors.iter().map(|s| s.source.as_str()).collect();
            for source in sources {
                let signal = Signal::SourceComplete(source.to_string());
                if loaded.tx.send(Delivery::Signal(signal)).await.is_err() {
                    tracing::debug!(parent: &loaded.span, source, "Signature channel closed, signal discarded");
                }
            }
        }
    }
}

/// Per-signature consumer: deliver until the channel closes, then close
async fn consume(signature: Arc<dyn Signature>, id: String, mut rx: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let result = match delivery {
            Delivery::Event(envelope) => signature.on_event(&envelope).await,
            Delivery::Signal(signal) => signature.on_signal(signal).await,
        };
        if let Err(e) = result {
            tracing::error!(signature = %id, error = %e, "Signature failed to handle delivery");
        }
    }
    signature.close();
    tracing::debug!(signature = %id, "Signature closed");
}
