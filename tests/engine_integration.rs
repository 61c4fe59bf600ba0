//! Engine integration tests
//!
//! Exercise the engine through its public API only: signatures written
//! against the `Signature` trait, data sources looked up at init, routing
//! by event origin and the run/drain lifecycle.

use a3s_watch::containers::{ContainerMetadata, Containers, ContainersDataSource, StaticRuntime};
use a3s_watch::signature::ContextSlot;
use a3s_watch::{
    DataSource, DispatchPolicy, Engine, EngineConfig, EngineState, Enricher, Envelope, Event,
    Finding, Result, Selector, Signal, Signature, SignatureContext, SignatureMetadata, WatchError,
    TRACE_SOURCE,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Reports container events with the container name from the data source
#[derive(Default)]
struct ContainerWatcher {
    ctx: ContextSlot,
    containers: OnceLock<Arc<dyn DataSource>>,
    completed: Mutex<Vec<String>>,
}

#[async_trait]
impl Signature for ContainerWatcher {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(SignatureMetadata {
            id: "TEST-1".to_string(),
            version: "1".to_string(),
            name: "Container watcher".to_string(),
            event_name: "container_activity".to_string(),
            ..Default::default()
        })
    }

    fn selected_events(&self) -> Result<Vec<Selector>> {
        Ok(vec![
            Selector::new(TRACE_SOURCE, "*", "container"),
            Selector::new(TRACE_SOURCE, "*", "container-init"),
        ])
    }

    fn init(&self, ctx: SignatureContext) -> Result<()> {
        let source = ctx
            .data_source(ContainersDataSource::NAMESPACE, ContainersDataSource::ID)
            .ok_or_else(|| WatchError::Signature("containers data source missing".to_string()))?;
        let _ = self.containers.set(source);
        self.ctx.set(ctx)
    }

    async fn on_event(&self, event: &Envelope) -> Result<()> {
        let source = self
            .containers
            .get()
            .ok_or_else(|| WatchError::Signature("not initialized".to_string()))?;
        let info = source.get(&event.event().container_id.clone().into())?;
        let name = info["container_name"].as_str().unwrap_or_default().to_string();

        let finding = Finding::new(
            event.clone(),
            self.metadata()?,
            format!("activity in container {}", name),
        )
        .with_data("container", name);
        self.ctx.emit(finding).await
    }

    async fn on_signal(&self, signal: Signal) -> Result<()> {
        let Signal::SourceComplete(source) = signal;
        self.completed.lock().unwrap().push(source);
        Ok(())
    }
}

/// Blocks on a semaphore for every event it receives
struct Stalled {
    id: &'static str,
    gate: Arc<Semaphore>,
    seen: AtomicUsize,
}

#[async_trait]
impl Signature for Stalled {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(SignatureMetadata {
            id: self.id.to_string(),
            ..Default::default()
        })
    }

    fn selected_events(&self) -> Result<Vec<Selector>> {
        Ok(vec![Selector::all(TRACE_SOURCE)])
    }

    fn init(&self, _ctx: SignatureContext) -> Result<()> {
        Ok(())
    }

    async fn on_event(&self, _event: &Envelope) -> Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| WatchError::Signature(e.to_string()))?;
        permit.forget();
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const CONTAINER_ID: &str = "abababababababababababababababababababababababababababababababab";

fn container_event(name: &str, started: bool) -> Event {
    let mut event = Event::new(name);
    event.container_id = CONTAINER_ID.to_string();
    event.container.id = CONTAINER_ID.to_string();
    event.context_flags.container_started = started;
    event
}

async fn containers_source() -> Arc<ContainersDataSource> {
    let runtime = StaticRuntime::new(vec![ContainerMetadata {
        container_id: CONTAINER_ID.to_string(),
        name: "api".to_string(),
        ..Default::default()
    }]);
    let containers = Arc::new(Containers::new(Arc::new(runtime), "/nonexistent"));
    containers.populate().await.unwrap();
    Arc::new(ContainersDataSource::new(containers))
}

// ─── Data sources & routing ──────────────────────────────────────

#[tokio::test]
async fn test_signature_queries_data_source() {
    let (input_tx, input_rx) = mpsc::channel(16);
    let (findings_tx, mut findings_rx) = mpsc::channel(16);
    let watcher = Arc::new(ContainerWatcher::default());

    let engine = Engine::builder(EngineConfig::default())
        .input(input_rx)
        .output(findings_tx)
        .data_source(containers_source().await)
        .signature(watcher.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(engine.loaded().await.len(), 1);

    input_tx.send(container_event("FileCreate", true).to_envelope()).await.unwrap();
    input_tx.send(container_event("ProcessStart", false).to_envelope()).await.unwrap();
    // Host event: no selector of the watcher matches
    input_tx.send(Event::new("ProcessStart").to_envelope()).await.unwrap();
    drop(input_tx);

    engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);

    let mut findings = Vec::new();
    while let Ok(finding) = findings_rx.try_recv() {
        findings.push(finding);
    }
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].message, "activity in container api");
    assert_eq!(findings[0].event.selector.origin, "container");
    assert_eq!(findings[1].event.selector.origin, "container-init");
    assert_eq!(findings[1].data["container"], "api");

    // One signal per selected source, not per selector
    assert_eq!(*watcher.completed.lock().unwrap(), vec![TRACE_SOURCE.to_string()]);
}

#[tokio::test]
async fn test_init_without_data_source_is_not_loaded() {
    let (_input_tx, input_rx) = mpsc::channel::<Envelope>(1);
    let (findings_tx, _findings_rx) = mpsc::channel(1);
    let engine = Engine::builder(EngineConfig::default())
        .input(input_rx)
        .output(findings_tx)
        .build()
        .await
        .unwrap();

    let err = engine
        .load_signature(Arc::new(ContainerWatcher::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, WatchError::Init { .. }));
    assert!(engine.loaded().await.is_empty());
}

// ─── Dispatch policy ─────────────────────────────────────────────

#[tokio::test]
async fn test_drop_policy_isolates_stalled_signature() {
    let config = EngineConfig {
        signature_buffer_size: 1,
        dispatch_policy: DispatchPolicy::Drop,
        ..Default::default()
    };
    let stalled_gate = Arc::new(Semaphore::new(0));
    let open_gate = Arc::new(Semaphore::new(1000));
    let stalled = Arc::new(Stalled {
        id: "STALLED",
        gate: stalled_gate.clone(),
        seen: AtomicUsize::new(0),
    });
    let healthy = Arc::new(Stalled {
        id: "HEALTHY",
        gate: open_gate,
        seen: AtomicUsize::new(0),
    });

    let (input_tx, input_rx) = mpsc::channel(64);
    let (findings_tx, _findings_rx) = mpsc::channel(1);
    let engine = Arc::new(
        Engine::builder(config)
            .input(input_rx)
            .output(findings_tx)
            .signature(stalled.clone())
            .signature(healthy.clone())
            .build()
            .await
            .unwrap(),
    );
    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(CancellationToken::new()).await }
    });

    for i in 0..20 {
        input_tx.send(Event::new(format!("e{}", i)).to_envelope()).await.unwrap();
        // Let the healthy consumer keep up with its single-slot buffer
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Dispatch never blocked on the stalled signature
    let handles = engine.loaded().await;
    let stalled_handle = handles.iter().find(|(_, m)| m.id == "STALLED").unwrap().0;
    assert!(engine.dropped(stalled_handle).await >= 18);

    stalled_gate.add_permits(100);
    drop(input_tx);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(stalled.seen.load(Ordering::SeqCst) <= 2);
    assert!(healthy.seen.load(Ordering::SeqCst) > stalled.seen.load(Ordering::SeqCst));
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_drains_then_stops() {
    let (input_tx, input_rx) = mpsc::channel(64);
    let (findings_tx, mut findings_rx) = mpsc::channel(64);
    let engine = Arc::new(
        Engine::builder(EngineConfig::default())
            .input(input_rx)
            .output(findings_tx)
            .data_source(containers_source().await)
            .signature(Arc::new(ContainerWatcher::default()))
            .build()
            .await
            .unwrap(),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    for i in 0..8 {
        input_tx
            .send(container_event(&format!("e{}", i), true).to_envelope())
            .await
            .unwrap();
    }
    // Input stays open: cancellation alone ends the run
    cancel.cancel();

    engine.wait_stopped().await;
    task.await.unwrap().unwrap();
    assert!(input_tx
        .send(container_event("late", true).to_envelope())
        .await
        .is_err());

    let mut names = Vec::new();
    while let Ok(finding) = findings_rx.try_recv() {
        names.push(finding.event.event().event_name.clone());
    }
    let expected: Vec<String> = (0..8).map(|i| format!("e{}", i)).collect();
    assert_eq!(names, expected);
    assert!(engine.loaded().await.is_empty());
}
