//! Detect stage: bridge between the pipeline and the detection engine
//!
//! Two tasks share the downstream channel: one passes raw events through
//! and feeds them to the engine, the other turns engine findings into
//! events. Their relative order downstream is unspecified.

use super::{forward, StageOptions};
use crate::config::EngineConfig;
use crate::datasource::DataSource;
use crate::engine::Engine;
use crate::error::Result;
use crate::selector::Envelope;
use crate::signature::{Finding, Signature};
use crate::types::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct DetectStage {
    engine: Arc<Engine>,
    tasks: Vec<JoinHandle<()>>,
}

impl DetectStage {
    /// Build the engine and spawn the engine loop plus both bridge tasks
    pub async fn start(
        config: EngineConfig,
        signatures: Vec<Arc<dyn Signature>>,
        data_sources: Vec<Arc<dyn DataSource>>,
        input: mpsc::Receiver<Event>,
        output: mpsc::Sender<Event>,
        cancel: CancellationToken,
        opts: StageOptions,
    ) -> Result<Self> {
        let (engine_tx, engine_rx) = mpsc::channel(opts.buffer);
        let (findings_tx, findings_rx) = mpsc::channel(config.findings_buffer_size.max(1));

        let mut builder = Engine::builder(config)
            .input(engine_rx)
            .output(findings_tx)
            .signatures(signatures);
        for source in data_sources {
            builder = builder.data_source(source);
        }
        let engine = Arc::new(builder.build().await?);

        // The engine ends on input closure: upstream stages drain on cancel
        // and close its input, so nothing buffered upstream goes unevaluated
        let engine_task = tokio::spawn({
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.run(CancellationToken::new()).await {
                    tracing::error!(error = %e, "Engine failed");
                }
            }
        });
        let raw_task = tokio::spawn(feed_engine(
            input,
            output.clone(),
            engine_tx,
            cancel.clone(),
            opts,
        ));
        let findings_task = tokio::spawn(collect_findings(
            engine.clone(),
            findings_rx,
            output,
            cancel,
            opts,
        ));

        Ok(Self {
            engine,
            tasks: vec![engine_task, raw_task, findings_task],
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

/// Pass raw events downstream and hand a copy to the engine
///
/// Finding events are forwarded but never fed back into detection.
async fn feed_engine(
    mut input: mpsc::Receiver<Event>,
    output: mpsc::Sender<Event>,
    engine: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    opts: StageOptions,
) {
    while let Some(event) = input.recv().await {
        if event.is_finding() {
            if !forward(&output, event, &cancel, opts).await {
                break;
            }
            continue;
        }

        let envelope = event.to_envelope();
        if !forward(&output, event, &cancel, opts).await {
            tracing::warn!("Detect output closed");
            break;
        }
        if !forward(&engine, envelope, &cancel, opts).await {
            tracing::warn!("Engine input closed, event not evaluated");
        }
    }
    // Dropping the engine sender stops the engine
    tracing::debug!("Detect feed stopped");
}

/// Convert findings into events until the engine stopped
async fn collect_findings(
    engine: Arc<Engine>,
    mut findings: mpsc::Receiver<Finding>,
    output: mpsc::Sender<Event>,
    cancel: CancellationToken,
    opts: StageOptions,
) {
    let stopped = engine.wait_stopped();
    tokio::pin!(stopped);

    let mut count = 0u64;
    loop {
        let finding = tokio::select! {
            biased;
            finding = findings.recv() => match finding {
                Some(finding) => finding,
                None => break,
            },
            _ = &mut stopped => break,
        };
        count += 1;
        if !emit(&output, finding, &cancel, opts).await {
            return;
        }
    }

    // Every consumer was joined before Stopped, so nothing else arrives
    while let Ok(finding) = findings.try_recv() {
        count += 1;
        if !emit(&output, finding, &cancel, opts).await {
            return;
        }
    }
    tracing::debug!(findings = count, "Detect findings collector stopped");
}

async fn emit(
    output: &mpsc::Sender<Event>,
    finding: Finding,
    cancel: &CancellationToken,
    opts: StageOptions,
) -> bool {
    tracing::info!(
        finding = %finding.id,
        signature = %finding.metadata.id,
        event = %finding.metadata.event_name,
        pid = finding.event.event().process_id,
        "Signature matched"
    );
    let event = Event::from(finding);
    if !forward(output, event, cancel, opts).await {
        tracing::warn!("Detect output closed, finding lost");
        return false;
    }
    true
}
