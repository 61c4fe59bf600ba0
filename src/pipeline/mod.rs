//! Event pipeline: Decode → Process → Detect → Sink
//!
//! Every stage is an independent task reading one bounded channel and
//! writing the next. A stage closes its output exactly once, by returning
//! and dropping its sender.
//!
//! Shutdown: on cancellation the head stage drains what is already
//! buffered on its input and exits; downstream stages keep reading until
//! their input closes, so in-flight events still reach detection. Sends
//! made after cancellation are bounded by the drain timeout.

pub mod decode;
pub mod detect;
pub mod processor;
pub mod sink;

pub use decode::Decoder;
pub use processor::{Handler, ProcessorTable};

use crate::config::WatchConfig;
use crate::datasource::DataSource;
use crate::error::{Result, WatchError};
use crate::signature::Signature;
use crate::types::{Event, RawRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Channel settings shared by every stage
#[derive(Debug, Clone, Copy)]
pub struct StageOptions {
    /// Capacity of the channel a stage creates for its output
    pub buffer: usize,
    /// Upper bound for a single send after cancellation
    pub drain_timeout: Duration,
}

impl StageOptions {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            buffer: config.pipeline.stage_buffer_size.max(1),
            drain_timeout: config.engine.drain_timeout(),
        }
    }
}

/// Send `item` downstream
///
/// Before cancellation the send waits for room but gives way to the
/// cancellation signal; after it, the send waits at most the drain
/// timeout. Returns false when the item could not be delivered.
pub(crate) async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
    opts: StageOptions,
) -> bool {
    if !cancel.is_cancelled() {
        tokio::select! {
            biased;
            permit = tx.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(item);
                        true
                    }
                    Err(_) => false,
                };
            }
            _ = cancel.cancelled() => {}
        }
    }
    tx.send_timeout(item, opts.drain_timeout).await.is_ok()
}

/// Wires the stages together
pub struct Pipeline {
    config: WatchConfig,
    decoder: Option<Decoder>,
    processors: Option<ProcessorTable>,
    signatures: Vec<Arc<dyn Signature>>,
    data_sources: Vec<Arc<dyn DataSource>>,
}

impl Pipeline {
    pub fn new(config: WatchConfig, decoder: Decoder) -> Self {
        Self {
            config,
            decoder: Some(decoder),
            processors: Some(ProcessorTable::default()),
            signatures: Vec::new(),
            data_sources: Vec::new(),
        }
    }

    /// Signatures loaded into the engine when detection is enabled
    pub fn signatures(mut self, signatures: impl IntoIterator<Item = Arc<dyn Signature>>) -> Self {
        self.signatures.extend(signatures);
        self
    }

    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_sources.push(source);
        self
    }

    /// Register a Process stage handler for an event id
    ///
    /// Handlers run in registration order. Fails with `NotInitialized`
    /// once the pipeline started and handed its table to the stage.
    pub fn register_processor<F>(&mut self, event_id: u16, handler: F) -> Result<()>
    where
        F: Fn(&mut Event) -> Result<()> + Send + Sync + 'static,
    {
        let table = self.processors.as_mut().ok_or_else(|| {
            WatchError::NotInitialized("processor table already handed to the running pipeline".to_string())
        })?;
        table.register(event_id, Box::new(handler));
        Ok(())
    }

    /// Spawn every stage
    ///
    /// Raw records are read from `input` and the pipeline's events written
    /// to `output`. A pipeline starts once.
    pub async fn start(
        &mut self,
        input: mpsc::Receiver<RawRecord>,
        output: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<PipelineHandle> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| WatchError::InvalidState("pipeline already started".to_string()))?;
        let processors = self.processors.take().unwrap_or_default();
        let opts = StageOptions::from_config(&self.config);
        let detection = self.config.engine.enabled;

        let mut tasks = Vec::new();

        let (decoded_tx, decoded_rx) = mpsc::channel(opts.buffer);
        tasks.push(tokio::spawn(decode::run(
            decoder,
            input,
            decoded_tx,
            cancel.clone(),
            opts,
        )));

        let (processed_tx, processed_rx) = mpsc::channel(opts.buffer);
        tasks.push(tokio::spawn(processor::run(
            processors,
            decoded_rx,
            processed_tx,
            cancel.clone(),
            opts,
        )));

        let sink_input = if detection {
            let (detected_tx, detected_rx) = mpsc::channel(opts.buffer);
            let stage = detect::DetectStage::start(
                self.config.engine.clone(),
                std::mem::take(&mut self.signatures),
                std::mem::take(&mut self.data_sources),
                processed_rx,
                detected_tx,
                cancel.clone(),
                opts,
            )
            .await?;
            tasks.extend(stage.into_tasks());
            detected_rx
        } else {
            processed_rx
        };

        tasks.push(tokio::spawn(sink::run(detection, sink_input, output, cancel, opts)));

        tracing::info!(stages = tasks.len(), detection, "Pipeline started");
        Ok(PipelineHandle { tasks })
    }
}

/// Join handle over every pipeline task
pub struct PipelineHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for every stage to finish
    pub async fn wait(self) {
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline task failed");
            }
        }
        tracing::info!("Pipeline stopped");
    }
}
