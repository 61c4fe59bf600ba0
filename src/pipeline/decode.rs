//! Decode stage: raw trace records to enriched events

use super::{forward, StageOptions};
use crate::config::DecodeConfig;
use crate::containers::Enricher;
use crate::process::ProcessInspector;
use crate::types::{Event, RawRecord};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pids whose records never leave the decode stage: the idle and system
/// processes
const ALWAYS_EXCLUDED: [u32; 2] = [0, 4];

/// Turns raw records into normalized events
///
/// Records from excluded processes are dropped. Container and process
/// lookups are best effort: a failed lookup leaves its fields empty.
pub struct Decoder {
    enricher: Arc<dyn Enricher>,
    inspector: Arc<dyn ProcessInspector>,
    excluded: HashSet<u32>,
    runtime_container_id: String,
}

impl Decoder {
    /// Decoder excluding this process and pids 0 and 4
    pub fn new(enricher: Arc<dyn Enricher>, inspector: Arc<dyn ProcessInspector>) -> Self {
        let mut excluded: HashSet<u32> = ALWAYS_EXCLUDED.into_iter().collect();
        excluded.insert(std::process::id());
        Self {
            enricher,
            inspector,
            excluded,
            runtime_container_id: String::new(),
        }
    }

    /// Resolve the deny set from the configured process names
    ///
    /// The first configured name is the container runtime; its container
    /// id (empty when it runs on the host itself) marks host events.
    pub async fn discover(
        config: &DecodeConfig,
        enricher: Arc<dyn Enricher>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let mut decoder = Self::new(enricher, inspector);

        for (position, name) in config.exclude_process_names.iter().enumerate() {
            let pids = decoder.inspector.find_by_name(name);
            if pids.is_empty() {
                tracing::debug!(process = %name, "Excluded process not running");
                continue;
            }
            if position == 0 {
                if let Ok(meta) = decoder.enricher.enrich(pids[0]).await {
                    decoder.runtime_container_id = meta.container_id;
                }
            }
            tracing::info!(process = %name, pids = ?pids, "Excluding process from decoding");
            decoder.excluded.extend(pids);
        }
        decoder.excluded.extend(config.extra_excluded_pids.iter().copied());
        decoder
    }

    pub fn exclude_pid(mut self, pid: u32) -> Self {
        self.excluded.insert(pid);
        self
    }

    pub fn runtime_container_id(mut self, id: impl Into<String>) -> Self {
        self.runtime_container_id = id.into();
        self
    }

    pub fn is_excluded(&self, pid: u32) -> bool {
        self.excluded.contains(&pid)
    }

    /// Decode one record; `None` when it is dropped
    ///
    /// The deny set applies to the `ProcessID` data field, so children
    /// started by an excluded process still pass. Enrichment and inspection
    /// use the header process id.
    pub async fn decode(&self, record: RawRecord) -> Option<Event> {
        let Some(subject) = record.subject_pid() else {
            tracing::trace!(event = %record.event_name, "Record without process id dropped");
            return None;
        };
        if self.is_excluded(subject) {
            return None;
        }
        let pid = record.process_id.unwrap_or(subject);

        let mut event = Event::new(record.event_name.clone());
        event.timestamp = record.timestamp;
        event.process_id = pid;
        event.thread_id = record.tid().unwrap_or(0);
        event.host_name = record.host_name.clone();
        event.event_id = record.event_id;

        match self.enricher.enrich(pid).await {
            Ok(meta) => {
                event.container_id = meta.container_id.clone();
                event.container.id = meta.container_id;
                event.container.name = meta.name;
                event.container.image = meta.image;
                event.container.image_digest = meta.image_digest;
                event.kubernetes.pod_name = meta.pod.name;
                event.kubernetes.pod_namespace = meta.pod.namespace;
                event.kubernetes.pod_uid = meta.pod.uid;
                event.kubernetes.pod_sandbox = meta.pod.sandbox;
                // Listed by the runtime and not a pod sandbox: the entrypoint is up
                event.context_flags.container_started =
                    !event.container.name.is_empty() && !event.kubernetes.pod_sandbox;
            }
            Err(e) => {
                tracing::trace!(pid, error = %e, "Enrichment failed");
            }
        }
        event.is_host = event.container_id == self.runtime_container_id;

        if let Ok(name) = self.inspector.name(pid) {
            event.process_name = name;
        }
        if let Ok(ppid) = self.inspector.parent(pid) {
            event.parent_process_id = ppid;
        }
        if let Ok(cmdline) = self.inspector.cmdline(pid) {
            event.cmdline = cmdline;
        }

        event.raw = Some(record);
        Some(event)
    }
}

/// Head stage: on cancellation it decodes what is already buffered and stops
pub async fn run(
    decoder: Decoder,
    mut input: mpsc::Receiver<RawRecord>,
    output: mpsc::Sender<Event>,
    cancel: CancellationToken,
    opts: StageOptions,
) {
    let mut decoded = 0u64;
    let mut dropped = 0u64;

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = input.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let Some(event) = decoder.decode(record).await else {
            dropped += 1;
            continue;
        };
        if !forward(&output, event, &cancel, opts).await {
            tracing::warn!("Decode output closed");
            return;
        }
        decoded += 1;
    }

    // Drain: records buffered before cancellation are still decoded
    while let Ok(record) = input.try_recv() {
        let Some(event) = decoder.decode(record).await else {
            dropped += 1;
            continue;
        };
        if !forward(&output, event, &cancel, opts).await {
            break;
        }
        decoded += 1;
    }

    tracing::debug!(decoded, dropped, "Decode stage stopped");
}
