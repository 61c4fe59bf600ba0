//! Process stage: per event-id handler chains

use super::{forward, StageOptions};
use crate::error::Result;
use crate::types::Event;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mutates or validates an event in place
pub type Handler = Box<dyn Fn(&mut Event) -> Result<()> + Send + Sync>;

/// event id → handlers in registration order
#[derive(Default)]
pub struct ProcessorTable {
    handlers: HashMap<u16, Vec<Handler>>,
}

impl ProcessorTable {
    pub fn register(&mut self, event_id: u16, handler: Handler) {
        self.handlers.entry(event_id).or_default().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler for the event; false when any of them failed
    ///
    /// All handlers run even after a failure so each error gets logged.
    pub fn process(&self, event: &mut Event) -> bool {
        let Some(handlers) = self.handlers.get(&event.event_id) else {
            return true;
        };
        let mut ok = true;
        for handler in handlers {
            if let Err(e) = handler(&mut *event) {
                tracing::error!(
                    event = %event.event_name,
                    event_id = event.event_id,
                    error = %e,
                    "Error processing event"
                );
                ok = false;
            }
        }
        ok
    }
}

pub async fn run(
    table: ProcessorTable,
    mut input: mpsc::Receiver<Event>,
    output: mpsc::Sender<Event>,
    cancel: CancellationToken,
    opts: StageOptions,
) {
    let mut failed = 0u64;
    // Upstream closes its output once drained, so read to the end
    while let Some(mut event) = input.recv().await {
        if !table.process(&mut event) {
            failed += 1;
            continue;
        }
        if !forward(&output, event, &cancel, opts).await {
            tracing::warn!("Process output closed");
            break;
        }
    }
    tracing::debug!(failed, "Process stage stopped");
}
