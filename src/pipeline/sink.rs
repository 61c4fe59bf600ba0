//! Sink stage: last filter before the output boundary

use super::{forward, StageOptions};
use crate::types::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// With detection enabled only findings pass; otherwise everything does
pub fn passes(detection: bool, event: &Event) -> bool {
    !detection || event.is_finding()
}

pub async fn run(
    detection: bool,
    mut input: mpsc::Receiver<Event>,
    output: mpsc::Sender<Event>,
    cancel: CancellationToken,
    opts: StageOptions,
) {
    let mut forwarded = 0u64;
    while let Some(event) = input.recv().await {
        if !passes(detection, &event) {
            continue;
        }
        if !forward(&output, event, &cancel, opts).await {
            tracing::warn!("Output boundary closed or stalled, sink stopping");
            break;
        }
        forwarded += 1;
    }
    tracing::debug!(forwarded, "Sink stage stopped");
}
