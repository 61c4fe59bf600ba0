use super::{metadata, OPCODE_PROCESS_START};
use crate::error::Result;
use crate::selector::{Envelope, Selector, TRACE_SOURCE};
use crate::signature::{ContextSlot, Finding, Signature, SignatureContext, SignatureMetadata};
use async_trait::async_trait;

/// Flags process starts whose reported parent is not the process that
/// actually created them
#[derive(Default)]
pub struct PpidSpoofing {
    ctx: ContextSlot,
}

#[async_trait]
impl Signature for PpidSpoofing {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(metadata(
            "WATCH-2",
            "PPID Spoofing",
            "ppid_spoofing",
            "An attacker can tamper with the parent process to hide the true parent-child relationship and evade detection.",
            3,
        ))
    }

    fn selected_events(&self) -> Result<Vec<Selector>> {
        Ok(vec![Selector::all(TRACE_SOURCE)])
    }

    fn init(&self, ctx: SignatureContext) -> Result<()> {
        self.ctx.set(ctx)
    }

    async fn on_event(&self, event: &Envelope) -> Result<()> {
        let payload = event.event();
        let Some(raw) = payload.raw.as_ref() else {
            return Ok(());
        };
        if raw.opcode != OPCODE_PROCESS_START {
            return Ok(());
        }
        let Some(reported) = raw.data_u32("ParentProcessID") else {
            return Ok(());
        };
        // The record header carries the creating process
        let creator = raw.process_id.unwrap_or(payload.process_id);
        if reported == creator {
            return Ok(());
        }

        let child = raw
            .data_u32("ProcessID")
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "?".to_string());
        let message = format!(
            "PPID Spoofing detected: PID={} process started by PPID={} rather than PPID={}",
            child, creator, reported
        );
        let finding = Finding::new(event.clone(), self.metadata()?, message)
            .with_data("creator", creator)
            .with_data("reportedParent", reported);
        self.ctx.emit(finding).await
    }
}
