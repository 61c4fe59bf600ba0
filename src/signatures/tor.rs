use super::{metadata, OPCODE_PROCESS_START};
use crate::error::Result;
use crate::selector::{Envelope, Selector, TRACE_SOURCE};
use crate::signature::{ContextSlot, Finding, Signature, SignatureContext, SignatureMetadata};
use async_trait::async_trait;
use std::path::Path;

/// Flags process starts of the Tor client
#[derive(Default)]
pub struct TorExecutable {
    ctx: ContextSlot,
}

fn is_tor(process: &str) -> bool {
    Path::new(process)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.eq_ignore_ascii_case("tor") || name.eq_ignore_ascii_case("tor.exe"))
        .unwrap_or(false)
}

#[async_trait]
impl Signature for TorExecutable {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(metadata(
            "WATCH-4",
            "Tor Executable",
            "tor_executable",
            "The Tor client was started; it can hide command and control traffic.",
            4,
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
        match payload.raw.as_ref() {
            Some(raw) if raw.opcode == OPCODE_PROCESS_START => {}
            _ => return Ok(()),
        }
        if payload.process_name.is_empty() || !is_tor(&payload.process_name) {
            return Ok(());
        }

        let message = format!("tor executable detected: {}", payload.process_name);
        let finding = Finding::new(event.clone(), self.metadata()?, message);
        self.ctx.emit(finding).await
    }
}
