use super::metadata;
use crate::error::Result;
use crate::selector::{Envelope, Selector, TRACE_SOURCE};
use crate::signature::{ContextSlot, Finding, Signature, SignatureContext, SignatureMetadata};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

/// File I/O operation code and task of a file-create record
const OPCODE_INFO: u8 = 0;
const TASK_FILE_CREATE: u16 = 30;

/// Flags executables written inside a container
#[derive(Default)]
pub struct DroppedExecutable {
    ctx: ContextSlot,
}

/// PE (`MZ`) or ELF header
fn is_executable(header: &[u8]) -> bool {
    header.starts_with(b"MZ") || header.starts_with(b"\x7fELF")
}

async fn read_header(path: &str) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(header[..filled].to_vec())
}

#[async_trait]
impl Signature for DroppedExecutable {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(metadata(
            "WATCH-1",
            "New executable dropped in a container",
            "dropped_exe_container",
            "A new executable file is created in a container. This is normal in the early stages of container creation.",
            0,
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
        if payload.is_host || payload.container_id.is_empty() {
            return Ok(());
        }
        let Some(raw) = payload.raw.as_ref() else {
            return Ok(());
        };
        if raw.opcode != OPCODE_INFO || raw.task != TASK_FILE_CREATE {
            return Ok(());
        }
        let file_name = match raw.data_str("FileName") {
            Some(name) if !name.is_empty() => name,
            _ => return Ok(()),
        };

        // Files vanish or are locked all the time; not worth reporting
        let Ok(header) = read_header(file_name).await else {
            return Ok(());
        };
        if !is_executable(&header) {
            return Ok(());
        }

        let message = format!(
            "New Executable Dropped in container detected: FileName={}",
            file_name
        );
        let finding = Finding::new(event.clone(), self.metadata()?, message).with_data("fileName", file_name);
        self.ctx.emit(finding).await
    }
}
