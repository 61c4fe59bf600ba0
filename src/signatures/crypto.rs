use super::metadata;
use crate::error::Result;
use crate::selector::{Envelope, Selector, TRACE_SOURCE};
use crate::signature::{ContextSlot, Finding, Signature, SignatureContext, SignatureMetadata};
use async_trait::async_trait;

/// URL schemes of the Stratum mining protocol
const STRATUM_SCHEMES: [&str; 4] = ["stratum+tcp", "stratum2+tcp", "stratum+ssl", "stratum2+ssl"];

/// Flags processes whose command line points at a Stratum mining pool
#[derive(Default)]
pub struct CryptoMiner {
    ctx: ContextSlot,
}

#[async_trait]
impl Signature for CryptoMiner {
    fn metadata(&self) -> Result<SignatureMetadata> {
        Ok(metadata(
            "WATCH-3",
            "Crypto Mining",
            "crypto_mining",
            "A crypto miner using the Stratum protocol is found.",
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
        let cmdline = &event.event().cmdline;
        if cmdline.is_empty() {
            return Ok(());
        }
        let Some(scheme) = STRATUM_SCHEMES.iter().find(|s| cmdline.contains(*s)) else {
            return Ok(());
        };

        let message = format!("crypto miners using the Stratum protocol detected: {}", cmdline);
        let finding = Finding::new(event.clone(), self.metadata()?, message).with_data("scheme", *scheme);
        self.ctx.emit(finding).await
    }
}
