//! Built-in logic signatures
//!
//! Each signature subscribes to every trace event and filters in
//! `on_event`; matches are reported through the init context callback.

mod crypto;
mod dropper;
mod ppid;
mod tor;

pub use crypto::CryptoMiner;
pub use dropper::DroppedExecutable;
pub use ppid::PpidSpoofing;
pub use tor::TorExecutable;

use crate::signature::{Signature, SignatureMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Process-start operation code on trace records
pub(crate) const OPCODE_PROCESS_START: u8 = 1;

/// All built-in signatures, freshly constructed
pub fn builtin() -> Vec<Arc<dyn Signature>> {
    vec![
        Arc::new(DroppedExecutable::default()),
        Arc::new(PpidSpoofing::default()),
        Arc::new(CryptoMiner::default()),
        Arc::new(TorExecutable::default()),
    ]
}

fn metadata(
    id: &str,
    name: &str,
    event_name: &str,
    description: &str,
    severity: u8,
) -> SignatureMetadata {
    SignatureMetadata {
        id: id.to_string(),
        version: "1".to_string(),
        name: name.to_string(),
        event_name: event_name.to_string(),
        description: description.to_string(),
        tags: Vec::new(),
        properties: HashMap::from([("Severity".to_string(), severity.into())]),
    }
}
