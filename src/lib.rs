//! # a3s-watch
//!
//! Host runtime security monitoring for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-watch` consumes a stream of system trace records, enriches each with
//! process and container identity, and evaluates them against pluggable
//! detection rules ("signatures"). Matches come out as finding events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_watch::{Decoder, Pipeline, ProcFs, WatchConfig};
//! use a3s_watch::containers::{Containers, StaticRuntime};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_watch::Result<()> {
//! let config = WatchConfig::default();
//! let containers = Arc::new(Containers::new(Arc::new(StaticRuntime::default()), "/proc"));
//! let decoder = Decoder::discover(&config.decode, containers, Arc::new(ProcFs::default())).await;
//!
//! let mut pipeline = Pipeline::new(config, decoder).signatures(a3s_watch::signatures::builtin());
//! let (records_tx, records_rx) = mpsc::channel(1024);
//! let (events_tx, mut events_rx) = mpsc::channel(1024);
//! let handle = pipeline.start(records_rx, events_tx, CancellationToken::new()).await?;
//!
//! drop(records_tx);
//! while let Some(finding) = events_rx.recv().await {
//!     println!("{}: {}", finding.event_name, finding.message);
//! }
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Signature** trait — detection rule contract (metadata, selectors, init, on_event)
//! - **Engine** — signature registry, selector index and per-signature channels
//! - **Pipeline** — Decode → Process → Detect → Sink stages over bounded channels
//! - **DataSource** trait — namespaced side lookups available to signatures
//! - **Enricher** trait — pid → container/pod identity

pub mod config;
pub mod containers;
pub mod datasource;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod selector;
pub mod signature;
pub mod signatures;
pub mod types;

// Re-export core types
pub use config::{DispatchPolicy, EngineConfig, WatchConfig};
pub use containers::{ContainerMetadata, ContainersDataSource, Enricher};
pub use datasource::DataSource;
pub use engine::{Engine, EngineBuilder, EngineState, SignatureHandle};
pub use error::{Result, WatchError};
pub use pipeline::{Decoder, Pipeline, PipelineHandle};
pub use process::{ProcFs, ProcessInspector};
pub use selector::{Envelope, Selector, TRACE_SOURCE};
pub use signature::{Finding, Signal, Signature, SignatureContext, SignatureMetadata};
pub use types::{Event, EventKind, EventOrigin, RawRecord};
