//! Selector routing — which signatures want which events
//!
//! Every event handed to the engine carries a `Selector` header
//! `(source, name, origin)`. Signatures declare the selectors they are
//! interested in; `name` and `origin` may be the wildcard `*`, `source`
//! must always be concrete.

use crate::types::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Wildcard for the name axis
pub const ALL_EVENT_TYPES: &str = "*";

/// Wildcard for the origin axis
pub const ALL_EVENT_ORIGINS: &str = "*";

/// Source name of events produced by the trace pipeline
pub const TRACE_SOURCE: &str = "trace";

/// Routing header used for filtering event subscriptions in the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Producer of the event (e.g. "trace")
    pub source: String,

    /// Name of the event payload; empty or `*` matches all at registration
    #[serde(default)]
    pub name: String,

    /// Where the event was generated (host, container, container-init)
    #[serde(default)]
    pub origin: String,
}

impl Selector {
    pub fn new(
        source: impl Into<String>,
        name: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            origin: origin.into(),
        }
    }

    /// Selector matching every event of a source
    pub fn all(source: impl Into<String>) -> Self {
        Self::new(source, ALL_EVENT_TYPES, ALL_EVENT_ORIGINS)
    }

    /// Replace empty name/origin with the wildcard
    pub fn normalized(mut self) -> Self {
        if self.name.is_empty() {
            self.name = ALL_EVENT_TYPES.to_string();
        }
        if self.origin.is_empty() {
            self.origin = ALL_EVENT_ORIGINS.to_string();
        }
        self
    }

    /// The four index keys an event with this selector is delivered under,
    /// most specific first.
    pub fn lookup_keys(&self) -> [Selector; 4] {
        [
            self.clone(),
            Selector::new(&self.source, &self.name, ALL_EVENT_ORIGINS),
            Selector::new(&self.source, ALL_EVENT_TYPES, &self.origin),
            Selector::new(&self.source, ALL_EVENT_TYPES, ALL_EVENT_ORIGINS),
        ]
    }
}

/// Engine-facing wrapper: routing header plus the event payload
///
/// Cloning is cheap; the payload is shared between every signature the
/// envelope is dispatched to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub selector: Selector,
    pub payload: Arc<Event>,
}

impl Envelope {
    pub fn new(selector: Selector, payload: Event) -> Self {
        Self {
            selector,
            payload: Arc::new(payload),
        }
    }

    pub fn event(&self) -> &Event {
        &self.payload
    }
}

/// Selector → subscriber index
///
/// An entry registered under several buckets that all match one event
/// receives that event once per bucket. No de-duplication happens here.
#[derive(Debug)]
pub struct SelectorIndex<K> {
    entries: HashMap<Selector, Vec<K>>,
}

impl<K> Default for SelectorIndex<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq> SelectorIndex<K> {
    /// Append `key` under an already normalized selector
    pub fn insert(&mut self, selector: Selector, key: K) {
        self.entries.entry(selector).or_default().push(key);
    }

    /// Every subscriber for an event selector, bucket by bucket, duplicates kept
    pub fn matches(&self, selector: &Selector) -> Vec<K> {
        selector
            .lookup_keys()
            .iter()
            .filter_map(|key| self.entries.get(key))
            .flat_map(|subscribers| subscribers.iter().copied())
            .collect()
    }

    /// Drop one subscriber from every bucket
    pub fn remove(&mut self, key: K) {
        self.entries.retain(|_, subscribers| {
            subscribers.retain(|k| *k != key);
            !subscribers.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct selector buckets
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
