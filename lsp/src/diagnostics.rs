//! Diagnostics fan-in: every session publishes here, callers subscribe.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lsp_types::{Diagnostic, Uri};
use tokio::sync::broadcast;

use crate::types::{DiagnosticsEvent, DiagnosticsSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Latest diagnostics per document.
#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<Uri, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    /// An empty list clears the document.
    pub fn update(&mut self, uri: Uri, diagnostics: Vec<Diagnostic>) {
        if diagnostics.is_empty() {
            self.data.remove(&uri);
        } else {
            self.data.insert(uri, diagnostics);
        }
    }

    pub fn get(&self, uri: &Uri) -> Vec<Diagnostic> {
        self.data.get(uri).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot::new(
            self.data
                .iter()
                .map(|(uri, items)| (uri.clone(), items.clone()))
                .collect(),
        )
    }
}

/// Shared by all sessions of one manager.
#[derive(Debug)]
pub struct DiagnosticsHub {
    store: Mutex<DiagnosticsStore>,
    events: broadcast::Sender<DiagnosticsEvent>,
}

impl Default for DiagnosticsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsHub {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Mutex::new(DiagnosticsStore::default()),
            events,
        }
    }

    fn store(&self) -> MutexGuard<'_, DiagnosticsStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticsEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: DiagnosticsEvent) {
        tracing::debug!(
            uri = event.uri.as_str(),
            count = event.diagnostics.len(),
            "Diagnostics updated"
        );
        self.store()
            .update(event.uri.clone(), event.diagnostics.clone());
        // No subscribers is fine; the store still has the data.
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.store().snapshot()
    }

    #[must_use]
    pub fn diagnostics_for(&self, uri: &Uri) -> Vec<Diagnostic> {
        self.store().get(uri)
    }
}
