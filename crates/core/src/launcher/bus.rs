//! # Launcher Bus
//!
//! Synchronous publish/subscribe for phase-transition messages.
//!
//! `publish()` runs every handler registered for the message, in
//! registration order, on the caller's thread. A handler that publishes runs
//! the nested message's handlers to completion before returning. Catch-all
//! handlers are ordinary handlers registered against every message kind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Phase-transition messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Msg {
    Init,
    CatalogsLoading,
    CatalogsLoaded,
    CatalogsLoadFailed,
    SizeCalculating,
    SizeCalculated,
    SizeCalculateFailed,
    AssetsPreloading,
    AssetsPreloaded,
    AssetsPreloadFailed,
    ModulesLoading,
    ModulesLoaded,
    ModulesLoadFailed,
    EntryLoading,
    EntryLoaded,
    EntryLoadFailed,
    Relaunch,
}

impl Msg {
    pub const ALL: [Msg; 17] = [
        Msg::Init,
        Msg::CatalogsLoading,
        Msg::CatalogsLoaded,
        Msg::CatalogsLoadFailed,
        Msg::SizeCalculating,
        Msg::SizeCalculated,
        Msg::SizeCalculateFailed,
        Msg::AssetsPreloading,
        Msg::AssetsPreloaded,
        Msg::AssetsPreloadFailed,
        Msg::ModulesLoading,
        Msg::ModulesLoaded,
        Msg::ModulesLoadFailed,
        Msg::EntryLoading,
        Msg::EntryLoaded,
        Msg::EntryLoadFailed,
        Msg::Relaunch,
    ];

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Msg::CatalogsLoadFailed
                | Msg::SizeCalculateFailed
                | Msg::AssetsPreloadFailed
                | Msg::ModulesLoadFailed
                | Msg::EntryLoadFailed
        )
    }
}

/// Bus message handler
pub type Handler = Arc<dyn Fn(&MessageBus, Msg) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<Msg, Vec<Handler>>>,
    debug: AtomicBool,
}

/// Launcher message bus. Clones share the same dispatch table.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that logs every publish and subscribe
    pub fn with_debug(debug: bool) -> Self {
        let bus = Self::new();
        bus.set_debug(debug);
        bus
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    /// Register `handler` for one message kind
    pub fn subscribe<F>(&self, msg: Msg, handler: F)
    where
        F: Fn(&MessageBus, Msg) + Send + Sync + 'static,
    {
        self.add(&[msg], Arc::new(handler));
    }

    /// Register `handler` for every message kind
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&MessageBus, Msg) + Send + Sync + 'static,
    {
        self.add(&Msg::ALL, Arc::new(handler));
    }

    fn add(&self, msgs: &[Msg], handler: Handler) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for msg in msgs {
            let subs = handlers.entry(*msg).or_default();
            subs.push(handler.clone());
            if self.is_debug() {
                tracing::debug!(?msg, subscribers = subs.len(), "bus subscribe");
            }
        }
    }

    /// Run every handler registered for `msg`
    pub fn publish(&self, msg: Msg) {
        // Snapshot so handlers can subscribe or publish without holding the lock
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msg)
            .cloned()
            .unwrap_or_default();

        if self.is_debug() {
            tracing::debug!(?msg, subscribers = handlers.len(), "bus publish");
        }

        for handler in handlers {
            handler(self, msg);
        }
    }

    pub fn subscriber_count(&self, msg: Msg) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msg)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("debug", &self.is_debug())
            .finish_non_exhaustive()
    }
}
