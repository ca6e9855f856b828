//! # Catalog State Table
//!
//! Catalog identity -> `CatalogState` for the current run, plus the run's
//! non-fatal diagnostics. Cleared wholesale at the start of every run.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CatalogDescriptor;
use crate::error::LauncherError;

use super::catalog_state::{CatalogPhase, CatalogState};

/// Non-fatal finding recorded during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A catalog key was registered twice; the first registration was kept
    Conflict { key: String },
    /// An optional catalog did not reach a phase's success status
    OptionalCatalogFailed { key: String, phase: CatalogPhase },
    /// An optional module failed; the catalog's status is unaffected
    OptionalModuleFailed {
        catalog: String,
        module: String,
        reason: String,
    },
}

/// The per-run catalog table
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStates {
    entries: HashMap<String, CatalogState>,
    order: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl CatalogStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the state for a catalog about to load.
    ///
    /// A second registration of the same key is a conflict: the existing
    /// entry is left untouched and a `Conflict` diagnostic is recorded.
    pub fn register(
        &mut self,
        descriptor: Arc<CatalogDescriptor>,
        is_optional: bool,
    ) -> Result<&mut CatalogState, LauncherError> {
        if let Some(existing) = self.entries.get(&descriptor.key) {
            let err = LauncherError::Conflict {
                key: descriptor.key.clone(),
                existing_url: existing.descriptor.url.clone(),
            };
            self.diagnostics.push(Diagnostic::Conflict {
                key: descriptor.key.clone(),
            });
            return Err(err);
        }

        let key = descriptor.key.clone();
        self.order.push(key.clone());
        Ok(self
            .entries
            .entry(key)
            .or_insert_with(|| CatalogState::new(descriptor, is_optional)))
    }

    pub fn get(&self, key: &str) -> Option<&CatalogState> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CatalogState> {
        self.entries.get_mut(key)
    }

    /// Registered keys, in registration order
    pub fn keys(&self) -> Vec<String> {
        self.order.clone()
    }

    /// States in registration order
    pub fn iter(&self) -> impl Iterator<Item = &CatalogState> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }

    /// States that did not reach `phase`'s success status
    pub fn unsuccessful(&self, phase: CatalogPhase) -> impl Iterator<Item = &CatalogState> {
        self.iter().filter(move |state| !state.has_succeeded(phase))
    }

    /// Whether every mandatory catalog reached `phase`'s success status
    pub fn mandatory_succeeded(&self, phase: CatalogPhase) -> bool {
        self.unsuccessful(phase).all(|state| state.is_optional)
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and diagnostic
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.diagnostics.clear();
    }
}
