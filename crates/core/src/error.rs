//! # Launcher Errors
//!
//! Library error types. Capability failures are data (they are stored on the
//! owning `CatalogState`), launcher errors are returned to callers.

use serde::Serialize;
use thiserror::Error;

use crate::state::{CatalogPhase, CatalogStatus};

/// External capability that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchCatalog,
    EstimateDownloadSize,
    PreloadAssets,
    FetchModuleBytes,
    LoadModule,
    ActivateEntry,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchCatalog => "fetch_catalog",
            Self::EstimateDownloadSize => "estimate_download_size",
            Self::PreloadAssets => "preload_assets",
            Self::FetchModuleBytes => "fetch_module_bytes",
            Self::LoadModule => "load_module",
            Self::ActivateEntry => "activate_entry",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure cause reported by (or on behalf of) an external capability
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    /// The capability ran and reported failure
    #[error("{capability} failed: {reason}")]
    Failed {
        capability: Capability,
        reason: String,
    },

    /// Module bytes were fetched but linking them failed (or panicked)
    #[error("module '{module}' failed to load: {reason}")]
    ModuleLoad { module: String, reason: String },
}

impl CapabilityError {
    pub fn failed(capability: Capability, reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            capability,
            reason: reason.to_string(),
        }
    }

    pub fn module_load(module: &str, reason: impl std::fmt::Display) -> Self {
        Self::ModuleLoad {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the launcher itself
#[derive(Debug, Error)]
pub enum LauncherError {
    /// A catalog identity was registered twice within one run
    #[error("catalog conflicted: '{key}' is already registered ({existing_url})")]
    Conflict { key: String, existing_url: String },

    /// A catalog was asked to move against the phase order
    #[error("catalog '{key}' cannot enter {to:?} from {from:?}")]
    InvalidTransition {
        key: String,
        from: CatalogStatus,
        to: CatalogPhase,
    },

    /// Configuration failed validation
    #[error("invalid launcher config: {0}")]
    Config(String),
}
