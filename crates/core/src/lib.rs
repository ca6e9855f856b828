//! # Launcher Core
//!
//! Bootstraps an application by driving its content catalogs through a
//! fixed pipeline: fetch the catalog manifests, estimate their download
//! size, preload their payload, load the code modules they declare, and
//! finally activate the entry target.
//!
//! ## Architecture
//!
//! - `config` - Catalog descriptors, url templating, launcher config
//! - `state/` - Per-catalog state machine and the per-run state table
//! - `launcher/` - Message bus, phase sequencing, the orchestrator task
//! - `capabilities/` - Traits the host implements (fetch, size, preload, modules, entry)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use launcher_core::{Capabilities, Launcher, LauncherConfig, MessageBus};
//!
//! let config = LauncherConfig::load("launcher.json").await?;
//! let handle = Launcher::new(config, capabilities, MessageBus::new()).spawn();
//! let status = handle.launch_and_wait().await;
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod launcher;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use capabilities::{
    AssetPreloader, Capabilities, CatalogFetcher, CatalogManifest, EntryActivator, Environment,
    ModuleLoader, SizeEstimator, StaticEnvironment,
};
pub use config::{CatalogDescriptor, LauncherConfig};
pub use error::{Capability, CapabilityError, LauncherError};
pub use launcher::{EventLog, Launcher, LauncherEvent, LauncherHandle, MessageBus, Msg, Phase, RunStatus};
pub use state::{CatalogPhase, CatalogState, CatalogStates, CatalogStatus, Diagnostic};
