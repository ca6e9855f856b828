//! # Capabilities
//!
//! The external collaborators the launcher drives. The launcher only sees
//! these traits; hosts decide how bytes are fetched, sized, cached, linked
//! and activated.
//!
//! Every call is a suspension point. Timeouts are the implementation's job:
//! a capability that gives up reports a `CapabilityError`.

pub mod environment;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::CapabilityError;

pub use environment::{Environment, StaticEnvironment};

/// Result of fetching a catalog manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogManifest {
    pub locator_id: String,
    pub asset_keys: Vec<String>,
}

#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn fetch_catalog(
        &self,
        key: &str,
        resolved_url: &str,
    ) -> Result<CatalogManifest, CapabilityError>;
}

#[async_trait]
pub trait SizeEstimator: Send + Sync {
    /// Bytes that still have to be downloaded for `label`
    async fn estimate_download_size(&self, label: &str) -> Result<u64, CapabilityError>;
}

#[async_trait]
pub trait AssetPreloader: Send + Sync {
    async fn preload_assets(&self, label: &str) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn fetch_module_bytes(&self, module: &str) -> Result<Vec<u8>, CapabilityError>;

    /// Link fetched module bytes into the running process.
    ///
    /// A panic here is caught by the launcher and recorded as a load failure.
    fn load_module(&self, module: &str, bytes: &[u8]) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait EntryActivator: Send + Sync {
    async fn activate_entry(&self, entry: &str) -> Result<(), CapabilityError>;
}

/// Everything a launcher needs from its host
#[derive(Clone)]
pub struct Capabilities {
    pub catalogs: Arc<dyn CatalogFetcher>,
    pub sizes: Arc<dyn SizeEstimator>,
    pub preloader: Arc<dyn AssetPreloader>,
    pub modules: Arc<dyn ModuleLoader>,
    pub entry: Arc<dyn EntryActivator>,
    pub environment: Arc<dyn Environment>,
}

impl Capabilities {
    /// Use one host object for every capability
    pub fn from_host<H>(host: Arc<H>, environment: Arc<dyn Environment>) -> Self
    where
        H: CatalogFetcher + SizeEstimator + AssetPreloader + ModuleLoader + EntryActivator + 'static,
    {
        Self {
            catalogs: host.clone(),
            sizes: host.clone(),
            preloader: host.clone(),
            modules: host.clone(),
            entry: host,
            environment,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("build_target", &self.environment.build_target())
            .field("version", &self.environment.version())
            .finish_non_exhaustive()
    }
}
