//! # Reference Host
//!
//! Capabilities backed by JSON catalog manifests, fetched over HTTP(S) or
//! read from the local filesystem (`file://` URLs and bare paths).
//!
//! A manifest looks like:
//!
//! ```json
//! {
//!   "locator_id": "core-1.0.0",
//!   "assets": [{ "key": "scenes/home", "url": "home.bin", "size": 2048, "labels": ["preload"] }],
//!   "modules": { "Game.Logic": "modules/game_logic.bin" }
//! }
//! ```
//!
//! Relative asset and module URLs resolve against the manifest's own location.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::fs;

use launcher_core::capabilities::{
    AssetPreloader, CatalogFetcher, CatalogManifest, EntryActivator, ModuleLoader, SizeEstimator,
};
use launcher_core::error::{Capability, CapabilityError};
use launcher_core::launcher::{MessageBus, Msg};

/// Catalog manifest document
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub locator_id: String,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    /// Module name -> payload URL
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetEntry {
    pub key: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Modules linked into this process
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, usize>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module payload; empty payloads and duplicate names are rejected
    pub fn register(&self, name: &str, bytes: &[u8]) -> Result<(), CapabilityError> {
        if bytes.is_empty() {
            return Err(CapabilityError::module_load(name, "empty module payload"));
        }
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules.contains_key(name) {
            return Err(CapabilityError::module_load(name, "module already loaded"));
        }
        modules.insert(name.to_string(), bytes.len());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A manifest together with the URL it was fetched from
#[derive(Debug, Clone)]
struct LoadedCatalog {
    url: String,
    manifest: Manifest,
}

/// An asset with its URL resolved
#[derive(Debug, Clone)]
struct PendingAsset {
    key: String,
    url: String,
    size: u64,
}

/// Reference implementation of every launcher capability
pub struct HostCapabilities {
    client: reqwest::Client,
    cache_dir: PathBuf,
    catalogs: RwLock<HashMap<String, LoadedCatalog>>,
    registry: ModuleRegistry,
}

impl HostCapabilities {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
            catalogs: RwLock::new(HashMap::new()),
            registry: ModuleRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Forget loaded catalogs and modules
    pub fn reset(&self) {
        self.catalogs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.registry.clear();
    }

    /// Reset host state whenever a new run starts on `bus`
    pub fn attach(self: &Arc<Self>, bus: &MessageBus) {
        let host = self.clone();
        bus.subscribe(Msg::Init, move |_, _| host.reset());
    }

    /// Cache location for an asset key
    pub fn cached_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                c => c,
            })
            .collect();
        self.cache_dir.join(name)
    }

    /// Download target for `key`; renamed onto `cached_path` once complete
    fn partial_path(&self, key: &str) -> PathBuf {
        let mut name = self.cached_path(key).into_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    /// Labelled assets across all loaded catalogs that are not cached yet
    fn pending_assets(&self, label: &str) -> Result<Vec<PendingAsset>, String> {
        let catalogs = self.catalogs.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        let mut labelled = 0usize;
        let mut pending = Vec::new();

        for catalog in catalogs.values() {
            for asset in &catalog.manifest.assets {
                if !asset.labels.iter().any(|l| l == label) {
                    continue;
                }
                labelled += 1;
                if !seen.insert(asset.key.clone()) || self.cached_path(&asset.key).exists() {
                    continue;
                }
                pending.push(PendingAsset {
                    key: asset.key.clone(),
                    url: resolve_relative(&catalog.url, &asset.url),
                    size: asset.size,
                });
            }
        }

        if labelled == 0 {
            return Err(format!("no assets labelled '{}'", label));
        }
        Ok(pending)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        match local_path(url) {
            Some(path) => fs::read(&path)
                .await
                .map_err(|e| format!("{}: {}", path.display(), e)),
            None => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| e.to_string())?;
                let bytes = response.bytes().await.map_err(|e| e.to_string())?;
                Ok(bytes.to_vec())
            }
        }
    }
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("cache_dir", &self.cache_dir)
            .field("modules", &self.registry.names())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CatalogFetcher for HostCapabilities {
    async fn fetch_catalog(
        &self,
        key: &str,
        resolved_url: &str,
    ) -> Result<CatalogManifest, CapabilityError> {
        let bytes = self
            .fetch_bytes(resolved_url)
            .await
            .map_err(|e| CapabilityError::failed(Capability::FetchCatalog, e))?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            CapabilityError::failed(
                Capability::FetchCatalog,
                format!("invalid manifest at {}: {}", resolved_url, e),
            )
        })?;

        let loaded = CatalogManifest {
            locator_id: manifest.locator_id.clone(),
            asset_keys: manifest.assets.iter().map(|a| a.key.clone()).collect(),
        };
        self.catalogs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                LoadedCatalog {
                    url: resolved_url.to_string(),
                    manifest,
                },
            );
        Ok(loaded)
    }
}

#[async_trait]
impl SizeEstimator for HostCapabilities {
    async fn estimate_download_size(&self, label: &str) -> Result<u64, CapabilityError> {
        let pending = self
            .pending_assets(label)
            .map_err(|e| CapabilityError::failed(Capability::EstimateDownloadSize, e))?;
        Ok(pending.iter().map(|asset| asset.size).sum())
    }
}

#[async_trait]
impl AssetPreloader for HostCapabilities {
    async fn preload_assets(&self, label: &str) -> Result<(), CapabilityError> {
        let fail = |e: String| CapabilityError::failed(Capability::PreloadAssets, e);

        let pending = self.pending_assets(label).map_err(fail)?;
        if pending.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| fail(format!("{}: {}", self.cache_dir.display(), e)))?;

        for asset in pending {
            let bytes = self.fetch_bytes(&asset.url).await.map_err(fail)?;
            let partial = self.partial_path(&asset.key);
            if let Err(e) = fs::write(&partial, &bytes).await {
                let _ = fs::remove_file(&partial).await;
                return Err(fail(format!("{}: {}", partial.display(), e)));
            }
            let path = self.cached_path(&asset.key);
            fs::rename(&partial, &path)
                .await
                .map_err(|e| fail(format!("{}: {}", path.display(), e)))?;
            tracing::debug!(key = %asset.key, bytes = bytes.len(), "asset cached");
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleLoader for HostCapabilities {
    async fn fetch_module_bytes(&self, module: &str) -> Result<Vec<u8>, CapabilityError> {
        let url = {
            let catalogs = self.catalogs.read().unwrap_or_else(PoisonError::into_inner);
            catalogs.values().find_map(|catalog| {
                catalog
                    .manifest
                    .modules
                    .get(module)
                    .map(|url| resolve_relative(&catalog.url, url))
            })
        };
        let Some(url) = url else {
            return Err(CapabilityError::failed(
                Capability::FetchModuleBytes,
                format!("module '{}' is not listed by any loaded catalog", module),
            ));
        };
        self.fetch_bytes(&url)
            .await
            .map_err(|e| CapabilityError::failed(Capability::FetchModuleBytes, e))
    }

    fn load_module(&self, module: &str, bytes: &[u8]) -> Result<(), CapabilityError> {
        self.registry.register(module, bytes)
    }
}

#[async_trait]
impl EntryActivator for HostCapabilities {
    async fn activate_entry(&self, entry: &str) -> Result<(), CapabilityError> {
        let found = self
            .catalogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|catalog| catalog.manifest.assets.iter().any(|a| a.key == entry));
        if found || self.registry.contains(entry) {
            return Ok(());
        }
        Err(CapabilityError::failed(
            Capability::ActivateEntry,
            format!("entry '{}' not found in loaded catalogs", entry),
        ))
    }
}

/// Filesystem path for `file://` URLs and bare paths, `None` for remote URLs
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        return None;
    }
    Some(PathBuf::from(url))
}

/// Resolve `url` against the location of the manifest at `base`
fn resolve_relative(base: &str, url: &str) -> String {
    if url.contains("://") || Path::new(url).is_absolute() {
        return url.to_string();
    }
    match local_path(base) {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            let joined = dir.join(url).to_string_lossy().into_owned();
            if base.starts_with("file://") {
                format!("file://{}", joined)
            } else {
                joined
            }
        }
        None => reqwest::Url::parse(base)
            .and_then(|base| base.join(url))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string()),
    }
}
