//! Scripted capabilities for launcher tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::capabilities::{
    AssetPreloader, Capabilities, CatalogFetcher, CatalogManifest, EntryActivator, ModuleLoader,
    SizeEstimator, StaticEnvironment,
};
use crate::error::{Capability, CapabilityError};

/// Host whose every call is recorded and whose failures are scripted
#[derive(Default)]
pub struct MockHost {
    calls: Mutex<Vec<String>>,
    fail_fetch: HashSet<String>,
    fail_estimate: HashSet<String>,
    fail_preload: HashSet<String>,
    fail_module_fetch: HashSet<String>,
    fail_module_load: HashSet<String>,
    panic_module_load: HashSet<String>,
    fail_activate: bool,
    sizes: HashMap<String, u64>,
    stall: Option<Stall>,
}

/// Blocks the first fetch of one catalog until the run is abandoned
struct Stall {
    key: String,
    used: AtomicBool,
    entered: Arc<Notify>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fetch(mut self, key: &str) -> Self {
        self.fail_fetch.insert(key.to_string());
        self
    }

    pub fn fail_estimate(mut self, label: &str) -> Self {
        self.fail_estimate.insert(label.to_string());
        self
    }

    pub fn fail_preload(mut self, label: &str) -> Self {
        self.fail_preload.insert(label.to_string());
        self
    }

    pub fn fail_module_fetch(mut self, module: &str) -> Self {
        self.fail_module_fetch.insert(module.to_string());
        self
    }

    pub fn fail_module_load(mut self, module: &str) -> Self {
        self.fail_module_load.insert(module.to_string());
        self
    }

    pub fn panic_module_load(mut self, module: &str) -> Self {
        self.panic_module_load.insert(module.to_string());
        self
    }

    pub fn fail_activate(mut self) -> Self {
        self.fail_activate = true;
        self
    }

    pub fn size(mut self, label: &str, bytes: u64) -> Self {
        self.sizes.insert(label.to_string(), bytes);
        self
    }

    /// Never complete the first fetch of `key`; returns a notifier fired when it starts
    pub fn stall_fetch_once(mut self, key: &str) -> (Self, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        self.stall = Some(Stall {
            key: key.to_string(),
            used: AtomicBool::new(false),
            entered: entered.clone(),
        });
        (self, entered)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls starting with `prefix`, prefix stripped
    pub fn calls_to(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn into_capabilities(self) -> (Arc<Self>, Capabilities) {
        let host = Arc::new(self);
        let env = Arc::new(StaticEnvironment::new("Linux", "1.0.0"));
        let caps = Capabilities::from_host(host.clone(), env);
        (host, caps)
    }
}

#[async_trait]
impl CatalogFetcher for MockHost {
    async fn fetch_catalog(
        &self,
        key: &str,
        resolved_url: &str,
    ) -> Result<CatalogManifest, CapabilityError> {
        self.record(format!("fetch:{}", key));
        if let Some(stall) = &self.stall {
            if stall.key == key && !stall.used.swap(true, Ordering::SeqCst) {
                stall.entered.notify_one();
                std::future::pending::<()>().await;
            }
        }
        if self.fail_fetch.contains(key) {
            return Err(CapabilityError::failed(Capability::FetchCatalog, "404 Not Found"));
        }
        Ok(CatalogManifest {
            locator_id: format!("{}@{}", key, resolved_url),
            asset_keys: vec![format!("{}/asset", key)],
        })
    }
}

#[async_trait]
impl SizeEstimator for MockHost {
    async fn estimate_download_size(&self, label: &str) -> Result<u64, CapabilityError> {
        self.record(format!("estimate:{}", label));
        if self.fail_estimate.contains(label) {
            return Err(CapabilityError::failed(
                Capability::EstimateDownloadSize,
                "label unknown",
            ));
        }
        Ok(self.sizes.get(label).copied().unwrap_or(1024))
    }
}

#[async_trait]
impl AssetPreloader for MockHost {
    async fn preload_assets(&self, label: &str) -> Result<(), CapabilityError> {
        self.record(format!("preload:{}", label));
        if self.fail_preload.contains(label) {
            return Err(CapabilityError::failed(Capability::PreloadAssets, "disk full"));
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleLoader for MockHost {
    async fn fetch_module_bytes(&self, module: &str) -> Result<Vec<u8>, CapabilityError> {
        self.record(format!("module_bytes:{}", module));
        if self.fail_module_fetch.contains(module) {
            return Err(CapabilityError::failed(
                Capability::FetchModuleBytes,
                "connection reset",
            ));
        }
        Ok(module.as_bytes().to_vec())
    }

    fn load_module(&self, module: &str, _bytes: &[u8]) -> Result<(), CapabilityError> {
        self.record(format!("load:{}", module));
        if self.panic_module_load.contains(module) {
            panic!("bad image format: {}", module);
        }
        if self.fail_module_load.contains(module) {
            return Err(CapabilityError::module_load(module, "missing dependency"));
        }
        Ok(())
    }
}

#[async_trait]
impl EntryActivator for MockHost {
    async fn activate_entry(&self, entry: &str) -> Result<(), CapabilityError> {
        self.record(format!("activate:{}", entry));
        if self.fail_activate {
            return Err(CapabilityError::failed(Capability::ActivateEntry, "scene missing"));
        }
        Ok(())
    }
}
