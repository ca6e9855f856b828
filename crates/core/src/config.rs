//! # Launcher Configuration
//!
//! Catalog descriptors and the launcher config they live in. Configuration is
//! JSON on disk and immutable once loaded; catalog states hold an
//! `Arc<CatalogDescriptor>` into it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use crate::capabilities::Environment;
use crate::error::LauncherError;

/// Placeholder replaced with the current build target
pub const BUILD_TARGET_TOKEN: &str = "[BuildTarget]";
/// Placeholder replaced with the current application version
pub const VERSION_TOKEN: &str = "[Version]";

/// Environment variable that overrides the config location
pub const CONFIG_PATH_ENV: &str = "LAUNCHER_CONFIG";
/// Config file used when nothing else is specified
pub const DEFAULT_CONFIG_FILE: &str = "launcher.json";

fn default_preload_label() -> String {
    "preload".to_string()
}

/// Static description of one catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogDescriptor {
    /// Unique catalog identity
    pub key: String,
    /// Source location template, may contain `[BuildTarget]` / `[Version]`
    pub url: String,
    /// Preload group label; empty means nothing to preload
    #[serde(default = "default_preload_label")]
    pub preload_label: String,
    /// Modules that must load for the catalog to succeed
    #[serde(default, alias = "mandatory_assemblies")]
    pub mandatory_modules: Vec<String>,
    /// Modules whose failure is only logged
    #[serde(default, alias = "optional_assemblies")]
    pub optional_modules: Vec<String>,
}

impl CatalogDescriptor {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            preload_label: default_preload_label(),
            mandatory_modules: Vec::new(),
            optional_modules: Vec::new(),
        }
    }

    pub fn with_preload_label(mut self, label: impl Into<String>) -> Self {
        self.preload_label = label.into();
        self
    }

    pub fn with_mandatory_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mandatory_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Whether size calculation and preloading have anything to do
    pub fn has_preload(&self) -> bool {
        !self.preload_label.is_empty()
    }

    /// Whether the module phase has anything to do
    pub fn has_modules(&self) -> bool {
        !self.mandatory_modules.is_empty() || !self.optional_modules.is_empty()
    }

    /// Resolve the url template against the running environment
    pub fn resolve_url(&self, env: &dyn Environment) -> String {
        let url = resolve_template(&self.url, &env.build_target(), &env.version());
        tracing::info!(key = %self.key, "resolved url: {} -> {}", self.url, url);
        url
    }
}

impl std::fmt::Display for CatalogDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.key, self.url)
    }
}

/// Substitute the first build-target token, then the first version token.
///
/// An empty value leaves its token in place.
pub fn resolve_template(template: &str, build_target: &str, version: &str) -> String {
    let mut url = template.to_string();
    for (token, value) in [(BUILD_TARGET_TOKEN, build_target), (VERSION_TOKEN, version)] {
        if !value.is_empty() {
            url = url.replacen(token, value, 1);
        }
    }
    url
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LauncherConfig {
    /// Entry target activated once every phase has passed
    pub entry: String,
    /// Catalogs whose failure fails their phase, in load order
    #[serde(default)]
    pub mandatory_catalogs: Vec<Arc<CatalogDescriptor>>,
    /// Catalogs whose failure is only logged, loaded after the mandatory ones
    #[serde(default)]
    pub optional_catalogs: Vec<Arc<CatalogDescriptor>>,
    /// Jump straight to entry activation when a phase fails
    #[serde(default, alias = "try_load_home_on_error")]
    pub try_entry_on_error: bool,
    /// Log every bus publish/subscribe
    #[serde(default)]
    pub debug_bus: bool,
}

impl LauncherConfig {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn with_mandatory(mut self, descriptor: CatalogDescriptor) -> Self {
        self.mandatory_catalogs.push(Arc::new(descriptor));
        self
    }

    pub fn with_optional(mut self, descriptor: CatalogDescriptor) -> Self {
        self.optional_catalogs.push(Arc::new(descriptor));
        self
    }

    pub fn with_try_entry_on_error(mut self, enabled: bool) -> Self {
        self.try_entry_on_error = enabled;
        self
    }

    /// All descriptors in catalog-load order, flagged with optional-ness
    pub fn descriptors(&self) -> impl Iterator<Item = (&Arc<CatalogDescriptor>, bool)> {
        self.mandatory_catalogs
            .iter()
            .map(|d| (d, false))
            .chain(self.optional_catalogs.iter().map(|d| (d, true)))
    }

    /// Reject configs the launcher cannot run.
    ///
    /// Duplicate keys are allowed here; they surface as conflicts at run time.
    pub fn validate(&self) -> Result<(), LauncherError> {
        if self.entry.trim().is_empty() {
            return Err(LauncherError::Config("entry target is empty".to_string()));
        }
        for (descriptor, _) in self.descriptors() {
            if descriptor.key.trim().is_empty() {
                return Err(LauncherError::Config(format!(
                    "catalog with url '{}' has an empty key",
                    descriptor.url
                )));
            }
            if descriptor.url.trim().is_empty() {
                return Err(LauncherError::Config(format!(
                    "catalog '{}' has an empty url",
                    descriptor.key
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).context("Failed to parse launcher config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read launcher config: {:?}", path))?;
        Self::from_json(&content).with_context(|| format!("Invalid launcher config: {:?}", path))
    }
}

/// Resolve the config path: explicit, then `LAUNCHER_CONFIG`, then `./launcher.json`
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}
