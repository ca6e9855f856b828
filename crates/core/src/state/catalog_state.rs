//! # Catalog State
//!
//! Per-catalog run record and the state machine it moves through.
//!
//! A catalog's status is the pair `(CatalogPhase, StepOutcome)`. It only ever
//! moves forward: a phase can begin only once the previous phase succeeded,
//! and a failed catalog stays frozen at its failure status.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::capabilities::CatalogManifest;
use crate::config::CatalogDescriptor;
use crate::error::{CapabilityError, LauncherError};

/// Per-catalog phase, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogPhase {
    CatalogLoad,
    SizeCalculation,
    AssetPreload,
    ModuleLoad,
}

impl CatalogPhase {
    pub const ALL: [CatalogPhase; 4] = [
        CatalogPhase::CatalogLoad,
        CatalogPhase::SizeCalculation,
        CatalogPhase::AssetPreload,
        CatalogPhase::ModuleLoad,
    ];

    /// Phase that must have succeeded before this one can begin
    pub fn previous(&self) -> Option<CatalogPhase> {
        match self {
            Self::CatalogLoad => None,
            Self::SizeCalculation => Some(Self::CatalogLoad),
            Self::AssetPreload => Some(Self::SizeCalculation),
            Self::ModuleLoad => Some(Self::AssetPreload),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogLoad => "catalog_load",
            Self::SizeCalculation => "size_calculation",
            Self::AssetPreload => "asset_preload",
            Self::ModuleLoad => "module_load",
        }
    }
}

impl std::fmt::Display for CatalogPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the catalog's current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    InProgress,
    Succeeded,
    Failed,
}

/// Flat status names, derived from `(CatalogPhase, StepOutcome)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    CatalogLoading,
    CatalogLoaded,
    CatalogLoadFailed,
    SizeCalculating,
    SizeCalculated,
    SizeCalculateFailed,
    AssetsPreloading,
    AssetsPreloaded,
    AssetsPreloadFailed,
    AssembliesLoading,
    AssembliesLoaded,
    AssembliesLoadFailed,
}

impl CatalogStatus {
    pub fn from_step(phase: CatalogPhase, outcome: StepOutcome) -> Self {
        use CatalogPhase as P;
        use StepOutcome as O;
        match (phase, outcome) {
            (P::CatalogLoad, O::InProgress) => Self::CatalogLoading,
            (P::CatalogLoad, O::Succeeded) => Self::CatalogLoaded,
            (P::CatalogLoad, O::Failed) => Self::CatalogLoadFailed,
            (P::SizeCalculation, O::InProgress) => Self::SizeCalculating,
            (P::SizeCalculation, O::Succeeded) => Self::SizeCalculated,
            (P::SizeCalculation, O::Failed) => Self::SizeCalculateFailed,
            (P::AssetPreload, O::InProgress) => Self::AssetsPreloading,
            (P::AssetPreload, O::Succeeded) => Self::AssetsPreloaded,
            (P::AssetPreload, O::Failed) => Self::AssetsPreloadFailed,
            (P::ModuleLoad, O::InProgress) => Self::AssembliesLoading,
            (P::ModuleLoad, O::Succeeded) => Self::AssembliesLoaded,
            (P::ModuleLoad, O::Failed) => Self::AssembliesLoadFailed,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::CatalogLoadFailed
                | Self::SizeCalculateFailed
                | Self::AssetsPreloadFailed
                | Self::AssembliesLoadFailed
        )
    }
}

/// Mutable record of one catalog during one run
#[derive(Debug, Clone, Serialize)]
pub struct CatalogState {
    /// Fixed at creation
    pub is_optional: bool,
    pub descriptor: Arc<CatalogDescriptor>,
    phase: CatalogPhase,
    outcome: StepOutcome,
    /// Locator produced by the catalog fetch
    pub locator_id: Option<String>,
    /// Asset keys produced by the catalog fetch
    pub asset_keys: Vec<String>,
    /// Bytes still to download for the preload label
    pub download_size: u64,
    /// Modules that loaded, in load order
    pub loaded_modules: Vec<String>,
    /// Last recorded failure
    pub error: Option<CapabilityError>,
}

impl CatalogState {
    /// A freshly registered catalog, already loading
    pub fn new(descriptor: Arc<CatalogDescriptor>, is_optional: bool) -> Self {
        Self {
            is_optional,
            descriptor,
            phase: CatalogPhase::CatalogLoad,
            outcome: StepOutcome::InProgress,
            locator_id: None,
            asset_keys: Vec::new(),
            download_size: 0,
            loaded_modules: Vec::new(),
            error: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    pub fn phase(&self) -> CatalogPhase {
        self.phase
    }

    pub fn outcome(&self) -> StepOutcome {
        self.outcome
    }

    pub fn status(&self) -> CatalogStatus {
        CatalogStatus::from_step(self.phase, self.outcome)
    }

    /// Whether `phase` is the catalog's phase and it succeeded
    pub fn has_succeeded(&self, phase: CatalogPhase) -> bool {
        self.phase == phase && self.outcome == StepOutcome::Succeeded
    }

    /// Whether `phase` may begin from the current status
    pub fn is_ready_for(&self, phase: CatalogPhase) -> bool {
        phase.previous() == Some(self.phase) && self.outcome == StepOutcome::Succeeded
    }

    /// Enter `phase`
    pub fn begin(&mut self, phase: CatalogPhase) -> Result<(), LauncherError> {
        if !self.is_ready_for(phase) {
            return Err(self.invalid(phase));
        }
        self.phase = phase;
        self.outcome = StepOutcome::InProgress;
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<(), LauncherError> {
        self.finish(StepOutcome::Succeeded)
    }

    /// Freeze the catalog at the current phase's failure status
    pub fn fail(&mut self, error: CapabilityError) -> Result<(), LauncherError> {
        self.finish(StepOutcome::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Record a successful catalog fetch
    pub fn complete_load(&mut self, manifest: CatalogManifest) -> Result<(), LauncherError> {
        if self.phase != CatalogPhase::CatalogLoad {
            return Err(self.invalid(CatalogPhase::CatalogLoad));
        }
        self.succeed()?;
        self.locator_id = Some(manifest.locator_id);
        self.asset_keys = manifest.asset_keys;
        Ok(())
    }

    fn finish(&mut self, outcome: StepOutcome) -> Result<(), LauncherError> {
        if self.outcome != StepOutcome::InProgress {
            return Err(self.invalid(self.phase));
        }
        self.outcome = outcome;
        Ok(())
    }

    fn invalid(&self, to: CatalogPhase) -> LauncherError {
        LauncherError::InvalidTransition {
            key: self.key().to_string(),
            from: self.status(),
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Capability;

    fn state() -> CatalogState {
        CatalogState::new(Arc::new(CatalogDescriptor::new("core", "u")), false)
    }

    #[test]
    fn test_new_state_is_loading() {
        let state = state();
        assert_eq!(state.status(), CatalogStatus::CatalogLoading);
        assert!(!state.is_optional);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_forward_progression() {
        let mut state = state();
        state
            .complete_load(CatalogManifest {
                locator_id: "core-locator".to_string(),
                asset_keys: vec!["a".to_string(), "b".to_string()],
            })
            .unwrap();
        assert_eq!(state.status(), CatalogStatus::CatalogLoaded);
        assert_eq!(state.locator_id.as_deref(), Some("core-locator"));

        for phase in &CatalogPhase::ALL[1..] {
            state.begin(*phase).unwrap();
            state.succeed().unwrap();
        }
        assert_eq!(state.status(), CatalogStatus::AssembliesLoaded);
    }

    #[test]
    fn test_cannot_skip_or_go_back() {
        let mut state = state();
        state.succeed().unwrap();

        let err = state.begin(CatalogPhase::AssetPreload).unwrap_err();
        assert!(matches!(
            err,
            LauncherError::InvalidTransition {
                from: CatalogStatus::CatalogLoaded,
                to: CatalogPhase::AssetPreload,
                ..
            }
        ));
        assert!(state.begin(CatalogPhase::CatalogLoad).is_err());
        assert_eq!(state.status(), CatalogStatus::CatalogLoaded);
    }

    #[test]
    fn test_failure_freezes_state() {
        let mut state = state();
        state.succeed().unwrap();
        state.begin(CatalogPhase::SizeCalculation).unwrap();
        state
            .fail(CapabilityError::failed(Capability::EstimateDownloadSize, "timeout"))
            .unwrap();

        assert_eq!(state.status(), CatalogStatus::SizeCalculateFailed);
        assert!(state.status().is_failure());
        assert!(!state.is_ready_for(CatalogPhase::AssetPreload));
        assert!(state.begin(CatalogPhase::AssetPreload).is_err());
        assert!(state.succeed().is_err());
        assert!(state.error.is_some());
    }
}
