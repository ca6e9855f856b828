//! # Pipeline Phases
//!
//! The global phase sequence and the run-level status it produces.

use serde::{Deserialize, Serialize};

use super::bus::Msg;
use crate::state::CatalogPhase;

/// Global pipeline phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CatalogLoad,
    SizeCalculation,
    AssetPreload,
    ModuleLoad,
    EntryActivation,
}

impl Phase {
    /// Phase that runs after this one succeeds
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::CatalogLoad => Some(Self::SizeCalculation),
            Self::SizeCalculation => Some(Self::AssetPreload),
            Self::AssetPreload => Some(Self::ModuleLoad),
            Self::ModuleLoad => Some(Self::EntryActivation),
            Self::EntryActivation => None,
        }
    }

    /// Per-catalog phase, `None` for the pipeline-level entry phase
    pub fn catalog_phase(&self) -> Option<CatalogPhase> {
        match self {
            Self::CatalogLoad => Some(CatalogPhase::CatalogLoad),
            Self::SizeCalculation => Some(CatalogPhase::SizeCalculation),
            Self::AssetPreload => Some(CatalogPhase::AssetPreload),
            Self::ModuleLoad => Some(CatalogPhase::ModuleLoad),
            Self::EntryActivation => None,
        }
    }

    /// Published when the phase starts
    pub fn started_msg(&self) -> Msg {
        match self {
            Self::CatalogLoad => Msg::CatalogsLoading,
            Self::SizeCalculation => Msg::SizeCalculating,
            Self::AssetPreload => Msg::AssetsPreloading,
            Self::ModuleLoad => Msg::ModulesLoading,
            Self::EntryActivation => Msg::EntryLoading,
        }
    }

    /// Published when the phase succeeds
    pub fn succeeded_msg(&self) -> Msg {
        match self {
            Self::CatalogLoad => Msg::CatalogsLoaded,
            Self::SizeCalculation => Msg::SizeCalculated,
            Self::AssetPreload => Msg::AssetsPreloaded,
            Self::ModuleLoad => Msg::ModulesLoaded,
            Self::EntryActivation => Msg::EntryLoaded,
        }
    }

    /// Published when the phase fails
    pub fn failed_msg(&self) -> Msg {
        match self {
            Self::CatalogLoad => Msg::CatalogsLoadFailed,
            Self::SizeCalculation => Msg::SizeCalculateFailed,
            Self::AssetPreload => Msg::AssetsPreloadFailed,
            Self::ModuleLoad => Msg::ModulesLoadFailed,
            Self::EntryActivation => Msg::EntryLoadFailed,
        }
    }

    /// Phase whose failure message is `msg`
    pub fn failed_by(msg: Msg) -> Option<Phase> {
        match msg {
            Msg::CatalogsLoadFailed => Some(Self::CatalogLoad),
            Msg::SizeCalculateFailed => Some(Self::SizeCalculation),
            Msg::AssetsPreloadFailed => Some(Self::AssetPreload),
            Msg::ModulesLoadFailed => Some(Self::ModuleLoad),
            Msg::EntryLoadFailed => Some(Self::EntryActivation),
            _ => None,
        }
    }

    /// Phase triggered by the success message `msg`
    pub fn triggered_by(msg: Msg) -> Option<Phase> {
        match msg {
            Msg::Init => Some(Self::CatalogLoad),
            Msg::CatalogsLoaded => Some(Self::SizeCalculation),
            Msg::SizeCalculated => Some(Self::AssetPreload),
            Msg::AssetsPreloaded => Some(Self::ModuleLoad),
            Msg::ModulesLoaded => Some(Self::EntryActivation),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CatalogLoad => "catalog_load",
            Self::SizeCalculation => "size_calculation",
            Self::AssetPreload => "asset_preload",
            Self::ModuleLoad => "module_load",
            Self::EntryActivation => "entry_activation",
        };
        f.write_str(name)
    }
}

/// Run-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// No run has started
    #[default]
    Idle,
    /// A phase of the run is in flight
    Running { generation: u64, phase: Phase },
    /// The entry was activated; `degraded_from` names the phase that failed
    Completed {
        generation: u64,
        degraded_from: Option<Phase>,
    },
    /// A phase failed and degraded completion is disabled
    Halted { generation: u64, phase: Phase },
    /// Entry activation itself failed
    EntryFailed {
        generation: u64,
        degraded_from: Option<Phase>,
    },
}

impl RunStatus {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Idle => 0,
            Self::Running { generation, .. }
            | Self::Completed { generation, .. }
            | Self::Halted { generation, .. }
            | Self::EntryFailed { generation, .. } => *generation,
        }
    }

    /// No further phase will run without a new `Init`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Halted { .. } | Self::EntryFailed { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::Completed {
                degraded_from: Some(_),
                ..
            } | Self::EntryFailed {
                degraded_from: Some(_),
                ..
            }
        )
    }
}
