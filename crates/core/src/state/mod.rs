pub mod catalog_state;
pub mod catalog_states;

pub use catalog_state::{CatalogPhase, CatalogState, CatalogStatus, StepOutcome};
pub use catalog_states::{CatalogStates, Diagnostic};
