//! # Launcher Orchestration
//!
//! Bus-driven phase sequencing over every tracked catalog.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Init → Catalog Load → Size Calculation → Asset Preload → Module Load → Entry Activation
//!             └──────────────┴─── failure ────┴──────────────┘
//!                      halt, or jump to Entry Activation when degraded completion is on
//! ```

pub mod bus;
pub mod events;
pub mod orchestrator;
pub mod pipeline;

#[cfg(test)]
mod tests;

pub use bus::{Handler, MessageBus, Msg};
pub use events::{EventLog, LauncherEvent};
pub use orchestrator::{Launcher, LauncherCommand, LauncherHandle};
pub use pipeline::{Phase, RunStatus};
