//! # Launcher
//!
//! Drives every catalog through the phase sequence and turns per-catalog
//! outcomes into phase results.
//!
//! The launcher runs as a single task consuming `LauncherCommand`s. Bus
//! handlers translate phase messages into commands: `Init` starts a new run
//! generation, each success message queues the next phase, and failure
//! messages queue a degraded entry activation when configured. Commands from
//! a superseded generation are dropped, and every capability call is raced
//! against the generation so a new `Init` abandons the in-flight run.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};

use crate::capabilities::Capabilities;
use crate::config::{CatalogDescriptor, LauncherConfig};
use crate::error::{CapabilityError, LauncherError};
use crate::state::{CatalogPhase, CatalogState, CatalogStates, Diagnostic};

use super::bus::{MessageBus, Msg};
use super::events::EventLog;
use super::pipeline::{Phase, RunStatus};

/// Commands consumed by the launcher task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherCommand {
    /// Run `phase` for run `generation`
    Phase {
        generation: u64,
        phase: Phase,
        /// Set when jumping to entry activation after a failed phase
        degraded_from: Option<Phase>,
    },
    /// Stop the launcher task
    Shutdown,
}

/// The run was superseded by a newer `Init`
#[derive(Debug)]
struct Abandoned;

type Step<T = ()> = Result<T, Abandoned>;

/// The pipeline orchestrator
pub struct Launcher {
    config: Arc<LauncherConfig>,
    caps: Capabilities,
    bus: MessageBus,
    states: Arc<RwLock<CatalogStates>>,
    generation_tx: Arc<watch::Sender<u64>>,
    generation_rx: watch::Receiver<u64>,
    /// Run whose outcome message is being dispatched
    publishing: Arc<AtomicU64>,
    status_tx: Arc<watch::Sender<RunStatus>>,
    command_tx: mpsc::UnboundedSender<LauncherCommand>,
    command_rx: mpsc::UnboundedReceiver<LauncherCommand>,
}

impl Launcher {
    /// Create a launcher and subscribe it to `bus`
    pub fn new(config: LauncherConfig, caps: Capabilities, bus: MessageBus) -> Self {
        if config.debug_bus {
            bus.set_debug(true);
        }

        let (generation_tx, generation_rx) = watch::channel(0u64);
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let launcher = Self {
            config: Arc::new(config),
            caps,
            bus,
            states: Arc::new(RwLock::new(CatalogStates::new())),
            generation_tx: Arc::new(generation_tx),
            generation_rx,
            publishing: Arc::new(AtomicU64::new(0)),
            status_tx: Arc::new(status_tx),
            command_tx,
            command_rx,
        };
        launcher.subscribe();
        launcher
    }

    fn subscribe(&self) {
        let bus = &self.bus;

        let generation = self.generation_tx.clone();
        let states = self.states.clone();
        let commands = self.command_tx.clone();
        bus.subscribe(Msg::Init, move |_, _| {
            let mut states = states.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = 0;
            generation.send_modify(|g| {
                *g += 1;
                next = *g;
            });
            states.clear();
            drop(states);
            tracing::info!(generation = next, "launcher init");
            let _ = commands.send(LauncherCommand::Phase {
                generation: next,
                phase: Phase::CatalogLoad,
                degraded_from: None,
            });
        });

        bus.subscribe(Msg::Relaunch, |bus, _| {
            tracing::info!("relaunch requested");
            bus.publish(Msg::Init);
        });

        for msg in [
            Msg::CatalogsLoaded,
            Msg::SizeCalculated,
            Msg::AssetsPreloaded,
            Msg::ModulesLoaded,
        ] {
            let Some(phase) = Phase::triggered_by(msg) else {
                continue;
            };
            let queue = self.queue();
            bus.subscribe(msg, move |_, _| queue(phase, None));
        }

        if self.config.try_entry_on_error {
            for msg in [
                Msg::CatalogsLoadFailed,
                Msg::SizeCalculateFailed,
                Msg::AssetsPreloadFailed,
                Msg::ModulesLoadFailed,
            ] {
                let Some(failed) = Phase::failed_by(msg) else {
                    continue;
                };
                let queue = self.queue();
                bus.subscribe(msg, move |_, _| {
                    tracing::warn!(%failed, "phase failed, trying entry anyway");
                    queue(Phase::EntryActivation, Some(failed));
                });
            }
        }
    }

    /// Queue a phase for the run that published the message being handled.
    ///
    /// Nothing is queued if a newer `Init` has arrived since.
    fn queue(&self) -> impl Fn(Phase, Option<Phase>) + Send + Sync + 'static {
        let publishing = self.publishing.clone();
        let generation = self.generation_rx.clone();
        let commands = self.command_tx.clone();
        move |phase, degraded_from| {
            let published = publishing.load(Ordering::SeqCst);
            if published != *generation.borrow() {
                tracing::debug!(
                    generation = published,
                    %phase,
                    "not queueing phase for superseded run"
                );
                return;
            }
            let _ = commands.send(LauncherCommand::Phase {
                generation: published,
                phase,
                degraded_from,
            });
        }
    }

    /// Handle for observing and triggering this launcher
    pub fn handle(&self) -> LauncherHandle {
        LauncherHandle {
            bus: self.bus.clone(),
            states: self.states.clone(),
            status_rx: self.status_tx.subscribe(),
            generation_rx: self.generation_rx.clone(),
            command_tx: self.command_tx.clone(),
        }
    }

    /// Run the launcher on a background task
    pub fn spawn(self) -> LauncherHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Process commands until `Shutdown`
    pub async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                LauncherCommand::Shutdown => {
                    tracing::info!("launcher shutting down");
                    break;
                }
                LauncherCommand::Phase {
                    generation,
                    phase,
                    degraded_from,
                } => {
                    if generation != self.current_generation() {
                        tracing::debug!(generation, %phase, "dropping command for superseded run");
                        continue;
                    }
                    if self.run_phase(generation, phase, degraded_from).await.is_err() {
                        tracing::info!(generation, %phase, "run abandoned by a newer init");
                    }
                }
            }
        }
    }

    async fn run_phase(
        &self,
        generation: u64,
        phase: Phase,
        degraded_from: Option<Phase>,
    ) -> Step {
        self.set_status(RunStatus::Running { generation, phase });
        match phase {
            Phase::CatalogLoad => self.load_catalogs(generation).await,
            Phase::SizeCalculation => self.calculate_sizes(generation).await,
            Phase::AssetPreload => self.preload_catalogs(generation).await,
            Phase::ModuleLoad => self.load_modules(generation).await,
            Phase::EntryActivation => self.activate_entry(generation, degraded_from).await,
        }
    }

    // === Catalog Load ===

    #[tracing::instrument(skip(self))]
    async fn load_catalogs(&self, generation: u64) -> Step {
        self.write_states(generation, CatalogStates::clear)?;
        self.publish(generation, Msg::CatalogsLoading)?;

        let descriptors: Vec<(Arc<CatalogDescriptor>, bool)> = self
            .config
            .descriptors()
            .map(|(descriptor, is_optional)| (descriptor.clone(), is_optional))
            .collect();
        for (descriptor, is_optional) in descriptors {
            self.load_catalog(generation, descriptor, is_optional).await?;
        }

        self.finish_phase(generation, Phase::CatalogLoad)
    }

    async fn load_catalog(
        &self,
        generation: u64,
        descriptor: Arc<CatalogDescriptor>,
        is_optional: bool,
    ) -> Step {
        let registered = self.write_states(generation, |states| {
            states
                .register(descriptor.clone(), is_optional)
                .map(|_| ())
        })?;
        if let Err(conflict) = registered {
            tracing::error!(key = %descriptor.key, "{}", conflict);
            return Ok(());
        }

        let url = descriptor.resolve_url(self.caps.environment.as_ref());
        let result = self
            .guarded(
                generation,
                self.caps.catalogs.fetch_catalog(&descriptor.key, &url),
            )
            .await?;

        self.update(generation, &descriptor.key, |state| match result {
            Ok(manifest) => {
                tracing::info!(
                    key = %descriptor.key,
                    locator = %manifest.locator_id,
                    assets = manifest.asset_keys.len(),
                    "catalog loaded"
                );
                state.complete_load(manifest)
            }
            Err(err) => state.fail(err),
        })
    }

    // === Size Calculation ===

    #[tracing::instrument(skip(self))]
    async fn calculate_sizes(&self, generation: u64) -> Step {
        self.publish(generation, Msg::SizeCalculating)?;
        for key in self.keys(generation)? {
            self.calculate_size(generation, &key).await?;
        }
        self.finish_phase(generation, Phase::SizeCalculation)
    }

    async fn calculate_size(&self, generation: u64, key: &str) -> Step {
        let Some(descriptor) = self.begin_step(generation, key, CatalogPhase::SizeCalculation)?
        else {
            return Ok(());
        };
        if !descriptor.has_preload() {
            return self.update(generation, key, CatalogState::succeed);
        }

        let result = self
            .guarded(
                generation,
                self.caps
                    .sizes
                    .estimate_download_size(&descriptor.preload_label),
            )
            .await?;

        self.update(generation, key, |state| match result {
            Ok(bytes) => {
                tracing::info!(key, label = %descriptor.preload_label, bytes, "download size calculated");
                state.download_size = bytes;
                state.succeed()
            }
            Err(err) => state.fail(err),
        })
    }

    // === Asset Preload ===

    #[tracing::instrument(skip(self))]
    async fn preload_catalogs(&self, generation: u64) -> Step {
        self.publish(generation, Msg::AssetsPreloading)?;
        for key in self.keys(generation)? {
            self.preload_catalog(generation, &key).await?;
        }
        self.finish_phase(generation, Phase::AssetPreload)
    }

    async fn preload_catalog(&self, generation: u64, key: &str) -> Step {
        let Some(descriptor) = self.begin_step(generation, key, CatalogPhase::AssetPreload)? else {
            return Ok(());
        };
        if !descriptor.has_preload() {
            return self.update(generation, key, CatalogState::succeed);
        }

        let result = self
            .guarded(
                generation,
                self.caps.preloader.preload_assets(&descriptor.preload_label),
            )
            .await?;

        self.update(generation, key, |state| match result {
            Ok(()) => state.succeed(),
            Err(err) => state.fail(err),
        })
    }

    // === Module Load ===

    #[tracing::instrument(skip(self))]
    async fn load_modules(&self, generation: u64) -> Step {
        self.publish(generation, Msg::ModulesLoading)?;
        for key in self.keys(generation)? {
            self.load_catalog_modules(generation, &key).await?;
        }
        self.finish_phase(generation, Phase::ModuleLoad)
    }

    async fn load_catalog_modules(&self, generation: u64, key: &str) -> Step {
        let Some(descriptor) = self.begin_step(generation, key, CatalogPhase::ModuleLoad)? else {
            return Ok(());
        };
        if !descriptor.has_modules() {
            return self.update(generation, key, CatalogState::succeed);
        }

        for module in &descriptor.mandatory_modules {
            match self.load_module(generation, module).await? {
                Ok(()) => self.record_module(generation, key, module)?,
                Err(err) => {
                    tracing::error!(catalog = key, module = %module, "{}", err);
                    return self.update(generation, key, |state| state.fail(err));
                }
            }
        }

        for module in &descriptor.optional_modules {
            match self.load_module(generation, module).await? {
                Ok(()) => self.record_module(generation, key, module)?,
                Err(err) => {
                    tracing::warn!(catalog = key, module = %module, "optional module skipped: {}", err);
                    self.write_states(generation, |states| {
                        states.record(Diagnostic::OptionalModuleFailed {
                            catalog: key.to_string(),
                            module: module.clone(),
                            reason: err.to_string(),
                        })
                    })?;
                }
            }
        }

        self.update(generation, key, CatalogState::succeed)
    }

    /// Fetch then link one module. Panics while linking become load failures.
    async fn load_module(
        &self,
        generation: u64,
        module: &str,
    ) -> Step<Result<(), CapabilityError>> {
        let fetched = self
            .guarded(generation, self.caps.modules.fetch_module_bytes(module))
            .await?;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => return Ok(Err(err)),
        };

        let loader = &self.caps.modules;
        let linked = catch_unwind(AssertUnwindSafe(|| loader.load_module(module, &bytes)))
            .unwrap_or_else(|panic| {
                Err(CapabilityError::module_load(module, panic_message(&*panic)))
            });
        if linked.is_ok() {
            tracing::info!(module, bytes = bytes.len(), "module loaded");
        }
        Ok(linked)
    }

    fn record_module(&self, generation: u64, key: &str, module: &str) -> Step {
        self.update(generation, key, |state| {
            state.loaded_modules.push(module.to_string());
            Ok(())
        })
    }

    // === Entry Activation ===

    #[tracing::instrument(skip(self))]
    async fn activate_entry(&self, generation: u64, degraded_from: Option<Phase>) -> Step {
        self.publish(generation, Msg::EntryLoading)?;

        let entry = &self.config.entry;
        let result = self
            .guarded(generation, self.caps.entry.activate_entry(entry))
            .await?;

        match result {
            Ok(()) => {
                tracing::info!(%entry, degraded = degraded_from.is_some(), "entry activated");
                self.publish(generation, Msg::EntryLoaded)?;
                self.set_status(RunStatus::Completed {
                    generation,
                    degraded_from,
                });
            }
            Err(err) => {
                tracing::error!(%entry, "entry activation failed: {}", err);
                self.publish(generation, Msg::EntryLoadFailed)?;
                self.set_status(RunStatus::EntryFailed {
                    generation,
                    degraded_from,
                });
            }
        }
        Ok(())
    }

    // === Aggregation ===

    /// Scan every catalog and publish the phase's outcome message
    fn finish_phase(&self, generation: u64, phase: Phase) -> Step {
        let Some(catalog_phase) = phase.catalog_phase() else {
            return Ok(());
        };

        let succeeded = self.write_states(generation, |states| {
            let mut optional = Vec::new();
            for state in states.unsuccessful(catalog_phase) {
                if state.is_optional {
                    tracing::warn!(
                        key = state.key(),
                        status = ?state.status(),
                        error = ?state.error,
                        "{} failed for optional catalog",
                        phase
                    );
                    if state.phase() == catalog_phase {
                        optional.push(state.key().to_string());
                    }
                } else {
                    tracing::error!(
                        key = state.key(),
                        status = ?state.status(),
                        error = ?state.error,
                        "{} failed",
                        phase
                    );
                }
            }
            for key in optional {
                states.record(Diagnostic::OptionalCatalogFailed {
                    key,
                    phase: catalog_phase,
                });
            }
            states.mandatory_succeeded(catalog_phase)
        })?;

        if succeeded {
            tracing::info!(generation, %phase, "phase succeeded");
            return self.publish(generation, phase.succeeded_msg());
        }

        tracing::error!(generation, %phase, "phase failed");
        self.publish(generation, phase.failed_msg())?;
        if !self.config.try_entry_on_error {
            self.set_status(RunStatus::Halted { generation, phase });
        }
        Ok(())
    }

    // === Run bookkeeping ===

    fn current_generation(&self) -> u64 {
        *self.generation_rx.borrow()
    }

    fn ensure_current(&self, generation: u64) -> Step {
        if self.current_generation() == generation {
            Ok(())
        } else {
            Err(Abandoned)
        }
    }

    fn publish(&self, generation: u64, msg: Msg) -> Step {
        self.ensure_current(generation)?;
        self.publishing.store(generation, Ordering::SeqCst);
        self.bus.publish(msg);
        Ok(())
    }

    fn set_status(&self, status: RunStatus) {
        if self.ensure_current(status.generation()).is_ok() {
            self.status_tx.send_replace(status);
        }
    }

    /// Mutate the table, unless the run has been superseded
    fn write_states<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut CatalogStates) -> T,
    ) -> Step<T> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        self.ensure_current(generation)?;
        Ok(f(&mut states))
    }

    fn keys(&self, generation: u64) -> Step<Vec<String>> {
        self.write_states(generation, |states| states.keys())
    }

    fn update(
        &self,
        generation: u64,
        key: &str,
        f: impl FnOnce(&mut CatalogState) -> Result<(), LauncherError>,
    ) -> Step {
        let result = self.write_states(generation, |states| match states.get_mut(key) {
            Some(state) => f(state),
            None => Ok(()),
        })?;
        if let Err(err) = result {
            tracing::error!(key, "{}", err);
        }
        Ok(())
    }

    /// Move a catalog into `phase`, or `None` if it is not ready for it
    fn begin_step(
        &self,
        generation: u64,
        key: &str,
        phase: CatalogPhase,
    ) -> Step<Option<Arc<CatalogDescriptor>>> {
        self.write_states(generation, |states| {
            let state = states.get_mut(key)?;
            if !state.is_ready_for(phase) {
                tracing::debug!(key, status = ?state.status(), %phase, "skipping catalog");
                return None;
            }
            state.begin(phase).ok()?;
            Some(state.descriptor.clone())
        })
    }

    /// Await `fut` unless a newer `Init` arrives first
    async fn guarded<F: Future>(&self, generation: u64, fut: F) -> Step<F::Output> {
        self.ensure_current(generation)?;
        let superseded = superseded(self.generation_rx.clone(), generation);
        tokio::select! {
            output = fut => {
                self.ensure_current(generation)?;
                Ok(output)
            }
            _ = superseded => Err(Abandoned),
        }
    }
}

/// Resolves once the run generation moves past `generation`
async fn superseded(mut generation_rx: watch::Receiver<u64>, generation: u64) {
    loop {
        if *generation_rx.borrow_and_update() != generation {
            return;
        }
        if generation_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "module loader panicked".to_string()
    }
}

/// Cloneable handle to a launcher
#[derive(Clone)]
pub struct LauncherHandle {
    bus: MessageBus,
    states: Arc<RwLock<CatalogStates>>,
    status_rx: watch::Receiver<RunStatus>,
    generation_rx: watch::Receiver<u64>,
    command_tx: mpsc::UnboundedSender<LauncherCommand>,
}

impl LauncherHandle {
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Publish `Init` and return the generation of the new run
    pub fn launch(&self) -> u64 {
        self.bus.publish(Msg::Init);
        self.generation()
    }

    /// Publish `Relaunch` and return the generation of the new run
    pub fn relaunch(&self) -> u64 {
        self.bus.publish(Msg::Relaunch);
        self.generation()
    }

    pub fn generation(&self) -> u64 {
        *self.generation_rx.borrow()
    }

    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation_rx.clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status_rx.clone()
    }

    /// Snapshot of the catalog table
    pub fn states(&self) -> CatalogStates {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record every bus message from now on
    pub fn record_events(&self) -> EventLog {
        EventLog::attach(&self.bus, self.subscribe_generation())
    }

    /// Wait until run `generation` reaches a terminal status.
    ///
    /// Returns early with the newer status if the run is superseded.
    pub async fn wait_for_run(&self, generation: u64) -> RunStatus {
        let mut status_rx = self.status_rx.clone();
        let waited = status_rx
            .wait_for(|status| {
                status.generation() > generation
                    || (status.generation() == generation && status.is_terminal())
            })
            .await
            .map(|status| *status);
        waited.unwrap_or_else(|_| self.status())
    }

    /// Launch a run and wait for it to finish
    pub async fn launch_and_wait(&self) -> RunStatus {
        let generation = self.launch();
        self.wait_for_run(generation).await
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LauncherCommand::Shutdown);
    }
}

impl std::fmt::Debug for LauncherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherHandle")
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
