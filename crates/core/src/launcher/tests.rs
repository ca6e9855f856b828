use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use super::*;
use crate::config::{CatalogDescriptor, LauncherConfig};
use crate::error::CapabilityError;
use crate::state::{CatalogPhase, CatalogStatus, Diagnostic};
use crate::testing::MockHost;

const WAIT: Duration = Duration::from_secs(5);

/// Mandatory [A, B], optional [C]; B has nothing to preload
fn config() -> LauncherConfig {
    LauncherConfig::new("scenes/home")
        .with_mandatory(
            CatalogDescriptor::new("A", "https://cdn/[BuildTarget]/[Version]/a.json")
                .with_preload_label("a-preload"),
        )
        .with_mandatory(CatalogDescriptor::new("B", "https://cdn/b.json").with_preload_label(""))
        .with_optional(
            CatalogDescriptor::new("C", "https://cdn/c.json").with_preload_label("c-preload"),
        )
}

struct Run {
    host: Arc<MockHost>,
    handle: LauncherHandle,
    events: EventLog,
    status: RunStatus,
}

async fn run(config: LauncherConfig, host: MockHost) -> Run {
    let (host, caps) = host.into_capabilities();
    let handle = Launcher::new(config, caps, MessageBus::new()).spawn();
    let events = handle.record_events();
    let status = timeout(WAIT, handle.launch_and_wait())
        .await
        .expect("run timed out");
    Run {
        host,
        handle,
        events,
        status,
    }
}

fn status_of(handle: &LauncherHandle, key: &str) -> CatalogStatus {
    handle.states().get(key).expect("catalog registered").status()
}

#[tokio::test]
async fn test_full_pipeline_completes() {
    let run = run(config(), MockHost::new().size("a-preload", 4096)).await;

    assert_eq!(
        run.status,
        RunStatus::Completed {
            generation: 1,
            degraded_from: None
        }
    );
    assert_eq!(
        run.events.messages(),
        vec![
            Msg::Init,
            Msg::CatalogsLoading,
            Msg::CatalogsLoaded,
            Msg::SizeCalculating,
            Msg::SizeCalculated,
            Msg::AssetsPreloading,
            Msg::AssetsPreloaded,
            Msg::ModulesLoading,
            Msg::ModulesLoaded,
            Msg::EntryLoading,
            Msg::EntryLoaded,
        ]
    );

    let states = run.handle.states();
    assert_eq!(states.len(), 3);
    for state in states.iter() {
        assert_eq!(state.status(), CatalogStatus::AssembliesLoaded);
        assert!(state.error.is_none());
    }
    let a = states.get("A").unwrap();
    assert_eq!(a.download_size, 4096);
    assert_eq!(
        a.locator_id.as_deref(),
        Some("A@https://cdn/Linux/1.0.0/a.json")
    );
    assert_eq!(a.asset_keys, vec!["A/asset".to_string()]);
    assert_eq!(run.host.calls_to("activate:"), vec!["scenes/home"]);
}

#[tokio::test]
async fn test_mandatory_catalogs_load_before_optional() {
    let config = LauncherConfig::new("home")
        .with_optional(CatalogDescriptor::new("C", "c"))
        .with_mandatory(CatalogDescriptor::new("A", "a"))
        .with_mandatory(CatalogDescriptor::new("B", "b"));

    let run = run(config, MockHost::new()).await;

    assert_eq!(run.host.calls_to("fetch:"), vec!["A", "B", "C"]);
    assert!(run.status.is_success());
}

#[tokio::test]
async fn test_mandatory_catalog_failure_halts_after_whole_phase() {
    let run = run(config(), MockHost::new().fail_fetch("B")).await;

    assert_eq!(
        run.status,
        RunStatus::Halted {
            generation: 1,
            phase: Phase::CatalogLoad
        }
    );
    // The failure does not stop the other catalogs from loading
    assert_eq!(run.host.calls_to("fetch:"), vec!["A", "B", "C"]);
    assert_eq!(status_of(&run.handle, "A"), CatalogStatus::CatalogLoaded);
    assert_eq!(status_of(&run.handle, "B"), CatalogStatus::CatalogLoadFailed);
    assert_eq!(status_of(&run.handle, "C"), CatalogStatus::CatalogLoaded);
    assert!(run.handle.states().get("B").unwrap().error.is_some());

    assert_eq!(
        run.events.messages(),
        vec![Msg::Init, Msg::CatalogsLoading, Msg::CatalogsLoadFailed]
    );
    assert!(run.host.calls_to("estimate:").is_empty());
    assert!(run.host.calls_to("activate:").is_empty());
}

#[tokio::test]
async fn test_optional_catalog_failure_does_not_block() {
    let run = run(config(), MockHost::new().fail_fetch("C")).await;

    assert!(run.status.is_success());
    assert!(!run.status.is_degraded());
    assert!(run.events.messages().contains(&Msg::CatalogsLoaded));

    // Frozen at its failure status through every later phase
    assert_eq!(status_of(&run.handle, "C"), CatalogStatus::CatalogLoadFailed);
    assert_eq!(run.host.calls_to("estimate:"), vec!["a-preload"]);

    let states = run.handle.states();
    let failures: Vec<&Diagnostic> = states
        .diagnostics()
        .iter()
        .filter(|d| matches!(d, Diagnostic::OptionalCatalogFailed { .. }))
        .collect();
    assert_eq!(
        failures,
        vec![&Diagnostic::OptionalCatalogFailed {
            key: "C".to_string(),
            phase: CatalogPhase::CatalogLoad
        }]
    );
}

#[tokio::test]
async fn test_empty_preload_label_skips_size_and_preload() {
    let run = run(config(), MockHost::new()).await;

    assert_eq!(run.host.calls_to("estimate:"), vec!["a-preload", "c-preload"]);
    assert_eq!(run.host.calls_to("preload:"), vec!["a-preload", "c-preload"]);

    let states = run.handle.states();
    let b = states.get("B").unwrap();
    assert_eq!(b.status(), CatalogStatus::AssembliesLoaded);
    assert_eq!(b.download_size, 0);
}

#[tokio::test]
async fn test_mandatory_module_failure_short_circuits() {
    let config = LauncherConfig::new("home").with_mandatory(
        CatalogDescriptor::new("A", "a")
            .with_mandatory_modules(["M1", "M2"])
            .with_optional_modules(["O1"]),
    );

    let run = run(config, MockHost::new().fail_module_load("M1")).await;

    assert_eq!(run.host.calls_to("module_bytes:"), vec!["M1"]);
    assert_eq!(run.host.calls_to("load:"), vec!["M1"]);
    assert_eq!(status_of(&run.handle, "A"), CatalogStatus::AssembliesLoadFailed);
    assert_eq!(
        run.status,
        RunStatus::Halted {
            generation: 1,
            phase: Phase::ModuleLoad
        }
    );
    assert_eq!(run.events.messages().last(), Some(&Msg::ModulesLoadFailed));
}

#[tokio::test]
async fn test_module_fetch_failure_skips_linking() {
    let config = LauncherConfig::new("home")
        .with_mandatory(CatalogDescriptor::new("A", "a").with_mandatory_modules(["M1", "M2"]));

    let run = run(config, MockHost::new().fail_module_fetch("M1")).await;

    assert_eq!(run.host.calls_to("module_bytes:"), vec!["M1"]);
    assert!(run.host.calls_to("load:").is_empty());
    let states = run.handle.states();
    let a = states.get("A").unwrap();
    assert_eq!(a.status(), CatalogStatus::AssembliesLoadFailed);
    assert!(matches!(a.error, Some(CapabilityError::Failed { .. })));
}

#[tokio::test]
async fn test_optional_module_failure_is_only_diagnostic() {
    let config = LauncherConfig::new("home").with_mandatory(
        CatalogDescriptor::new("A", "a")
            .with_mandatory_modules(["M1"])
            .with_optional_modules(["O1", "O2"]),
    );

    let run = run(config, MockHost::new().fail_module_fetch("O1")).await;

    assert!(run.status.is_success());
    assert_eq!(run.host.calls_to("module_bytes:"), vec!["M1", "O1", "O2"]);

    let states = run.handle.states();
    let a = states.get("A").unwrap();
    assert_eq!(a.status(), CatalogStatus::AssembliesLoaded);
    assert_eq!(a.loaded_modules, vec!["M1".to_string(), "O2".to_string()]);
    assert!(a.error.is_none());
    assert!(states.diagnostics().iter().any(|d| matches!(
        d,
        Diagnostic::OptionalModuleFailed { catalog, module, .. } if catalog == "A" && module == "O1"
    )));
}

#[tokio::test]
async fn test_catalog_without_modules_never_touches_loader() {
    let run = run(config(), MockHost::new()).await;

    assert!(run.host.calls_to("module_bytes:").is_empty());
    assert!(run.host.calls_to("load:").is_empty());
}

#[tokio::test]
async fn test_panicking_module_load_is_a_failure() {
    let config = LauncherConfig::new("home")
        .with_mandatory(CatalogDescriptor::new("A", "a").with_mandatory_modules(["Boom"]));

    let run = run(config, MockHost::new().panic_module_load("Boom")).await;

    let states = run.handle.states();
    let a = states.get("A").unwrap();
    assert_eq!(a.status(), CatalogStatus::AssembliesLoadFailed);
    match &a.error {
        Some(CapabilityError::ModuleLoad { module, reason }) => {
            assert_eq!(module, "Boom");
            assert!(reason.contains("bad image format"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!run.status.is_success());
}

#[tokio::test]
async fn test_degraded_completion_jumps_to_entry() {
    let config = config().with_try_entry_on_error(true);

    let run = run(config, MockHost::new().fail_estimate("a-preload")).await;

    assert_eq!(
        run.status,
        RunStatus::Completed {
            generation: 1,
            degraded_from: Some(Phase::SizeCalculation)
        }
    );
    assert_eq!(
        run.events.messages(),
        vec![
            Msg::Init,
            Msg::CatalogsLoading,
            Msg::CatalogsLoaded,
            Msg::SizeCalculating,
            Msg::SizeCalculateFailed,
            Msg::EntryLoading,
            Msg::EntryLoaded,
        ]
    );
    assert_eq!(run.host.calls_to("activate:"), vec!["scenes/home"]);
    assert_eq!(status_of(&run.handle, "A"), CatalogStatus::SizeCalculateFailed);
}

#[tokio::test]
async fn test_failure_halts_without_degraded_completion() {
    let run = run(config(), MockHost::new().fail_estimate("a-preload")).await;

    assert_eq!(
        run.status,
        RunStatus::Halted {
            generation: 1,
            phase: Phase::SizeCalculation
        }
    );
    assert_eq!(run.events.messages().last(), Some(&Msg::SizeCalculateFailed));
    assert!(run.host.calls_to("preload:").is_empty());
    assert!(run.host.calls_to("activate:").is_empty());

    // Still halted: nothing else runs without a new Init
    tokio::task::yield_now().await;
    assert_eq!(run.handle.status(), run.status);
}

#[tokio::test]
async fn test_entry_activation_failure() {
    let run = run(config(), MockHost::new().fail_activate()).await;

    assert_eq!(
        run.status,
        RunStatus::EntryFailed {
            generation: 1,
            degraded_from: None
        }
    );
    assert_eq!(run.events.messages().last(), Some(&Msg::EntryLoadFailed));
}

#[tokio::test]
async fn test_conflicting_catalog_keeps_first_registration() {
    let config = LauncherConfig::new("home")
        .with_mandatory(CatalogDescriptor::new("K", "first").with_preload_label(""))
        .with_optional(CatalogDescriptor::new("K", "second"));

    let run = run(config, MockHost::new()).await;

    assert_eq!(run.host.calls_to("fetch:"), vec!["K"]);
    let states = run.handle.states();
    assert_eq!(states.len(), 1);
    let k = states.get("K").unwrap();
    assert_eq!(k.descriptor.url, "first");
    assert!(!k.is_optional);
    assert_eq!(k.status(), CatalogStatus::AssembliesLoaded);
    assert!(states.diagnostics().contains(&Diagnostic::Conflict {
        key: "K".to_string()
    }));
    assert!(run.status.is_success());
}

#[tokio::test]
async fn test_relaunch_clears_table_before_loading() {
    let run = run(config(), MockHost::new().fail_fetch("B")).await;
    assert!(!run.status.is_success());
    assert_eq!(run.handle.states().len(), 3);

    let sizes = Arc::new(Mutex::new(Vec::new()));
    {
        let sizes = sizes.clone();
        let handle = run.handle.clone();
        run.handle.bus().subscribe(Msg::CatalogsLoading, move |_, _| {
            sizes.lock().unwrap().push(handle.states().len());
        });
    }

    let generation = run.handle.relaunch();
    assert_eq!(generation, 2);
    let status = timeout(WAIT, run.handle.wait_for_run(generation))
        .await
        .expect("relaunch timed out");

    assert_eq!(
        status,
        RunStatus::Halted {
            generation: 2,
            phase: Phase::CatalogLoad
        }
    );
    assert_eq!(*sizes.lock().unwrap(), vec![0]);
    assert_eq!(run.handle.states().len(), 3);
    assert_eq!(run.host.calls_to("fetch:"), vec!["A", "B", "C", "A", "B", "C"]);
    assert!(run
        .events
        .messages_for(2)
        .ends_with(&[Msg::CatalogsLoading, Msg::CatalogsLoadFailed]));
}

#[tokio::test]
async fn test_init_abandons_in_flight_run() {
    let (host, entered) = MockHost::new().stall_fetch_once("A");
    let (host, caps) = host.into_capabilities();
    let handle = Launcher::new(config(), caps, MessageBus::new()).spawn();
    let events = handle.record_events();

    let first = handle.launch();
    timeout(WAIT, entered.notified())
        .await
        .expect("first fetch never started");
    assert_eq!(
        handle.status(),
        RunStatus::Running {
            generation: first,
            phase: Phase::CatalogLoad
        }
    );

    let second = handle.launch();
    let status = timeout(WAIT, handle.wait_for_run(second))
        .await
        .expect("second run timed out");

    assert!(status.is_success());
    assert_eq!(status.generation(), second);
    assert_eq!(host.calls_to("fetch:"), vec!["A", "A", "B", "C"]);

    let states = handle.states();
    assert_eq!(states.len(), 3);
    assert!(states
        .iter()
        .all(|state| state.status() == CatalogStatus::AssembliesLoaded));
    assert!(!events.messages_for(first).contains(&Msg::CatalogsLoaded));
}

#[tokio::test]
async fn test_debug_bus_from_config() {
    let mut config = config();
    config.debug_bus = true;
    let (_host, caps) = MockHost::new().into_capabilities();
    let bus = MessageBus::new();
    let launcher = Launcher::new(config, caps, bus.clone());

    assert!(bus.is_debug());
    assert_eq!(launcher.handle().status(), RunStatus::Idle);
}

#[tokio::test]
async fn test_shutdown_stops_processing() {
    let (host, caps) = MockHost::new().into_capabilities();
    let launcher = Launcher::new(config(), caps, MessageBus::new());
    let handle = launcher.handle();
    let task = tokio::spawn(launcher.run());

    handle.shutdown();
    timeout(WAIT, task)
        .await
        .expect("launcher did not stop")
        .unwrap();

    handle.launch();
    tokio::task::yield_now().await;
    assert!(host.calls().is_empty());
    assert_eq!(handle.status(), RunStatus::Idle);
}

#[tokio::test]
async fn test_mandatory_preload_failure_halts() {
    let run = run(config(), MockHost::new().fail_preload("a-preload")).await;

    assert_eq!(
        run.status,
        RunStatus::Halted {
            generation: 1,
            phase: Phase::AssetPreload
        }
    );
    assert_eq!(run.events.messages().last(), Some(&Msg::AssetsPreloadFailed));
    assert_eq!(status_of(&run.handle, "A"), CatalogStatus::AssetsPreloadFailed);
    assert_eq!(status_of(&run.handle, "B"), CatalogStatus::AssetsPreloaded);
    assert!(run.host.calls_to("module_bytes:").is_empty());
    assert!(run.host.calls_to("activate:").is_empty());
}

#[tokio::test]
async fn test_optional_preload_failure_does_not_block() {
    let run = run(config(), MockHost::new().fail_preload("c-preload")).await;

    assert!(run.status.is_success());
    assert!(run.events.messages().contains(&Msg::AssetsPreloaded));
    assert_eq!(status_of(&run.handle, "C"), CatalogStatus::AssetsPreloadFailed);
    assert!(run
        .handle
        .states()
        .diagnostics()
        .contains(&Diagnostic::OptionalCatalogFailed {
            key: "C".to_string(),
            phase: CatalogPhase::AssetPreload
        }));
}

#[tokio::test]
async fn test_init_clears_table_immediately() {
    let run = run(config(), MockHost::new().fail_fetch("C")).await;
    assert_eq!(run.handle.states().len(), 3);
    assert!(!run.handle.states().diagnostics().is_empty());

    // No await between publishing and reading: the launcher task has not run yet
    let generation = run.handle.launch();
    assert_eq!(generation, 2);
    let states = run.handle.states();
    assert!(states.is_empty());
    assert!(states.diagnostics().is_empty());
}

#[tokio::test]
async fn test_init_during_outcome_dispatch_runs_each_phase_once() {
    let bus = MessageBus::new();
    let restarted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let restarted = restarted.clone();
        // Registered ahead of the launcher, so it runs before the launcher's own handler
        bus.subscribe(Msg::CatalogsLoaded, move |bus, _| {
            if !restarted.swap(true, std::sync::atomic::Ordering::SeqCst) {
                bus.publish(Msg::Init);
            }
        });
    }

    let (host, caps) = MockHost::new().into_capabilities();
    let launcher = Launcher::new(config(), caps, bus);
    let handle = launcher.handle();
    let events = handle.record_events();
    let task = tokio::spawn(launcher.run());

    assert_eq!(handle.launch(), 1);
    let status = timeout(WAIT, handle.wait_for_run(2))
        .await
        .expect("second run timed out");
    assert!(status.is_success());
    assert_eq!(status.generation(), 2);

    // Drain every queued command before inspecting
    handle.shutdown();
    timeout(WAIT, task)
        .await
        .expect("launcher did not stop")
        .unwrap();

    let count = |msg: Msg| events.messages().iter().filter(|m| **m == msg).count();
    assert_eq!(count(Msg::SizeCalculating), 1);
    assert_eq!(count(Msg::EntryLoading), 1);
    assert_eq!(count(Msg::EntryLoaded), 1);
    assert_eq!(host.calls_to("activate:"), vec!["scenes/home"]);
    assert_eq!(handle.status(), status);
}
