//! Launcher
//!
//! Command-line host for the catalog launcher: one-shot runs with a printed
//! report, a long-lived server exposing status and events, and config checks.

mod api;
mod host;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use launcher_core::capabilities::{Capabilities, StaticEnvironment};
use launcher_core::config::{config_path, LauncherConfig};
use launcher_core::launcher::{Launcher, LauncherEvent, LauncherHandle, MessageBus, RunStatus};
use launcher_core::state::CatalogStates;

use api::{launcher_routes, AppState, CatalogSummary};
use host::HostCapabilities;

#[derive(Parser)]
#[command(name = "launcher")]
#[command(version, about = "Bootstraps an application from its content catalogs")]
struct Args {
    /// Log at debug level, including bus traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Run the pipeline once and print a report (default)
    Run {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Run the pipeline and serve its status over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Validate the config and print the resolved catalog urls
    Check {
        #[command(flatten)]
        launch: LaunchArgs,
    },
}

#[derive(clap::Args, Clone, Debug)]
struct LaunchArgs {
    /// Config file; falls back to $LAUNCHER_CONFIG, then ./launcher.json
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Substituted for [BuildTarget] in catalog urls
    #[arg(long, default_value_t = default_build_target())]
    build_target: String,
    /// Substituted for [Version] in catalog urls
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    app_version: String,
    /// Where preloaded assets are cached
    #[arg(long, default_value = ".launcher-cache")]
    cache_dir: PathBuf,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            config: None,
            build_target: default_build_target(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            cache_dir: PathBuf::from(".launcher-cache"),
        }
    }
}

impl LaunchArgs {
    fn environment(&self) -> StaticEnvironment {
        StaticEnvironment::new(&self.build_target, &self.app_version)
    }

    async fn load_config(&self) -> anyhow::Result<LauncherConfig> {
        let path = config_path(self.config.clone());
        tracing::info!(path = %path.display(), "loading launcher config");
        LauncherConfig::load(&path).await
    }

    /// Host capabilities, reset on every `Init` published on `bus`
    fn capabilities(&self, bus: &MessageBus) -> Capabilities {
        let host = Arc::new(HostCapabilities::new(&self.cache_dir));
        host.attach(bus);
        Capabilities::from_host(host, Arc::new(self.environment()))
    }
}

fn default_build_target() -> String {
    match std::env::consts::OS {
        "windows" => "StandaloneWindows64",
        "macos" => "StandaloneOSX",
        "linux" => "StandaloneLinux64",
        "android" => "Android",
        "ios" => "iOS",
        other => other,
    }
    .to_string()
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

// === Commands ===

/// Bus for a launcher; `--verbose` turns on bus traffic logging
fn launch_bus(verbose: bool) -> MessageBus {
    MessageBus::with_debug(verbose)
}

async fn run_once(launch: LaunchArgs, verbose: bool) -> anyhow::Result<()> {
    let config = launch.load_config().await?;
    let bus = launch_bus(verbose);
    let caps = launch.capabilities(&bus);
    let handle = Launcher::new(config, caps, bus).spawn();
    let events = handle.record_events();

    let status = handle.launch_and_wait().await;
    print_timeline(&events.events());
    print_summary(&handle.states());
    handle.shutdown();

    match status {
        RunStatus::Completed {
            degraded_from: None,
            ..
        } => {
            println!("launch completed");
            Ok(())
        }
        RunStatus::Completed {
            degraded_from: Some(phase),
            ..
        } => {
            println!("launch completed in degraded mode ({} failed)", phase);
            Ok(())
        }
        RunStatus::Halted { phase, .. } => anyhow::bail!("launch halted: {} failed", phase),
        RunStatus::EntryFailed { .. } => anyhow::bail!("launch failed: entry activation failed"),
        other => anyhow::bail!("launch did not finish: {:?}", other),
    }
}

async fn serve(port: u16, launch: LaunchArgs, verbose: bool) -> anyhow::Result<()> {
    let config = launch.load_config().await?;
    let bus = launch_bus(verbose);
    let caps = launch.capabilities(&bus);
    let handle = Launcher::new(config, caps, bus).spawn();
    let state = AppState::new(handle.clone());
    spawn_status_logger(&handle);

    let generation = handle.launch();
    tracing::info!(generation, "initial launch started");

    let app = Router::new()
        .nest("/api/v1/launcher", launcher_routes())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "launcher server listening");
    println!("Launcher server running at http://{}", addr);
    println!("   Status:   GET  /api/v1/launcher/status");
    println!("   Relaunch: POST /api/v1/launcher/relaunch");
    println!("   Events:   GET  /api/v1/launcher/events (SSE)");

    axum::serve(listener, app).await?;
    handle.shutdown();
    Ok(())
}

async fn check(launch: LaunchArgs) -> anyhow::Result<()> {
    let config = launch.load_config().await?;
    let env = launch.environment();

    println!("entry: {}", config.entry);
    println!(
        "try entry on error: {}",
        if config.try_entry_on_error { "yes" } else { "no" }
    );
    for (descriptor, is_optional) in config.descriptors() {
        println!(
            "  {:<9} {:<20} {}",
            if is_optional { "optional" } else { "mandatory" },
            descriptor.key,
            descriptor.resolve_url(&env)
        );
    }
    println!("config ok");
    Ok(())
}

fn spawn_status_logger(handle: &LauncherHandle) {
    let mut status_rx = handle.subscribe_status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() {
                tracing::info!(?status, "run finished");
            }
        }
    });
}

// === Report ===

fn print_timeline(events: &[LauncherEvent]) {
    println!("Timeline:");
    for event in events {
        println!(
            "  {}  [run {}] {:?}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.generation,
            event.msg
        );
    }
}

fn print_summary(states: &CatalogStates) {
    println!("Catalogs:");
    for summary in states.iter().map(CatalogSummary::from) {
        let kind = if summary.optional { "optional" } else { "mandatory" };
        println!(
            "  {:<20} {:<9} {:?} ({} bytes to download)",
            summary.key, kind, summary.status, summary.download_size
        );
        if !summary.loaded_modules.is_empty() {
            println!("    modules: {}", summary.loaded_modules.join(", "));
        }
        if let Some(err) = &summary.error {
            println!("    error: {}", err);
        }
    }
    for diagnostic in states.diagnostics() {
        println!("  ! {:?}", diagnostic);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let command = args.command.unwrap_or(CliCommand::Run {
        launch: LaunchArgs::default(),
    });
    match command {
        CliCommand::Run { launch } => run_once(launch, args.verbose).await,
        CliCommand::Serve { port, launch } => serve(port, launch, args.verbose).await,
        CliCommand::Check { launch } => check(launch).await,
    }
}
