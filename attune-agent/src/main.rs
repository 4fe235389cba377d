//! The attune agent daemon: wires the reconciliation engine, the convergence
//! detector, the swap coordinator and the store together under one `run`
//! command, and owns process-level concerns (working prefix, signals,
//! max-runtime watchdog, ordered teardown).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{miette, IntoDiagnostic, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use attune::converger::{ConvergedCallback, ConvergerHandle};
use attune::events::{Event, EventKind};
use attune::store::{MemStore, StoreHandle};
use attune::swap::SwapCoordinator;

#[derive(Parser)]
#[command(name = "attune", version, about = "distributed configuration convergence agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent.
    #[command(alias = "r")]
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Graph definition to run.
    #[arg(short, long, env = "ATTUNE_FILE")]
    file: Option<PathBuf>,

    /// Do not recompile when the definition file changes.
    #[arg(long)]
    no_watch: bool,

    /// Host identity; detected when omitted.
    #[arg(long)]
    hostname: Option<String>,

    /// Cluster seed endpoints, comma separated.
    #[arg(short, long, env = "ATTUNE_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Globally force all resources into no-op mode.
    #[arg(long)]
    noop: bool,

    /// Exit after approximately this many seconds in a converged state;
    /// negative disables auto-exit.
    #[arg(short = 't', long, env = "ATTUNE_CONVERGED_TIMEOUT", default_value_t = -1)]
    converged_timeout: i64,

    /// Exit after a maximum of approximately this many seconds; 0 disables.
    #[arg(long, env = "ATTUNE_MAX_RUNTIME", default_value_t = 0)]
    max_runtime: u64,

    /// Path to the working prefix directory.
    #[arg(long, env = "ATTUNE_PREFIX", conflicts_with = "tmp_prefix")]
    prefix: Option<PathBuf>,

    /// Use a pseudo-random, temporary working prefix.
    #[arg(long)]
    tmp_prefix: bool,

    /// Fall back to a temporary prefix when the main one is unavailable.
    #[arg(long)]
    allow_tmp_prefix: bool,

    /// Remote graph definitions to bootstrap over ssh.
    #[arg(long)]
    remote: Vec<String>,

    /// Output file for graphviz data of the active graph.
    #[arg(short, long)]
    graphviz: Option<PathBuf>,
}

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn init_miette() {
    miette::set_panic_hook();
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    init_tracing();
    init_miette();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> miette::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "this is attune");

    let (prefix, _tmp_guard) = resolve_prefix(&args)?;
    info!(prefix = %prefix.display(), "working prefix");

    let hostname = args.hostname.clone().unwrap_or_else(detect_hostname);
    info!(%hostname, "host identity");

    // anything that wants the process to stop pushes a reason here
    let (exit_tx, exit_rx) = flume::bounded::<&'static str>(2);

    let timeout = u64::try_from(args.converged_timeout)
        .ok()
        .map(Duration::from_secs);
    let converged_exit = exit_tx.clone();
    let converged_after = args.converged_timeout;
    let callback: ConvergedCallback = Box::new(move |converged| {
        if converged {
            info!(
                seconds = converged_after,
                "converged, requesting clean exit"
            );
            let _ = converged_exit.try_send("converged");
        }
        Ok(())
    });
    let converger = ConvergerHandle::spawn(timeout, callback);
    if args.file.is_none() {
        // nothing to reconcile: an empty agent converges vacuously
        converger.resume();
    }

    let store: StoreHandle = Arc::new(MemStore::new());
    if !args.seeds.is_empty() {
        warn!(seeds = ?args.seeds, "cluster seeds are ignored by the in-process store");
    }
    store
        .startup()
        .await
        .wrap_err("store startup failed")?;

    if !args.remote.is_empty() {
        warn!(
            count = args.remote.len(),
            local_urls = ?store.local_client_urls(),
            "remote bootstrapping is not part of this build, ignoring --remote"
        );
    }

    let watch_cancel = CancellationToken::new();
    let (swap_exit_tx, swap_exit_rx) = flume::bounded::<Event>(1);
    let coordinator = SwapCoordinator {
        source: args.file.clone(),
        watch_source: !args.no_watch,
        compile_interval: None,
        store: store.clone(),
        converger: converger.clone(),
        hostname,
        noop: args.noop,
        graphviz: args.graphviz.clone(),
        exit_rx: swap_exit_rx,
        watch_cancel: watch_cancel.clone(),
    };
    let swap_task = tokio::spawn(coordinator.run());

    if args.max_runtime > 0 {
        let tx = exit_tx.clone();
        let secs = args.max_runtime;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(seconds = secs, "max runtime reached");
            let _ = tx.try_send("max-runtime");
        });
    }

    info!("running...");
    let reason = wait_for_shutdown(exit_rx).await;
    info!(reason, "shutting down");

    // teardown order: config watchers, executor (via the swap loop), store
    watch_cancel.cancel();
    let (exit_event, ack) = Event::with_ack(EventKind::Exit);
    if swap_exit_tx.send_async(exit_event).await.is_ok() {
        let _ = ack.wait().await;
    }
    match swap_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "swap loop exited with error"),
        Err(err) => warn!(%err, "swap loop panicked"),
    }
    let _ = converger.exit().await;
    if let Err(err) = store.destroy().await {
        warn!(%err, "store destroy failed");
    }
    info!("goodbye");
    Ok(())
}

/// Resolve the working prefix, creating it if needed and falling back to a
/// temporary one when allowed. The returned guard keeps a temporary prefix
/// alive for the process lifetime.
fn resolve_prefix(args: &RunArgs) -> miette::Result<(PathBuf, Option<tempfile::TempDir>)> {
    let tmp = || {
        tempfile::Builder::new()
            .prefix("attune-")
            .tempdir()
            .into_diagnostic()
            .wrap_err("cannot create temporary working prefix")
    };
    if args.tmp_prefix {
        let dir = tmp()?;
        warn!("working prefix is temporary");
        return Ok((dir.path().to_path_buf(), Some(dir)));
    }
    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| PathBuf::from("/var/lib/attune"));
    match std::fs::create_dir_all(&prefix) {
        Ok(()) => Ok((prefix, None)),
        Err(err) if args.allow_tmp_prefix => {
            warn!(%err, prefix = %prefix.display(), "prefix unavailable, using a temporary one");
            let dir = tmp()?;
            Ok((dir.path().to_path_buf(), Some(dir)))
        }
        Err(err) => Err(miette!(
            "cannot create working prefix {}: {err}",
            prefix.display()
        )),
    }
}

fn detect_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "localhost".to_string()
}

/// Block until a signal or an internal exit request arrives.
async fn wait_for_shutdown(exit_rx: flume::Receiver<&'static str>) -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "cannot install SIGTERM handler");
            return exit_rx.recv_async().await.unwrap_or("exit");
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = sigterm.recv() => "sigterm",
        reason = exit_rx.recv_async() => reason.unwrap_or("exit"),
    }
}
