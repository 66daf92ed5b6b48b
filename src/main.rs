use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portwatch_rs::banner::TcpBannerGrabber;
use portwatch_rs::config::{AppConfig, ScanConfig};
use portwatch_rs::decision::DecisionEngine;
use portwatch_rs::engine::EngineSet;
use portwatch_rs::hub::ProgressHub;
use portwatch_rs::netdetect::SystemNetworkFacts;
use portwatch_rs::notify::{DeliveryWorker, LogNotifier, Notifier, TelegramNotifier};
use portwatch_rs::orchestrator::Orchestrator;
use portwatch_rs::server::{self, AppState};
use portwatch_rs::store;
use portwatch_rs::types::{ProgressEvent, ScanResult, ScanRun};

/// portwatch-rs: port-discovery orchestrator around masscan and nmap.
#[derive(Debug, Parser)]
#[command(
    name = "portwatch-rs",
    version,
    about = "Port-discovery orchestrator: scoped targets, masscan/nmap selection, result history and live progress.",
    long_about = None
)]
struct Cli {
    /// TOML configuration file (defaults to ./portwatch.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP job-control surface and the notification worker.
    Serve {
        /// Listen address, overrides `webui.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run one scan in the foreground. Ctrl+C cancels it.
    Scan {
        #[command(flatten)]
        scan: ScanArgs,

        /// Write this run and its findings as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the resolved plan without scanning.
    Plan {
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// List stored findings.
    Results,
    /// List recent scan runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show finding and host counts.
    Stats,
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Comma-separated IPs, CIDRs or hostnames. Empty means auto-detect the local /24.
    #[arg(long, value_delimiter = ',')]
    targets: Vec<String>,

    /// Port spec (`22,80-90`), `auto` or `top`.
    #[arg(long)]
    ports: Option<String>,

    /// Network interface handed to the fast engine.
    #[arg(long)]
    interface: Option<String>,

    /// Fast engine packet rate.
    #[arg(long)]
    rate: Option<u32>,
}

impl ScanArgs {
    fn apply(self, mut cfg: ScanConfig) -> ScanConfig {
        if !self.targets.is_empty() {
            cfg.targets = self.targets;
        }
        if let Some(p) = self.ports {
            cfg.ports = p;
        }
        if self.interface.is_some() {
            cfg.interface = self.interface;
        }
        if let Some(r) = self.rate {
            cfg.rate = r;
        }
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portwatch_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen } => serve(cfg, listen).await,
        Command::Scan { scan, output } => run_scan(cfg, scan, output).await,
        Command::Plan { scan } => {
            let decision = DecisionEngine::new(Arc::new(SystemNetworkFacts));
            let plan = decision.plan(&scan.apply(cfg.scan))?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Results => {
            let store = store::open(&cfg.storage).await?;
            print_results_table(&store.list_results().await?);
            Ok(())
        }
        Command::Runs { limit } => {
            let store = store::open(&cfg.storage).await?;
            print_runs_table(&store.list_scan_runs(limit).await?);
            Ok(())
        }
        Command::Stats => {
            let store = store::open(&cfg.storage).await?;
            println!("{}", serde_json::to_string_pretty(&store.get_stats().await?)?);
            Ok(())
        }
    }
}

async fn build_orchestrator(cfg: &AppConfig) -> Result<Orchestrator> {
    let store = store::open(&cfg.storage)
        .await
        .context("failed to open result store")?;
    Ok(Orchestrator::new(
        DecisionEngine::new(Arc::new(SystemNetworkFacts)),
        EngineSet::from_config(&cfg.engines),
        store,
        Arc::new(TcpBannerGrabber),
        ProgressHub::new(),
    ))
}

async fn serve(cfg: AppConfig, listen: Option<String>) -> Result<()> {
    let orchestrator = build_orchestrator(&cfg).await?;
    let shutdown = CancellationToken::new();

    if cfg.notify.enabled {
        let notifier: Arc<dyn Notifier> = match &cfg.notify.telegram {
            Some(tg) => {
                info!(chat_id = %tg.chat_id, "delivering notifications to telegram");
                Arc::new(TelegramNotifier::new(tg).context("failed to build telegram client")?)
            }
            None => Arc::new(LogNotifier),
        };
        let worker = DeliveryWorker::new(Arc::clone(orchestrator.store()), notifier, &cfg.notify);
        tokio::spawn(worker.run(shutdown.clone()));
    }

    let bind = listen.unwrap_or_else(|| cfg.webui.listen.clone());
    let state = AppState::new(orchestrator.clone(), cfg.scan.clone(), &cfg.webui.auth_token);
    let app = server::router(state, &cfg.webui.assets_dir);

    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        println!("Shutting down...");
        orchestrator.cancel();
        stop.cancel();
    });

    server::serve(&bind, app, shutdown).await
}

async fn run_scan(cfg: AppConfig, args: ScanArgs, output: Option<PathBuf>) -> Result<()> {
    let scan_cfg = args.apply(cfg.scan.clone());
    let orchestrator = build_orchestrator(&cfg).await?;

    let mut progress = orchestrator.hub().subscribe();
    let progress_id = progress.id();
    let printer = tokio::spawn(async move {
        while let Some(payload) = progress.recv().await {
            if let Ok(ev) = serde_json::from_str::<ProgressEvent>(&payload) {
                eprintln!("[{:>3}%] {}", ev.percent, ev.message);
            }
        }
    });

    let canceller = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling scan...");
            canceller.cancel();
        }
    });

    let outcome = orchestrator.start(scan_cfg).await;
    ctrl_c.abort();
    // Closing the channel lets the printer drain what is buffered and exit.
    orchestrator.hub().unsubscribe(progress_id);
    let _ = printer.await;
    let run = outcome?;

    let findings: Vec<ScanResult> = orchestrator
        .store()
        .list_results()
        .await?
        .into_iter()
        .filter(|r| r.last_seen >= run.started_at)
        .collect();

    println!(
        "\nRun {} {} via {}: {} open, {} new",
        run.id, run.status.as_str(), run.engine, run.found, run.new_found
    );
    print_results_table(&findings);

    if let Some(path) = output.as_deref() {
        if let Err(e) = write_run_json(path, &run, &findings) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

fn print_results_table(results: &[ScanResult]) {
    let host_w = results.iter().map(|r| r.host.len()).max().unwrap_or(0).max("host".len());
    let svc_w = results
        .iter()
        .map(|r| r.service.as_deref().unwrap_or("").len())
        .max()
        .unwrap_or(0)
        .max("service".len());
    let port_w = "port".len().max(5);
    let proto_w = "proto".len();

    println!("\nOpen ports: {}", results.len());
    println!(
        "{:<host_w$}  {:>port_w$}  {:<proto_w$}  {:<svc_w$}  banner",
        "host", "port", "proto", "service"
    );
    println!(
        "{:-<host_w$}  {:-<port_w$}  {:-<proto_w$}  {:-<svc_w$}  {:-<6}",
        "", "", "", "", ""
    );
    for r in results {
        let mut bsnip = r.banner.clone().unwrap_or_default();
        if bsnip.len() > 60 {
            let mut cut = 60;
            while !bsnip.is_char_boundary(cut) {
                cut -= 1;
            }
            bsnip.truncate(cut);
        }
        println!(
            "{:<host_w$}  {:>port_w$}  {:<proto_w$}  {:<svc_w$}  {}",
            r.host,
            r.port,
            r.protocol,
            r.service.as_deref().unwrap_or(""),
            bsnip
        );
    }
}

fn print_runs_table(runs: &[ScanRun]) {
    println!(
        "{:<36}  {:<25}  {:<6}  {:<9}  {:>5}  {:>5}  targets",
        "id", "started", "engine", "status", "found", "new"
    );
    for r in runs {
        let started = r
            .started_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        println!(
            "{:<36}  {:<25}  {:<6}  {:<9}  {:>5}  {:>5}  {}",
            r.id,
            started,
            r.engine.as_str(),
            r.status.as_str(),
            r.found,
            r.new_found,
            r.targets_summary()
        );
    }
}

fn write_run_json(path: &Path, run: &ScanRun, findings: &[ScanResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &json!({ "run": run, "results": findings }))?;
    Ok(())
}
