//! `iopanel` binary.
//!
//! ```bash
//! iopanel --simulate                       # run until Ctrl-C, logging events
//! iopanel --simulate --scan                # one scan with the configured defaults, exported
//! iopanel --simulate --align               # align both piezo stages and exit
//! iopanel --config lab.toml --log-level debug --log-file iopanel.log --simulate
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use iopanel::alignment::AlignmentEvent;
use iopanel::bus::{Delivery, Event};
use iopanel::camera::CameraEvent;
use iopanel::config::{AppConfig, DEFAULT_CONFIG_PATH};
use iopanel::export::ExportEvent;
use iopanel::messages::{ExportRequest, LabCommand};
use iopanel::scan::{ScanEvent, ScanStatus};
use iopanel::{logging, EventBus, EventReceiver, Instruments, Lab, LabClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "iopanel", version, about = "Lab instrument control core", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level or filter directive; overrides RUST_LOG and the configuration.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Use simulated instruments.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Run one scan with the configured defaults, export it and exit.
    #[arg(long, default_value_t = false)]
    scan: bool,

    /// Align the piezo stages with the configured settings and exit.
    #[arg(long, default_value_t = false, conflicts_with = "scan")]
    align: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.config.exists() {
        bail!("configuration file {} not found", args.config.display());
    }
    let config = AppConfig::load_from(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let filter = logging::filter(args.log_level.as_deref(), &config.logging.level)?;
    let log_file = args.log_file.clone().or_else(|| config.logging.file.clone());
    logging::init(filter, log_file.as_deref())?;
    info!(name = %config.application.name, config = %args.config.display(), "starting");

    if !args.simulate {
        bail!("no hardware adapters are built into this binary; run with --simulate");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("iopanel-worker")
        .build()
        .context("failed to build the tokio runtime")?;

    let (bus, mut events) = EventBus::new();
    let lab = {
        let _guard = runtime.enter();
        let instruments = Instruments::simulated(&config);
        Lab::new(runtime.handle().clone(), bus, config, instruments)?
    };
    let (client, lab_task) = lab.spawn();

    let outcome = if args.scan {
        run_single_scan(&runtime, &client, &mut events)
    } else if args.align {
        run_alignment(&client, &mut events)
    } else {
        run_until_interrupted(&runtime, &mut events);
        Ok(())
    };

    if let Err(err) = client.send_blocking(LabCommand::shutdown()) {
        debug!(error = %err, "lab already stopped");
    }
    if let Err(err) = runtime.block_on(lab_task) {
        error!(error = %err, "lab task did not exit cleanly");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!(dropped_frames = events.dropped_frames(), "stopped");
    outcome
}

/// Drains the bus on this thread until Ctrl-C.
fn run_until_interrupted(runtime: &tokio::runtime::Runtime, events: &mut EventReceiver) {
    runtime.block_on(async {
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                delivery = events.next() => match delivery {
                    Some(delivery) => report(&delivery),
                    None => break,
                },
                _ = &mut interrupt => {
                    info!("interrupt received");
                    break;
                }
            }
        }
    });
}

/// Starts a scan, waits for it, exports it. Ctrl-C aborts the scan.
fn run_single_scan(
    runtime: &tokio::runtime::Runtime,
    client: &LabClient,
    events: &mut EventReceiver,
) -> Result<()> {
    let run = client.send_blocking(LabCommand::start_scan(None))??;
    info!(run = %run, "scan started");
    {
        let client = client.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, aborting scan");
                let _ = client.abort_scan().await;
            }
        });
    }

    let (status, failure) = wait_for(events, |event| match event {
        Event::Scan(ScanEvent::Finished {
            run: finished,
            status,
            failure,
            ..
        }) if *finished == run => Some((*status, failure.clone())),
        _ => None,
    })?;
    if status == ScanStatus::Failed {
        bail!("scan {} failed: {}", run, failure.unwrap_or_default());
    }

    let request = ExportRequest {
        run: Some(run),
        ..ExportRequest::default()
    };
    client.send_blocking(LabCommand::export(request))??;
    let export = wait_for(events, |event| match event {
        Event::Export(export) if export.run == run => Some(export.clone()),
        _ => None,
    })?;
    summarize_export(run, &export)
}

/// Aligns both stages and waits for the result.
fn run_alignment(client: &LabClient, events: &mut EventReceiver) -> Result<()> {
    client.send_blocking(LabCommand::start_alignment(None))??;
    let finished = wait_for(events, |event| match event {
        Event::Alignment(
            finished @ (AlignmentEvent::Aligned { .. }
            | AlignmentEvent::Failed { .. }
            | AlignmentEvent::Cancelled(_)),
        ) => Some(finished.clone()),
        _ => None,
    })?;
    match finished {
        AlignmentEvent::Aligned { power_dbm } => {
            println!("{:.2} dBm", power_dbm);
            Ok(())
        }
        AlignmentEvent::Failed { message, .. } => bail!("alignment failed: {}", message),
        _ => bail!("alignment cancelled"),
    }
}

/// Reports deliveries until `pick` matches one.
fn wait_for<T>(events: &mut EventReceiver, mut pick: impl FnMut(&Event) -> Option<T>) -> Result<T> {
    loop {
        let Some(delivery) = events.blocking_next() else {
            bail!("event bus closed");
        };
        report(&delivery);
        if let Delivery::Event(envelope) = &delivery {
            if let Some(value) = pick(&envelope.event) {
                return Ok(value);
            }
        }
    }
}

fn summarize_export(run: Uuid, export: &ExportEvent) -> Result<()> {
    for path in &export.written {
        println!("{}", path.display());
    }
    if export.failed.is_empty() {
        return Ok(());
    }
    let formats: Vec<_> = export.failed.iter().map(|(format, _)| format.as_str()).collect();
    bail!("run {}: export failed for {}", run, formats.join(", "))
}

fn report(delivery: &Delivery) {
    let envelope = match delivery {
        Delivery::Frame(frame) => {
            trace!(camera = %frame.camera, sequence = frame.sequence, fps = frame.fps, "frame");
            return;
        }
        Delivery::Event(envelope) => envelope,
    };
    match &envelope.event {
        Event::Task(task) => trace!(device = %task.device, label = %task.label, status = ?task.status, "task"),
        Event::Scan(ScanEvent::StatusChanged { run, from, to, .. }) => {
            info!(run = %run, from = %from, to = %to, "scan status")
        }
        Event::Scan(ScanEvent::Progress {
            run,
            percent,
            sample_count,
            ..
        }) => debug!(run = %run, percent = %format!("{:.1}", percent), samples = sample_count, "scan progress"),
        Event::Scan(ScanEvent::Finished {
            run,
            status,
            sample_count,
            ..
        }) => info!(run = %run, status = %status, samples = sample_count, "scan finished"),
        Event::Camera(CameraEvent::StateChanged { camera, from, to }) => {
            info!(camera = %camera, from = ?from, to = ?to, "camera state")
        }
        Event::Camera(CameraEvent::Discovered(cameras)) => info!(count = cameras.len(), "cameras discovered"),
        Event::Camera(other) => debug!(event = ?other, "camera"),
        Event::Power(data) => debug!(pout = data.pout, "power reading"),
        Event::Export(export) => info!(run = %export.run, files = export.written.len(), "export finished"),
        Event::Alignment(AlignmentEvent::Aligned { power_dbm }) => info!(power_dbm, "stages aligned"),
        Event::Alignment(AlignmentEvent::Mapped(map)) => {
            info!(stage = %map.stage, peak = ?map.peak(), "power map finished")
        }
        Event::Alignment(other) => debug!(event = ?other, "alignment"),
        Event::Error(report) => error!("{}", report),
    }
}
