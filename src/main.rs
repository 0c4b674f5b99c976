//! Command-line front end for chr_daq.
//!
//! Runs against the simulated sensor:
//! ```bash
//! chr_daq exec "SHZ 2000"
//! chr_daq monitor --seconds 5
//! chr_daq scan --lines 10 --samples 200 --json scan.json
//! chr_daq trigger-check --start 0 --stop 100 --interval 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chr_daq::config::Settings;
use chr_daq::consumer::{AxisLimits, MemorySink};
use chr_daq::pacing::StopSignal;
use chr_daq::protocol::Command;
use chr_daq::scan::{ScanPlan, ScanState, ScanTrigger};
use chr_daq::session::{focus_hint, ConnectionState, Consumer, Session};
use chr_daq::sim::{SimProfile, SimulatedSensor};
use chr_daq::trigger_loss::TriggerLossPlan;

#[derive(Parser)]
#[command(name = "chr_daq")]
#[command(about = "Acquisition console for confocal chromatic sensors", long_about = None)]
struct Cli {
    /// Settings file; `CHR_DAQ_` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Simulated measuring channels.
    #[arg(long, global = true, default_value = "1")]
    channels: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one console command and print the response
    Exec {
        /// Command text, e.g. "SHZ 2000" or "SODX?"
        text: String,
    },

    /// Print live values
    Monitor {
        #[arg(long, default_value = "5")]
        seconds: u64,
    },

    /// Run a raster scan
    Scan {
        #[arg(long, default_value = "10")]
        lines: usize,
        #[arg(long, default_value = "200")]
        samples: usize,
        /// Trigger each sample from the encoder instead of free running
        #[arg(long)]
        encoder: bool,
        /// Write the assembled images as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Verify encoder triggers and write a report
    TriggerCheck {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        stop: f64,
        #[arg(long)]
        interval: f64,
        /// Encoder axis, 0 = x, 1 = y, 2 = z
        #[arg(long, default_value = "0")]
        axis: usize,
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        limit: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::load()?,
    };
    let library = Arc::new(SimulatedSensor::new(SimProfile {
        channel_count: cli.channels,
        noise: true,
        ..SimProfile::default()
    }));

    let (session, _state) = Session::connect(library, settings).await;
    let mut session = session.context("connecting to the sensor")?;

    let result = run(&mut session, cli.command).await;
    if let Err(err) = session.disconnect().await {
        warn!(error = %err, "disconnect reported errors");
    }
    result
}

async fn run(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::Exec { text } => {
            let command = Command::parse(&text)?;
            let response = session.exec_blocking(command).await?;
            let args: Vec<String> = response.args.iter().map(ToString::to_string).collect();
            println!("{} {}", response.command_id, args.join(" "));
        }
        Commands::Monitor { seconds } => monitor(session, Duration::from_secs(seconds)).await?,
        Commands::Scan {
            lines,
            samples,
            encoder,
            json,
        } => {
            let mut plan = ScanPlan::new(lines, samples);
            plan.poll = session.settings().acquisition.scan_poll;
            plan.line_timeout = session.settings().acquisition.scan_line_timeout;
            if encoder {
                plan.trigger = ScanTrigger::Encoder {
                    axis: 0,
                    start: 0.0,
                    stop: (lines * samples) as f64,
                    interval: 1.0,
                };
            }
            let controller = session.scan_controller(plan);
            let outcome = session.run_scan(controller).await;
            if let ScanState::Failed(reason) = &outcome.state {
                bail!("scan failed: {reason}");
            }
            let result = &outcome.result;
            info!(
                lines = result.lines_completed,
                samples = result.total_samples(),
                elapsed = ?result.elapsed,
                "scan complete"
            );
            for image in result.images.values() {
                println!("{} [{}] {}x{}", image.name, image.unit, image.rows, image.columns);
            }
            if let Some(path) = json {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                serde_json::to_writer_pretty(std::io::BufWriter::new(file), result)?;
                println!("scan written to {}", path.display());
            }
        }
        Commands::TriggerCheck {
            start,
            stop,
            interval,
            axis,
            limit,
        } => {
            let plan = TriggerLossPlan::new(start, stop, interval).with_axis(axis);
            let cancel = StopSignal::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.trigger();
                }
            });
            let report = session
                .run_trigger_check(plan, Duration::from_secs(limit), cancel)
                .await?;
            let path = report.save(&session.settings().acquisition.report_dir)?;
            for line in report.summary() {
                println!("{line}");
            }
            println!("report written to {}", path.display());
        }
    }
    Ok(())
}

async fn monitor(session: &mut Session, span: Duration) -> Result<()> {
    let counter_sink = MemorySink::new(AxisLimits::new(0.0, 70_000.0));
    let distance_sink = MemorySink::new(session.distance_limits());
    let counter = session.spawn_sample_rate_monitor(counter_sink.clone())?;
    let distance = session.spawn_distance_monitor(distance_sink.clone())?;
    let full_scale = session.device_settings().full_scale;
    let mut state = session.state();
    let mut latest = session.latest();
    let mut console = session.take_console();
    session.exec_text("SHZ?").await?;

    let deadline = tokio::time::sleep(span);
    tokio::pin!(deadline);
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut values = latest.take();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = latest.changed() => values = changed?,
            _ = tick.tick() => {
                if let Some(distance) = values.distance {
                    println!(
                        "counter={:?} distance={distance:.3} intensity={:?} focus={}",
                        values.sample_counter,
                        values.intensity,
                        focus_hint(distance, full_scale),
                    );
                }
            }
            Some(line) = async {
                match console.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => println!("> {line}"),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Failed {
                    bail!("connection lost");
                }
            }
        }
    }

    session.control(Consumer::SampleRate).stop();
    session.control(Consumer::Distance).stop();
    counter.abort();
    distance.abort();
    info!(
        counter_points = counter_sink.snapshot().len(),
        distance_points = distance_sink.snapshot().len(),
        "monitor finished"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
