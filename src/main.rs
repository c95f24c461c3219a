use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use road_survey::location::replay_fixes;
use road_survey::session::SessionRequest;
use road_survey::sim::{self, SimulatedTrack, SimulatorConfig};
use road_survey::{
    JsonLinesStore, MemorySessionRepository, SurveyConfig, SurveyService, SurveySummary, TcpTransport,
};

type Service = SurveyService<TcpTransport, JsonLinesStore, MemorySessionRepository>;

#[derive(Parser, Debug)]
#[command(name = "road_survey")]
#[command(about = "Road survey telemetry: device link, GPS fusion and batched storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a survey from a device reachable over TCP
    Run {
        /// Device address, host:port
        #[arg(long)]
        device: String,

        /// JSON-lines file of location fixes to replay as the GPS source
        #[arg(long)]
        gps_replay: Option<PathBuf>,

        /// Output directory
        #[arg(long, default_value = "survey_sessions")]
        output: PathBuf,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Duration in seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        duration: u64,

        /// Survey name
        #[arg(long, default_value = "survey")]
        name: String,
    },
    /// Run a survey against the built-in simulated device
    Simulate {
        /// Readings the simulated device sends before going quiet
        #[arg(long, default_value = "200")]
        readings: u64,

        /// Stop publishing GPS fixes after this many readings
        #[arg(long)]
        gps_dropout_after: Option<u64>,

        /// Milliseconds between simulated readings
        #[arg(long, default_value = "50")]
        interval_ms: u64,

        /// Output directory
        #[arg(long, default_value = "survey_sessions")]
        output: PathBuf,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            device,
            gps_replay,
            output,
            config,
            duration,
            name,
        } => run(device, gps_replay, output, config, duration, name).await,
        Command::Simulate {
            readings,
            gps_dropout_after,
            interval_ms,
            output,
            config,
        } => simulate(readings, gps_dropout_after, interval_ms, output, config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SurveyConfig> {
    match path {
        Some(path) => SurveyConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(SurveyConfig::default()),
    }
}

async fn open_service(config: &SurveyConfig, device: String, output: &Path) -> Result<Arc<Service>> {
    let store = JsonLinesStore::open(output)
        .await
        .with_context(|| format!("opening output directory {}", output.display()))?;
    info!("Writing sessions to {}", output.display());
    Ok(Arc::new(SurveyService::new(
        config,
        TcpTransport::new(device),
        Arc::new(store),
        MemorySessionRepository::new(),
    )))
}

/// Log connection changes and throttled status lines until cancelled.
fn spawn_status_logger(service: &Service, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut status = service.subscribe_status();
    let mut connection = service.subscribe_connection();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("{}", status.borrow_and_update().message());
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("Device: {}", *connection.borrow_and_update());
                }
            }
        }
    })
}

async fn run(
    device: String,
    gps_replay: Option<PathBuf>,
    output: PathBuf,
    config: Option<PathBuf>,
    duration: u64,
    name: String,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let service = open_service(&config, device, &output).await?;
    let cancel = CancellationToken::new();
    let logger = spawn_status_logger(&service, cancel.clone());

    if let Err(e) = service.start().await {
        warn!("Device not connected yet: {}", e);
    }

    if let Some(path) = gps_replay {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = replay_fixes(&path, service.location(), cancel).await {
                warn!("GPS replay from {} failed: {}", path.display(), e);
            }
        });
    }

    let meta = service.start_survey(SessionRequest::named(name)).await?;
    info!("Recording session {} (Ctrl-C to stop)", meta.session_id);

    let deadline = async {
        if duration > 0 {
            sleep(Duration::from_secs(duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = deadline => info!("Duration reached, stopping..."),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Ctrl-C handler failed: {}", e);
            }
            info!("Interrupted, stopping...");
        }
    }

    let summary = service.stop_survey().await;
    cancel.cancel();
    service.shutdown().await;
    let _ = logger.await;
    report(&summary?)
}

async fn simulate(
    readings: u64,
    gps_dropout_after: Option<u64>,
    interval_ms: u64,
    output: PathBuf,
    config: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let sim_config = SimulatorConfig {
        interval_ms,
        max_readings: Some(readings),
        ..SimulatorConfig::default()
    };
    info!("Simulated device on {}, {} readings every {} ms", addr, readings, interval_ms);
    let device = tokio::spawn(sim::serve(listener, sim_config, cancel.clone()));

    let service = open_service(&config, addr.to_string(), &output).await?;
    let logger = spawn_status_logger(&service, cancel.clone());
    service.start().await?;
    spawn_simulated_gps(Arc::clone(&service), gps_dropout_after, cancel.clone());

    let meta = service.start_survey(SessionRequest::named("simulated")).await?;
    info!("Recording session {}", meta.session_id);

    let deadline = Instant::now() + Duration::from_millis(readings * interval_ms) + Duration::from_secs(10);
    loop {
        let stats = service.pipeline().stats();
        let handled = stats.ingested + stats.discarded_inactive + stats.guard_violations + stats.lagged;
        if handled >= readings {
            break;
        }
        if Instant::now() >= deadline {
            warn!("Timed out with {} of {} readings handled", handled, readings);
            break;
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(100)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping...");
                break;
            }
        }
    }

    let summary = service.stop_survey().await;
    cancel.cancel();
    service.shutdown().await;
    let _ = logger.await;
    match device.await {
        Ok(Err(e)) => warn!("Simulated device failed: {}", e),
        Err(e) => warn!("Simulated device task failed: {}", e),
        Ok(Ok(())) => {}
    }
    report(&summary?)
}

/// Publish a fix on the simulated track for each reading, until the dropout point.
fn spawn_simulated_gps(service: Arc<Service>, dropout_after: Option<u64>, cancel: CancellationToken) {
    let mut readings = service.link().subscribe_readings();
    let track = SimulatedTrack::default();

    tokio::spawn(async move {
        let mut seen = 0u64;
        loop {
            let reading = tokio::select! {
                _ = cancel.cancelled() => break,
                received = readings.recv() => match received {
                    Ok(reading) => reading,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };
            seen += 1;
            if dropout_after.is_some_and(|limit| seen > limit) {
                info!("Simulated GPS dropout after {} readings", seen - 1);
                break;
            }
            service
                .location()
                .publish(track.fix_at(reading.cumulative_distance_m, Utc::now()));
        }
    });
}

fn report(summary: &SurveySummary) -> Result<()> {
    info!(
        "Session {}: {} records saved, {} flush failures, {} dropped, {} malformed lines, {} reconnects",
        summary.session.session_id,
        summary.records,
        summary.ingest.flush_failures,
        summary.ingest.dropped_overflow,
        summary.link.malformed,
        summary.link.reconnects
    );
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
