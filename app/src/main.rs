//! ABOUTME: camwatch command line entry point
//! ABOUTME: Runs the scheduling engine and administers cameras, results and jobs

use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use cw_config::{CapacityPolicySetting, Config};
use cw_core::{telemetry, CameraId, Error, Id, Result};
use cw_db::{
    CameraStore, Db, DetectionFilter, DetectionStore, JobStore, NewCamera, SessionStore,
    UpdateCamera,
};
use cw_notify::{EventBus, FanoutSink, NotificationSink, WebhookSink};
use cw_sched::{
    CapacityPolicy, Engine, EngineCapabilities, EngineConfig, EngineStores, JobConfig,
    StreamConfig,
};
use cw_storage::ObjectImageStore;
use cw_vision::{BrightRegionConfig, BrightRegionDetector, SyntheticFrameSource};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Chance that a synthetic frame contains a face
const SYNTHETIC_FACE_PROBABILITY: f64 = 0.15;

#[derive(Debug, Parser)]
#[command(name = "camwatch", version, about = "Stream and detection scheduling engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine until interrupted
    Run(RunArgs),
    /// Run one manual detection job to completion
    Detect(DetectArgs),
    /// Detect once on one camera and store any face as a test result
    DetectOnce {
        #[arg(long)]
        camera: i64,
    },
    /// Manage registered cameras
    #[command(subcommand)]
    Cameras(CameraCommand),
    /// List stored detection results, newest first
    Results(ResultsArgs),
    /// List recorded detection jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List recorded stream sessions, newest first
    Sessions {
        #[arg(long)]
        camera: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Register sample cameras when the registry is empty
    Seed {
        #[arg(long, default_value_t = 400)]
        count: usize,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Start the automatic detection cycle
    #[arg(long)]
    automatic: bool,
    /// Cameras to stream while running
    #[arg(long, value_delimiter = ',')]
    stream: Vec<i64>,
    /// Seconds between utilization reports
    #[arg(long, default_value_t = 30)]
    report_secs: u64,
}

#[derive(Debug, Args)]
struct DetectArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    cameras: Vec<i64>,
    #[arg(long, default_value_t = 5)]
    minutes: u32,
}

#[derive(Debug, Subcommand)]
enum CameraCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        location: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    Remove {
        id: i64,
    },
}

#[derive(Debug, Args)]
struct ResultsArgs {
    #[arg(long)]
    camera: Option<i64>,
    #[arg(long)]
    job: Option<String>,
    /// RFC 3339 lower bound, inclusive
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// RFC 3339 upper bound, exclusive
    #[arg(long)]
    until: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 20)]
    limit: i64,
    #[arg(long, default_value_t = 0)]
    offset: i64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    telemetry::init_tracing(&config.telemetry.environment, "camwatch");
    debug!(?config, "Configuration loaded successfully");

    if let Err(e) = execute(cli.command, config).await {
        error!("camwatch failed: {}", e);
        process::exit(1);
    }
}

async fn execute(command: Command, config: Config) -> Result<()> {
    let db = Db::new(
        &config.database.path,
        config.database.pool_size,
        config.database.sqlite_wal,
    )
    .await?;
    db.health_check().await?;

    match command {
        Command::Run(args) => run(args, &config, &db).await,
        Command::Detect(args) => detect(args, &config, &db).await,
        Command::DetectOnce { camera } => detect_once(CameraId::new(camera), &config, &db).await,
        Command::Cameras(command) => cameras(command, &db).await,
        Command::Results(args) => results(args, &db).await,
        Command::Jobs { limit } => print_json(&db.jobs().list(limit).await?),
        Command::Sessions { camera, limit } => {
            print_json(&db.sessions().list(camera.map(CameraId::new), limit).await?)
        }
        Command::Seed { count } => {
            let created = seed(&db.cameras(), count).await?;
            info!(created, "Seeding finished");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{}", text);
    Ok(())
}

fn engine_config(config: &Config) -> EngineConfig {
    let scheduler = &config.scheduler;
    EngineConfig {
        streaming_slots: scheduler.stream_slots,
        detection_slots: scheduler.detection_slots,
        stream: StreamConfig {
            frame_interval: scheduler.frame_interval(),
            frame_timeout: scheduler.frame_timeout(),
            degrade_after_failures: scheduler.degrade_after_failures,
            ..Default::default()
        },
        jobs: JobConfig {
            poll_interval: scheduler.poll_interval(),
            detection_timeout: scheduler.detection_timeout(),
            cycle_duration: scheduler.cycle_duration(),
            batch_size: scheduler.batch_size,
            capacity_policy: match scheduler.capacity_policy {
                CapacityPolicySetting::Partial => CapacityPolicy::Partial,
                CapacityPolicySetting::AllOrNothing => CapacityPolicy::AllOrNothing,
            },
            auto_continue: scheduler.auto_continue,
            capacity_retry: scheduler.capacity_retry(),
            ..Default::default()
        },
    }
}

fn notification_sink(config: &Config, bus: &EventBus) -> Result<Arc<dyn NotificationSink>> {
    let mut sink = FanoutSink::new().with(Arc::new(bus.clone()));
    if let Some(url) = &config.notify.webhook_url {
        sink = sink.with(Arc::new(WebhookSink::new(url)?));
        info!(%url, "Webhook notifications enabled");
    }
    Ok(Arc::new(sink))
}

async fn start_engine(config: &Config, db: &Db, bus: &EventBus) -> Result<Engine> {
    let capabilities = EngineCapabilities {
        frames: Arc::new(SyntheticFrameSource::new(SYNTHETIC_FACE_PROBABILITY)),
        detector: Arc::new(BrightRegionDetector::new(BrightRegionConfig::default())),
        images: Arc::new(ObjectImageStore::local(&config.storage.artifacts_dir)?),
        sink: notification_sink(config, bus)?,
    };
    Engine::start(engine_config(config), EngineStores::from_db(db), capabilities).await
}

async fn run(args: RunArgs, config: &Config, db: &Db) -> Result<()> {
    let bus = EventBus::default();
    let engine = start_engine(config, db, &bus).await?;

    for id in args.stream {
        match engine.start_stream(CameraId::new(id)).await {
            Ok(session) => info!(camera_id = %session.camera_id, "Streaming"),
            Err(e) => warn!(camera_id = id, error = %e, "Could not start stream"),
        }
    }
    if args.automatic {
        let job = engine.schedule_automatic().await?;
        info!(job_id = %job.id, cameras = job.target_camera_ids.len(), "Automatic cycle started");
    }

    let mut events = bus.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = report.tick() => {
                let utilization = engine.utilization();
                info!(
                    streaming = utilization.streaming.in_use,
                    detection = utilization.detection.in_use,
                    "Slot utilization"
                );
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    debug!(kind = event.kind(), "Engine event");
                }
            }
        }
    }

    engine.shutdown().await;
    debug!(metrics = %engine.metrics().encode()?, "Final metrics");
    Ok(())
}

async fn detect(args: DetectArgs, config: &Config, db: &Db) -> Result<()> {
    let bus = EventBus::default();
    let engine = start_engine(config, db, &bus).await?;

    let ids: Vec<CameraId> = args.cameras.into_iter().map(CameraId::new).collect();
    let job = engine.schedule_manual(&ids, args.minutes).await?;
    info!(job_id = %job.id, window_end = %job.window_end, "Detection job running");

    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break engine.abort_job(&job.id).await?;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let current = engine.get_job(&job.id).await?;
                if current.status.is_terminal() {
                    break current;
                }
            }
        }
    };

    engine.shutdown().await;
    print_json(&finished)
}

async fn detect_once(camera_id: CameraId, config: &Config, db: &Db) -> Result<()> {
    let bus = EventBus::default();
    let engine = start_engine(config, db, &bus).await?;
    let outcome = engine.detect_once(camera_id).await;
    engine.shutdown().await;

    let outcome = outcome?;
    info!(%camera_id, faces = outcome.face_count, stored = outcome.result.is_some(), "One-shot detection");
    print_json(&outcome)
}

async fn cameras(command: CameraCommand, db: &Db) -> Result<()> {
    let store = db.cameras();
    match command {
        CameraCommand::List => print_json(&store.list().await?),
        CameraCommand::Add {
            name,
            address,
            location,
        } => print_json(&store.insert(NewCamera::new(name, address, location)).await?),
        CameraCommand::Update {
            id,
            name,
            address,
            location,
        } => {
            let update = UpdateCamera {
                name,
                address,
                location,
            };
            print_json(&store.update(CameraId::new(id), update).await?)
        }
        CameraCommand::Remove { id } => {
            let id = CameraId::new(id);
            store.delete_idle(id).await?;
            info!(camera_id = %id, "Camera removed");
            Ok(())
        }
    }
}

async fn results(args: ResultsArgs, db: &Db) -> Result<()> {
    let job_id = args
        .job
        .map(|raw| {
            raw.parse::<Id>()
                .map_err(|e| Error::Validation(format!("Invalid job id '{}': {}", raw, e)))
        })
        .transpose()?;
    let filter = DetectionFilter {
        camera_id: args.camera.map(CameraId::new),
        job_id,
        since: args.since,
        until: args.until,
        ..Default::default()
    }
    .page(args.limit, args.offset);

    let store = db.detections();
    let total = store.count(&filter).await?;
    let page = store.list(&filter).await?;
    info!(total, shown = page.len(), "Detection results");
    print_json(&page)
}

/// Create `count` sample cameras when none exist; returns how many were created
async fn seed(store: &dyn CameraStore, count: usize) -> Result<usize> {
    let existing = store.list().await?.len();
    if existing > 0 {
        info!(existing, "Registry already has cameras; skipping seed");
        return Ok(0);
    }

    for i in 1..=count {
        store
            .insert(NewCamera::new(
                format!("Camera {}", i),
                format!("192.168.{}.{}", i / 254, i % 254 + 1),
                format!("Zone {}, Room {}", (i - 1) / 20 + 1, (i - 1) % 20 + 1),
            ))
            .await?;
    }
    info!(count, "Seeded sample cameras");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_db::MemoryCameraStore;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["camwatch", "detect", "--cameras", "1,2,3", "--minutes", "10"])
            .unwrap();
        match cli.command {
            Command::Detect(args) => {
                assert_eq!(args.cameras, vec![1, 2, 3]);
                assert_eq!(args.minutes, 10);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["camwatch", "seed"]).unwrap();
        assert!(matches!(cli.command, Command::Seed { count: 400 }));

        let cli = Cli::try_parse_from(["camwatch", "detect-once", "--camera", "12"]).unwrap();
        assert!(matches!(cli.command, Command::DetectOnce { camera: 12 }));

        let cli = Cli::try_parse_from(["camwatch", "sessions", "--camera", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Sessions {
                camera: Some(3),
                limit: 20
            }
        ));

        assert!(Cli::try_parse_from(["camwatch", "detect"]).is_err());
    }

    #[test]
    fn test_engine_config_from_settings() {
        let mut config = Config::default();
        config.scheduler.detection_slots = 7;
        config.scheduler.capacity_policy = CapacityPolicySetting::AllOrNothing;
        config.scheduler.poll_interval_secs = 3;

        let engine = engine_config(&config);
        assert_eq!(engine.detection_slots, 7);
        assert_eq!(engine.jobs.capacity_policy, CapacityPolicy::AllOrNothing);
        assert_eq!(engine.jobs.poll_interval, Duration::from_secs(3));
        assert!(engine.validate().is_ok());
    }

    #[tokio::test]
    async fn test_seed_only_fills_an_empty_registry() {
        let store = MemoryCameraStore::new();
        assert_eq!(seed(&store, 400).await.unwrap(), 400);

        let cameras = store.list().await.unwrap();
        assert_eq!(cameras.len(), 400);
        assert_eq!(cameras[0].address, "192.168.0.2");
        assert_eq!(cameras[399].location, "Zone 20, Room 20");

        assert_eq!(seed(&store, 400).await.unwrap(), 0);
    }
}
