use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use beacon_sense::nmea::NmeaBackend;
use beacon_sense::quality::QualityThresholds;
use beacon_sense::sensor::{SensorBackend, WatchConfig};
use beacon_sense::doctor as sense_doctor;
use beacon_store::doctor as store_doctor;
use beacon_store::{FsStore, LocalStore, OfflineQueue};
use beacon_stream::doctor as stream_doctor;
use beacon_stream::{
    LogSink, ManualMonitor, NetworkMonitor, RemoteSink, StreamConfig, StreamSession,
    TcpProbeMonitor, TlsSink,
};

#[derive(Debug, Parser)]
#[command(name = "beacon", version, about = "beacon - field device position streaming")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and the store directory.
    Doctor,
    /// Start the tracking session and stream until interrupted.
    Run,
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCmd {
    /// Print the persisted offline queue without touching it.
    Inspect,
    /// Replay the persisted queue to the sink, stopping at the first failure.
    Flush,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    device: DeviceCfg,
    sensor: SensorCfg,
    #[serde(default)]
    quality: QualityThresholds,
    stream: StreamCfg,
    store: StoreCfg,
    sink: SinkCfg,
    network: Option<NetworkCfg>,
}

#[derive(Debug, serde::Deserialize)]
struct DeviceCfg {
    id: String,
}

#[derive(Debug, serde::Deserialize)]
struct SensorCfg {
    source: String,
    nmea_device: Option<String>,
    nmea_file: Option<String>,
    high_accuracy: bool,
    timeout_s: u64,
    max_sample_age_s: u64,
}

#[derive(Debug, serde::Deserialize)]
struct StreamCfg {
    min_distance_m: f64,
    batch_interval_ms: u64,
    reconnect_delay_s: u64,
}

#[derive(Debug, serde::Deserialize)]
struct StoreCfg {
    dir: String,
}

#[derive(Debug, serde::Deserialize)]
struct SinkCfg {
    enable: bool,
    endpoint: String,
}

#[derive(Debug, serde::Deserialize)]
struct NetworkCfg {
    probe_addr: String,
    probe_interval_s: u64,
    probe_timeout_ms: u64,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Queue { cmd } => queue_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    match cfg.sensor.source.as_str() {
        "nmea-serial" => anyhow::ensure!(
            cfg.sensor.nmea_device.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
            "sensor.nmea_device missing"
        ),
        "nmea-file" => anyhow::ensure!(
            cfg.sensor.nmea_file.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
            "sensor.nmea_file missing"
        ),
        other => anyhow::bail!("unknown sensor.source: {}", other),
    }

    sense_doctor::check_quality_thresholds(&cfg.quality)?;
    sense_doctor::check_watch_timing(cfg.sensor.timeout_s, cfg.sensor.max_sample_age_s)?;
    store_doctor::check_store_dir(&cfg.store.dir)?;
    stream_doctor::check_stream_params(
        cfg.stream.min_distance_m,
        cfg.stream.batch_interval_ms,
        cfg.stream.reconnect_delay_s,
    )?;
    if cfg.sink.enable {
        stream_doctor::check_endpoint(&cfg.sink.endpoint)?;
    } else {
        warn!("doctor: sink disabled, records will only be logged");
    }

    info!("doctor: OK");
    Ok(())
}

fn build_backend(cfg: &Config) -> Result<Arc<dyn SensorBackend>> {
    let backend = match cfg.sensor.source.as_str() {
        "nmea-serial" => NmeaBackend::serial(
            cfg.sensor.nmea_device.as_ref().context("sensor.nmea_device missing")?,
        )?,
        "nmea-file" => NmeaBackend::file(
            cfg.sensor.nmea_file.as_ref().context("sensor.nmea_file missing")?,
        )?,
        other => anyhow::bail!("unknown sensor.source: {}", other),
    };
    Ok(Arc::new(backend))
}

fn build_sink(cfg: &Config) -> Arc<dyn RemoteSink> {
    if cfg.sink.enable {
        Arc::new(TlsSink::new(cfg.sink.endpoint.clone()))
    } else {
        Arc::new(LogSink)
    }
}

fn build_monitor(cfg: &Config) -> Arc<dyn NetworkMonitor> {
    match &cfg.network {
        Some(n) => Arc::new(TcpProbeMonitor::start(
            n.probe_addr.clone(),
            Duration::from_secs(n.probe_interval_s),
            Duration::from_millis(n.probe_timeout_ms),
        )),
        // No probe target configured: assume reachable and let write
        // failures drive the offline path.
        None => Arc::new(ManualMonitor::new(true)),
    }
}

fn stream_config(cfg: &Config) -> StreamConfig {
    StreamConfig {
        device_id: cfg.device.id.clone(),
        min_distance_m: cfg.stream.min_distance_m,
        batch_interval: Duration::from_millis(cfg.stream.batch_interval_ms),
        reconnect_delay: Duration::from_secs(cfg.stream.reconnect_delay_s),
        thresholds: cfg.quality,
        watch: WatchConfig {
            high_accuracy: cfg.sensor.high_accuracy,
            timeout: Duration::from_secs(cfg.sensor.timeout_s),
            max_sample_age: Duration::from_secs(cfg.sensor.max_sample_age_s),
        },
    }
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting for device {}", cfg.device.id);

    let backend = build_backend(cfg)?;
    let sink = build_sink(cfg);
    let network = build_monitor(cfg);
    let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(&cfg.store.dir));

    let session = StreamSession::new(stream_config(cfg), backend, sink, network, store);
    let handle = session.start().await?;
    let mut status_rx = handle.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("run: interrupt received");
                break;
            }
            res = status_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let st = status_rx.borrow_and_update().clone();
                info!(
                    "status={:?} quality={:?} strength={} last_error={:?}",
                    st.status, st.quality, st.signal_strength, st.last_error
                );
            }
        }
    }

    handle.stop();
    handle.join().await;
    info!("run: stopped");
    Ok(())
}

async fn queue_cmd(cfg: &Config, cmd: QueueCmd) -> Result<()> {
    let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(&cfg.store.dir));
    let mut queue = OfflineQueue::open(store, &cfg.device.id).await?;

    match cmd {
        QueueCmd::Inspect => {
            println!("queued records: {}", queue.len());
            for entry in queue.entries() {
                println!(
                    "seq={} enqueued={} lat={:.6} lon={:.6} accuracy={:?} quality={:?}",
                    entry.seq,
                    fmt_ms(entry.enqueued_at_ms),
                    entry.record.lat,
                    entry.record.lon,
                    entry.record.accuracy_m,
                    entry.record.quality,
                );
            }
        }
        QueueCmd::Flush => {
            anyhow::ensure!(cfg.sink.enable, "sink.enable=false, nothing to flush to");
            let sink = build_sink(cfg);
            let total = queue.len();
            let mut sent = 0usize;
            while let Some(entry) = queue.front().cloned() {
                if let Err(e) = sink.write(&cfg.device.id, &entry.record).await {
                    warn!("flush stopped at seq {}: {:#}", entry.seq, e);
                    break;
                }
                queue.ack_front().await?;
                sent += 1;
            }
            println!("flushed {}/{} queued record(s)", sent, total);
        }
    }
    Ok(())
}

fn fmt_ms(ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map(|t| t.to_string())
        .unwrap_or_else(|_| ms.to_string())
}
