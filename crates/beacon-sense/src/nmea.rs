//! NMEA position backend: a serial GNSS receiver or a sentence replay file.
//!
//! Accuracy is estimated from HDOP (`hdop * UERE_M`), since NMEA does not
//! report meters directly. GGA carries satellites + HDOP, RMC carries
//! position, speed, and course; the two are merged per fix.

use std::io;

use async_trait::async_trait;
use beacon_proto::{now_ms, RawSample};
use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::sensor::{SensorBackend, SensorError, WatchConfig};

/// Nominal user-equivalent range error used to turn HDOP into meters.
pub const UERE_M: f64 = 5.0;

const KNOTS_TO_MPS: f64 = 0.514444;

enum NmeaReader {
    Serial(BufReader<SerialStream>),
    File(BufReader<File>),
}

#[derive(Debug, Clone, Copy)]
struct GgaInfo {
    sats: u8,
    hdop: f64,
    at: OffsetDateTime,
}

/// Sentence-merging state. Lives in the backend, one per reader, so a
/// session never pairs another session's GGA with its RMC.
#[derive(Default)]
struct ParserState {
    last_gga: Option<GgaInfo>,
}

struct Inner {
    reader: NmeaReader,
    parser: ParserState,
}

pub struct NmeaBackend {
    inner: tokio::sync::Mutex<Inner>,
}

impl NmeaBackend {
    pub fn serial(dev: &str) -> Result<Self, SensorError> {
        let port = tokio_serial::new(dev, 115200)
            .open_native_async()
            .map_err(|e| map_serial_err(dev, &e))?;
        Ok(Self::with_reader(NmeaReader::Serial(BufReader::new(port))))
    }

    pub fn file(path: &str) -> Result<Self, SensorError> {
        let f = std::fs::File::open(path).map_err(|e| map_io_err(path, &e))?;
        Ok(Self::with_reader(NmeaReader::File(BufReader::new(
            File::from_std(f),
        ))))
    }

    fn with_reader(reader: NmeaReader) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner {
                reader,
                parser: ParserState::default(),
            }),
        }
    }
}

#[async_trait]
impl SensorBackend for NmeaBackend {
    async fn next_sample(&self, cfg: &WatchConfig) -> Result<RawSample, SensorError> {
        let mut inner = self.inner.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let n = match &mut inner.reader {
                NmeaReader::Serial(r) => r
                    .read_line(&mut line)
                    .await
                    .map_err(|e| SensorError::Unavailable(format!("serial read: {}", e)))?,
                NmeaReader::File(r) => r
                    .read_line(&mut line)
                    .await
                    .map_err(|e| SensorError::Unavailable(format!("file read: {}", e)))?,
            };
            if n == 0 {
                match &inner.reader {
                    // Replay file exhausted: idle at the end like a stalled
                    // receiver instead of erroring out.
                    NmeaReader::File(_) => {
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        continue;
                    }
                    NmeaReader::Serial(_) => {
                        return Err(SensorError::Unavailable("serial port closed".into()));
                    }
                }
            }
            if let Some(sample) = parse_sentence(&mut inner.parser, line.trim(), cfg) {
                debug!(
                    "nmea: fix lat={:.6} lon={:.6} acc={:?}",
                    sample.lat, sample.lon, sample.accuracy_m
                );
                return Ok(sample);
            }
        }
    }
}

fn map_serial_err(dev: &str, e: &tokio_serial::Error) -> SensorError {
    use tokio_serial::ErrorKind;
    match e.kind() {
        ErrorKind::NoDevice => SensorError::Unsupported,
        ErrorKind::Io(io::ErrorKind::PermissionDenied) => SensorError::PermissionDenied,
        _ => SensorError::Unavailable(format!("open serial {}: {}", dev, e)),
    }
}

fn map_io_err(path: &str, e: &io::Error) -> SensorError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => SensorError::PermissionDenied,
        io::ErrorKind::NotFound => SensorError::Unsupported,
        _ => SensorError::Unavailable(format!("open nmea file {}: {}", path, e)),
    }
}

/// Parses one sentence, merging GGA quality into the next valid RMC fix.
fn parse_sentence(state: &mut ParserState, s: &str, cfg: &WatchConfig) -> Option<RawSample> {
    if s.starts_with("$GNGGA") || s.starts_with("$GPGGA") {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() > 9 {
            let sats: u8 = parts[7].parse().unwrap_or(0);
            let hdop: f64 = parts[8].parse().unwrap_or(99.9);
            state.last_gga = Some(GgaInfo {
                sats,
                hdop,
                at: OffsetDateTime::now_utc(),
            });
        }
        return None;
    }

    if s.starts_with("$GNRMC") || s.starts_with("$GPRMC") {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() <= 8 {
            return None;
        }
        // parts[2] is the validity flag; "V" means no fix.
        if parts[2] != "A" {
            return None;
        }
        let lat = parse_deg_min(parts[3], parts[4])?;
        let lon = parse_deg_min(parts[5], parts[6])?;
        let speed_mps = parts[7].parse::<f64>().ok().map(|kn| kn * KNOTS_TO_MPS);
        let heading_deg = parts[8].parse::<f64>().ok();

        // A stale GGA must not vouch for a fresh RMC.
        let accuracy_m = state.last_gga.and_then(|g| {
            let age = OffsetDateTime::now_utc() - g.at;
            if age <= cfg.max_sample_age && g.sats > 0 {
                Some(g.hdop * UERE_M)
            } else {
                None
            }
        });

        return Some(RawSample {
            lat,
            lon,
            accuracy_m,
            heading_deg,
            speed_mps,
            sampled_at_ms: now_ms(),
        });
    }

    None
}

// lat: ddmm.mmmm, lon: dddmm.mmmm
fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() {
        return None;
    }
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v[..deg_len].parse().ok()?;
    let min: f64 = v[deg_len..].parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" {
        out = -out;
    }
    Some(out)
}
