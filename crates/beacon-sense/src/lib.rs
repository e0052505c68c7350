pub mod doctor;
pub mod nmea;
pub mod quality;
pub mod reconnect;
pub mod sensor;

pub use quality::{classify, QualityThresholds};
pub use reconnect::{Reconnector, RetryState};
pub use sensor::{PositionSensor, SensorBackend, SensorError, SensorEvent, WatchConfig};
