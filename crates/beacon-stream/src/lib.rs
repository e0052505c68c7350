pub mod doctor;
pub mod network;
pub mod session;
pub mod sink;

pub use network::{ManualMonitor, NetworkMonitor, TcpProbeMonitor};
pub use session::{StreamConfig, StreamError, StreamHandle, StreamSession, StreamStatus};
pub use sink::{LogSink, RemoteSink, TlsSink, WriteError};
