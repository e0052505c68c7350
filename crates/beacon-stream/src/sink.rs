//! Remote document-store write seam.
//!
//! The store itself is an external collaborator; all this crate owns is an
//! at-least-once `write` call. The TLS sink ships one length-framed JSON
//! payload per record and closes the connection.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_proto::LocationRecord;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad sink endpoint: {0}")]
    Endpoint(String),
    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn write(&self, device_id: &str, record: &LocationRecord) -> Result<(), WriteError>;
}

#[derive(Serialize)]
struct WirePayload<'a> {
    device_id: &'a str,
    record: &'a LocationRecord,
}

/// TLS sink against a `tls://host:port` endpoint with webpki root validation.
pub struct TlsSink {
    endpoint: String,
    tls: TlsConnector,
}

impl TlsSink {
    pub fn new(endpoint: String) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let cfg = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            endpoint,
            tls: TlsConnector::from(Arc::new(cfg)),
        }
    }

    fn host_port(&self) -> Result<(&str, &str), WriteError> {
        let ep = self
            .endpoint
            .strip_prefix("tls://")
            .ok_or_else(|| WriteError::Endpoint(format!("{}: must start with tls://", self.endpoint)))?;
        let mut parts = ep.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| WriteError::Endpoint(format!("{}: missing host", self.endpoint)))?;
        let port = parts
            .next()
            .ok_or_else(|| WriteError::Endpoint(format!("{}: missing port", self.endpoint)))?;
        Ok((host, port))
    }
}

#[async_trait]
impl RemoteSink for TlsSink {
    async fn write(&self, device_id: &str, record: &LocationRecord) -> Result<(), WriteError> {
        let payload = serde_json::to_vec(&WirePayload { device_id, record })?;
        let (host, port) = self.host_port()?;
        let addr = format!("{}:{}", host, port);

        let tcp = TcpStream::connect(&addr).await?;
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| WriteError::Endpoint(format!("{}: {}", host, e)))?;
        let mut tls = self.tls.connect(name, tcp).await?;

        // u32 length prefix + JSON body.
        let len = (payload.len() as u32).to_be_bytes();
        tls.write_all(&len).await?;
        tls.write_all(&payload).await?;
        tls.flush().await?;
        tls.shutdown().await.ok();

        info!("sink: wrote {} bytes for {}", payload.len(), device_id);
        Ok(())
    }
}

/// Sink that only logs. Used when streaming runs without an uplink
/// configured (desk replay, sensor bring-up).
pub struct LogSink;

#[async_trait]
impl RemoteSink for LogSink {
    async fn write(&self, device_id: &str, record: &LocationRecord) -> Result<(), WriteError> {
        debug!(
            "sink(log): {} lat={:.6} lon={:.6} status={:?} quality={:?} strength={}",
            device_id, record.lat, record.lon, record.status, record.quality, record.signal_strength
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing_rejects_malformed_endpoints() {
        assert!(TlsSink::new("tls://example.com:7443".into()).host_port().is_ok());
        assert!(TlsSink::new("tcp://example.com:7443".into()).host_port().is_err());
        assert!(TlsSink::new("tls://:7443".into()).host_port().is_err());
        assert!(TlsSink::new("tls://example.com".into()).host_port().is_err());
    }
}
