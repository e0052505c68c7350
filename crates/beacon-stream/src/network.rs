//! Connectivity observation. Monitors only report state transitions; the
//! stream session decides what to do with them.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Externally driven monitor: deployments with a platform connectivity
/// signal (or tests) push transitions in by hand.
pub struct ManualMonitor {
    tx: watch::Sender<bool>,
}

impl ManualMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            tx: watch::channel(online).0,
        }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self
            .tx
            .send_if_modified(|cur| if *cur != online { *cur = online; true } else { false });
        if changed {
            if online {
                info!("network: online");
            } else {
                warn!("network: offline");
            }
        }
    }
}

impl NetworkMonitor for ManualMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Probes a TCP endpoint on a fixed interval and publishes transitions.
/// Starts optimistic (online) until the first probe says otherwise.
pub struct TcpProbeMonitor {
    tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl TcpProbeMonitor {
    pub fn start(addr: String, interval: Duration, timeout: Duration) -> Self {
        let tx = Arc::new(watch::channel(true).0);
        let tx2 = tx.clone();
        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let online = matches!(
                    tokio::time::timeout(timeout, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                );
                failures = if online { 0 } else { failures + 1 };
                // One missed probe can be a blip; report offline on the second.
                let report = online || failures < 2;
                let changed = tx2
                    .send_if_modified(|cur| if *cur != report { *cur = report; true } else { false });
                if changed {
                    if report {
                        info!("network: online ({})", addr);
                    } else {
                        warn!("network: offline after {} failed probes ({})", failures, addr);
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self { tx, task }
    }
}

impl NetworkMonitor for TcpProbeMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Drop for TcpProbeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
