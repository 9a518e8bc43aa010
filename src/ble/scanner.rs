//! Scanning: the same abort-poll-between-steps pipeline shape as
//! [`crate::ble::advertiser::Advertiser`], driving the master role instead
//! of the slave role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::ble::transport::{next_owner_id, BleTransport};
use crate::error::Error;
use crate::key::Key;

#[derive(Debug, Clone)]
pub struct ScanParams {
    pub duration_ms: i32,
    pub own_addr_type: u8,
    pub filter_duplicates: bool,
}

/// One discovered advertisement, as reported by a `scan` event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ScanReport {
    pub addr: String,
    pub addr_type: u8,
    pub rssi: i8,
}

pub struct Scanner {
    xport: Arc<BleTransport>,
    owner: u64,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Scanner {
    pub fn new(xport: Arc<BleTransport>) -> Self {
        Self {
            xport,
            owner: next_owner_id(),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_notify.notify_waiters();
            self.xport.master.stop_waiting(self.owner, Error::Cancelled);
        }
    }

    fn check_abort(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs a scan to completion, invoking `on_report` for each
    /// advertisement seen before the duration elapses or `stop()` is
    /// called.
    pub async fn run<F>(&self, params: ScanParams, mut on_report: F) -> Result<(), Error>
    where
        F: FnMut(ScanReport),
    {
        self.check_abort()?;
        let _master = self.xport.acquire_master(self.owner).await?;

        self.check_abort()?;
        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "own_addr_type": params.own_addr_type,
            "duration_ms": params.duration_ms,
            "filter_duplicates": params.filter_duplicates,
        });

        self.check_abort()?;
        self.xport.request_raw("scan", seq, body).await?;

        let deadline = tokio::time::sleep(std::time::Duration::from_millis(params.duration_ms.max(0) as u64));
        tokio::pin!(deadline);

        let mut listener = self.xport.registry().add(Key::TypeKey("scan"))?;
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => {
                    self.xport.registry().remove(&listener);
                    return Err(Error::Cancelled);
                }
                _ = &mut deadline => {
                    self.xport.registry().remove(&listener);
                    return Ok(());
                }
                frame = listener.recv() => {
                    match frame {
                        Ok(raw) => {
                            if let Ok(report) = serde_json::from_slice::<ScanReport>(&raw) {
                                on_report(report);
                            }
                        }
                        Err(e) => {
                            self.xport.registry().remove(&listener);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}
