//! Advertising: a short linear pipeline, not a state machine. Each step is
//! checked against a stop signal before it runs; once a step has started,
//! it is allowed to finish, and `stop()` only prevents the *next* step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::ble::transport::{next_owner_id, BleTransport};
use crate::error::Error;

/// Parameters for one advertising run.
#[derive(Debug, Clone)]
pub struct AdvParams {
    pub duration_ms: i32,
    pub connectable: bool,
    pub own_addr_type: u8,
}

/// Drives one advertising attempt to completion or cancellation.
pub struct Advertiser {
    xport: Arc<BleTransport>,
    owner: u64,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Advertiser {
    pub fn new(xport: Arc<BleTransport>) -> Self {
        Self {
            xport,
            owner: next_owner_id(),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    /// Requests the advertiser stop as soon as its current step finishes.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_notify.notify_waiters();
            self.xport.slave.stop_waiting(self.owner, Error::Cancelled);
        }
    }

    fn check_abort(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs the five-step advertise pipeline: acquire the slave role,
    /// build the request, transmit it, await the daemon's ack, then await
    /// the eventual `adv_stop` event (or our own `stop()`).
    pub async fn run(&self, params: AdvParams) -> Result<(), Error> {
        self.check_abort()?;
        let _slave = self.xport.acquire_slave(self.owner).await?;

        self.check_abort()?;
        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "own_addr_type": params.own_addr_type,
            "conn_mode": if params.connectable { 2 } else { 0 },
            "duration_ms": params.duration_ms,
        });

        self.check_abort()?;
        let rsp = self.xport.request_raw("adv_start", seq, body).await?;
        debug!(?rsp, "adv_start acked");

        self.check_abort()?;
        tokio::select! {
            _ = self.stop_notify.notified() => {
                self.send_adv_stop().await?;
                Err(Error::Cancelled)
            }
            result = self.await_adv_stop_event() => result,
        }
    }

    async fn send_adv_stop(&self) -> Result<(), Error> {
        let seq = self.xport.next_request_seq();
        self.xport
            .request_raw("adv_stop", seq, serde_json::json!({}))
            .await
            .map(|_| ())
    }

    async fn await_adv_stop_event(&self) -> Result<(), Error> {
        let mut listener = self.xport.registry().add(crate::key::Key::TypeKey("adv_stop"))?;
        let result = listener.recv().await;
        self.xport.registry().remove(&listener);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleXportCfg;

    #[test]
    fn stop_before_run_is_idempotent() {
        let xport = Arc::new(BleTransport::new(BleXportCfg::default()));
        let adv = Advertiser::new(xport);
        adv.stop();
        adv.stop();
        assert!(adv.stopped.load(Ordering::SeqCst));
    }
}
