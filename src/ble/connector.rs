//! Connecting: acquires the master role with primary priority (a connect
//! in progress should not wait behind routine scans), transmits `connect`,
//! and awaits the daemon's `connect` event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::ble::protocol::ConnectEvt;
use crate::ble::transport::{next_owner_id, BleTransport};
use crate::error::Error;
use crate::key::{ConnHandle, Key};

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub peer_addr: String,
    pub peer_addr_type: u8,
    pub own_addr_type: u8,
    pub duration_ms: i32,
}

pub struct Connector {
    xport: Arc<BleTransport>,
    owner: u64,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Connector {
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

    /// Runs the connect pipeline to completion, returning the connection
    /// handle the daemon assigned once the link comes up.
    pub async fn run(&self, params: ConnectParams) -> Result<ConnHandle, Error> {
        self.check_abort()?;
        let _master = self.xport.acquire_master_primary(self.owner).await?;

        self.check_abort()?;
        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "own_addr_type": params.own_addr_type,
            "peer_addr_type": params.peer_addr_type,
            "peer_addr": params.peer_addr,
            "duration_ms": params.duration_ms,
        });

        self.check_abort()?;
        self.xport.request_raw("connect", seq, body).await?;

        self.check_abort()?;
        let mut listener = self.xport.registry().add(Key::TypeKey("connect"))?;
        let result = tokio::select! {
            _ = self.stop_notify.notified() => Err(Error::Cancelled),
            frame = listener.recv() => frame,
        };
        self.xport.registry().remove(&listener);

        let raw = result?;
        let evt: ConnectEvt = serde_json::from_slice(&raw)?;
        if evt.status != 0 {
            let (category, code) = crate::error::HostErrorCategory::classify(evt.status);
            return Err(Error::BleHost {
                status: code,
                category,
            });
        }
        Ok(ConnHandle(evt.conn_handle))
    }
}
