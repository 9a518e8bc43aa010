//! The BLE transport: owns the `blehostd` subprocess link, the daemon-level
//! listener registry, and master/slave arbitration. Sessions never talk to
//! the daemon directly; they go through a shared `BleTransport`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::arbitration::{RoleArbiter, RoleGrant};
use crate::ble::daemon::BleDaemonLink;
use crate::ble::protocol::{DaemonSeq, DaemonSeqGenerator, Frame, FrameOp, SyncRsp};
use crate::config::BleXportCfg;
use crate::error::Error;
use crate::key::Key;
use crate::listener::ListenerRegistry;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Lifecycle state of the daemon connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XportState {
    Stopped,
    Starting,
    Running,
}

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates an opaque owner id for arbitration/abort bookkeeping. Each
/// session or standalone operation (scan, advertise) gets its own.
pub fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

struct Inner {
    link: Option<BleDaemonLink>,
}

/// The BLE host-side transport: subprocess lifecycle, daemon-level request
/// correlation, and role arbitration for connect/scan/advertise.
pub struct BleTransport {
    cfg: BleXportCfg,
    state: RwLock<XportState>,
    inner: Mutex<Inner>,
    registry: Arc<ListenerRegistry>,
    seq_gen: DaemonSeqGenerator,
    pub master: RoleArbiter,
    pub slave: RoleArbiter,
}

impl BleTransport {
    pub fn new(cfg: BleXportCfg) -> Self {
        Self {
            cfg,
            state: RwLock::new(XportState::Stopped),
            inner: Mutex::new(Inner { link: None }),
            registry: Arc::new(ListenerRegistry::default()),
            seq_gen: DaemonSeqGenerator::new(),
            master: RoleArbiter::new(),
            slave: RoleArbiter::new(),
        }
    }

    pub async fn state(&self) -> XportState {
        *self.state.read().await
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Acquires the master role, with primary (queue-jumping) priority.
    pub async fn acquire_master_primary(&self, owner: u64) -> Result<RoleGrant<'_>, Error> {
        self.master.acquire_primary(owner).await
    }

    pub async fn acquire_master(&self, owner: u64) -> Result<RoleGrant<'_>, Error> {
        self.master.acquire(owner).await
    }

    pub async fn acquire_slave(&self, owner: u64) -> Result<RoleGrant<'_>, Error> {
        self.slave.acquire(owner).await
    }

    /// Spawns the daemon subprocess, performs the `sync` handshake, and
    /// starts the inbound frame pump. Idempotent: a no-op if already
    /// `Running`.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        {
            let state = self.state.read().await;
            if *state == XportState::Running {
                return Ok(());
            }
        }
        *self.state.write().await = XportState::Starting;

        let (link, mut frame_rx) = BleDaemonLink::spawn(&self.cfg).await?;
        {
            let mut inner = self.inner.lock().await;
            inner.link = Some(link);
        }

        self.sync().await?;

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                this.route_frame(frame);
            }
            if let Some(this) = weak.upgrade() {
                this.on_daemon_loss().await;
            }
        });

        *self.state.write().await = XportState::Running;
        info!("ble transport running");
        Ok(())
    }

    /// Stops the transport: kills the subprocess and fails every
    /// outstanding listener with [`Error::Xport`].
    pub async fn stop(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(mut link) = inner.link.take() {
            link.kill().await?;
        }
        *self.state.write().await = XportState::Stopped;
        self.registry.error_all(Error::Xport);
        Ok(())
    }

    /// Restarts the transport after a daemon crash, backing off
    /// exponentially between attempts. Called from the inbound pump's exit
    /// path; not part of the public request surface.
    async fn on_daemon_loss(self: &Arc<Self>) {
        warn!("blehostd link lost, failing outstanding requests");
        *self.state.write().await = XportState::Stopped;
        self.registry.error_all(Error::Xport);

        let mut backoff = INITIAL_BACKOFF;
        loop {
            // Jitter avoids every session on a shared daemon racing to
            // reconnect in lockstep after a crash.
            let jitter = rand::random::<f64>() * 0.25 * backoff.as_secs_f64();
            tokio::time::sleep(backoff + Duration::from_secs_f64(jitter)).await;
            match self.start().await {
                Ok(()) => {
                    info!("blehostd restarted");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, ?backoff, "blehostd restart failed, backing off");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn sync(&self) -> Result<(), Error> {
        let seq = self.seq_gen.next_request();
        let rsp = self.request_raw("sync", seq, serde_json::json!({})).await?;
        let sync_rsp: SyncRsp = serde_json::from_value(rsp)?;
        if !sync_rsp.synced {
            return Err(Error::Xport);
        }
        Ok(())
    }

    /// Sends a daemon-level request and awaits its correlated response
    /// body (envelope fields already stripped by [`Frame::parse`] in the
    /// inbound pump). Used for the handshake and for one-shot ops (e.g.
    /// `disc_svc_uuid`) that don't need a dedicated pipeline module.
    pub async fn request_raw(
        &self,
        msg_type: &str,
        seq: DaemonSeq,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let line = Frame::build_request(msg_type, seq, body)?;
        let key = Key::SeqKey(seq.0 as u32);
        let mut listener = self.registry.add(key)?;

        let send_result = {
            let inner = self.inner.lock().await;
            match &inner.link {
                Some(link) => link.send(line).await,
                None => Err(Error::Xport),
            }
        };
        if let Err(e) = send_result {
            self.registry.remove(&listener);
            return Err(e);
        }

        let raw = tokio::time::timeout(Duration::from_secs(10), listener.recv()).await;
        self.registry.remove(&listener);
        let raw = raw.map_err(|_| Error::RspTimeout)??;
        serde_json::from_slice(&raw).map_err(Error::from)
    }

    pub fn next_request_seq(&self) -> DaemonSeq {
        self.seq_gen.next_request()
    }

    /// Routes one inbound frame: responses go to their `SeqKey` listener,
    /// events go to both their `SeqKey` (if a waiter happens to be
    /// listening on the event's own seq) and a `TypeKey` fanout so
    /// standing subscribers (connection loss watchers, notification
    /// routers) see every event of that type.
    fn route_frame(&self, frame: Frame) {
        let type_key: &'static str = match frame.msg_type.as_str() {
            "sync" => "sync",
            "connect" => "connect",
            "disconnect" => "disconnect",
            "scan" => "scan",
            "adv_stop" => "adv_stop",
            "notify" => "notify",
            other => {
                // Leak-free interning isn't worth it for an unknown type;
                // route by seq only.
                let _ = other;
                ""
            }
        };

        let raw = match serde_json::to_vec(&frame.body) {
            Ok(v) => v,
            Err(_) => return,
        };

        match frame.op {
            FrameOp::Response => {
                self.registry.dispatch(Key::SeqKey(frame.seq.0 as u32), raw);
            }
            FrameOp::Event => {
                if !type_key.is_empty() {
                    self.registry.dispatch(Key::TypeKey(type_key), raw.clone());
                }
                if let Some(handle) = frame.body.get("conn_handle").and_then(|v| v.as_u64()) {
                    self.registry.dispatch(
                        Key::ConnKey(crate::key::ConnHandle(handle as u16)),
                        raw,
                    );
                }
            }
            FrameOp::Request => {
                // blehostd never sends us requests; ignore defensively.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_ids_are_monotonic_and_unique() {
        let a = next_owner_id();
        let b = next_owner_id();
        assert_ne!(a, b);
    }
}
