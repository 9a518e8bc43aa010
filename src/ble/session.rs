//! A BLE-transport [`Session`]: connects to one peer, brings up GATT
//! notifications for the chosen management protocol, and issues
//! management requests as GATT writes correlated by NMP/OMP sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ble::connector::{ConnectParams, Connector};
use crate::ble::gatt_table::{target_for, GattTarget};
use crate::ble::protocol::NotifyEvt;
use crate::ble::transport::{next_owner_id, BleTransport};
use crate::config::BleSesnCfg;
use crate::error::Error;
use crate::key::{ConnHandle, Key};
use crate::omp::OMP_MSG_OVERHEAD;
use crate::seq::{Seq, SeqGenerator};
use crate::session::{EncryptWhen, MgmtProto, Session, TxOptions};
use crate::transceiver::Transceiver;

struct Link {
    conn: ConnHandle,
    target: GattTarget,
}

/// The standing task pumping GATT notifications for one connection into
/// this session's own `txr`, plus what's needed to tear it down cleanly.
struct NotifyPump {
    conn: ConnHandle,
    listener_id: u64,
    task: JoinHandle<()>,
}

/// A management session over one BLE connection.
pub struct BleSesn {
    xport: Arc<BleTransport>,
    cfg: BleSesnCfg,
    owner: u64,
    open: AtomicBool,
    link: RwLock<Option<Link>>,
    seq_gen: SeqGenerator,
    txr: Transceiver,
    mtu: AtomicU16,
    notify_pump: StdMutex<Option<NotifyPump>>,
    coap_listeners: StdMutex<HashMap<Key, u64>>,
}

impl BleSesn {
    pub fn new(xport: Arc<BleTransport>, cfg: BleSesnCfg) -> Self {
        let mtu = cfg.preferred_mtu;
        Self {
            xport,
            cfg,
            owner: next_owner_id(),
            open: AtomicBool::new(false),
            link: RwLock::new(None),
            seq_gen: SeqGenerator::new(),
            txr: Transceiver::new(crate::listener::DEFAULT_QUEUE_BOUND),
            mtu: AtomicU16::new(mtu),
            notify_pump: StdMutex::new(None),
            coap_listeners: StdMutex::new(HashMap::new()),
        }
    }

    fn peer_addr(&self) -> Result<String, Error> {
        match &self.cfg.peer {
            crate::session::PeerSpec::Name(n) | crate::session::PeerSpec::Resolved(n) => {
                if n.is_empty() {
                    Err(Error::InvalidArg("peer address not set".into()))
                } else {
                    Ok(n.clone())
                }
            }
        }
    }

    async fn exchange_mtu(&self, conn: ConnHandle) -> Result<u16, Error> {
        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "conn_handle": conn.0,
            "mtu": self.cfg.preferred_mtu,
        });
        let rsp = self.xport.request_raw("exchange_mtu", seq, body).await?;
        let negotiated = rsp
            .get("mtu")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.cfg.preferred_mtu as u64) as u16;
        Ok(negotiated)
    }

    async fn maybe_encrypt(&self, conn: ConnHandle) -> Result<(), Error> {
        match self.cfg.encrypt_when {
            EncryptWhen::Never => Ok(()),
            EncryptWhen::Always | EncryptWhen::IfRequired => {
                let seq = self.xport.next_request_seq();
                let mut body = serde_json::json!({ "conn_handle": conn.0 });
                if let Some(oob) = &self.cfg.oob_key {
                    body["oob_key"] = serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&oob.0));
                }
                let rsp = self.xport.request_raw("security_initiate", seq, body).await?;
                let status = rsp.get("status").and_then(|v| v.as_u64()).unwrap_or(0);
                if status != 0 {
                    if self.cfg.encrypt_when == EncryptWhen::Always {
                        return Err(Error::Security(format!("pairing failed with status {status}")));
                    }
                    debug!(status, "encryption not required by peer, continuing unencrypted");
                }
                Ok(())
            }
        }
    }

    async fn discover_and_subscribe(&self, conn: ConnHandle) -> Result<GattTarget, Error> {
        let target = target_for(self.cfg.mgmt_proto);
        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "conn_handle": conn.0,
            "svc_uuid": target.service.to_string(),
            "chr_uuid": target.chr.to_string(),
        });
        self.xport.request_raw("disc_chr_uuid", seq, body).await?;

        let seq = self.xport.next_request_seq();
        let body = serde_json::json!({
            "conn_handle": conn.0,
            "chr_uuid": target.chr.to_string(),
            "indicate": false,
        });
        self.xport.request_raw("subscribe", seq, body).await?;
        Ok(target)
    }

    fn correlation_key(&self, seq: Seq) -> Key {
        crate::session::correlation_key_for(self.cfg.mgmt_proto, seq)
    }

    /// Bridges GATT notifications for `conn` into this session's own `txr`
    /// registry: the transport dispatches every `notify` event by
    /// `Key::ConnKey` on its own daemon-level registry, but only the
    /// session knows how to parse the NMP/OMP-framed bytes inside the
    /// notification's `data` field into the real `SeqKey`/`TokenKey` its
    /// `tx_rx_mgmt` listeners are waiting on.
    fn spawn_notify_pump(&self, conn: ConnHandle) -> Result<NotifyPump, Error> {
        let listener = self.xport.registry().add(Key::ConnKey(conn))?;
        let listener_id = listener.id();
        let sesn_registry = self.txr.registry().clone();
        let mgmt_proto = self.cfg.mgmt_proto;
        let task = tokio::spawn(async move {
            let mut listener = listener;
            loop {
                match listener.recv().await {
                    Ok(raw) => {
                        if let Some((key, bytes)) = decode_notify(mgmt_proto, &raw) {
                            sesn_registry.dispatch(key, bytes);
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(NotifyPump {
            conn,
            listener_id,
            task,
        })
    }
}

/// Parses one `notify` event body into the management response it carries
/// and the key its sender's response would be filed under, or `None` if
/// the event isn't a recognizable management response (malformed data, or
/// a CoAP request code on a `CoapServer` session, which a future inbound
/// path would need to route separately).
fn decode_notify(mgmt_proto: MgmtProto, raw: &[u8]) -> Option<(Key, Vec<u8>)> {
    let evt: NotifyEvt = serde_json::from_slice(raw).ok()?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(evt.data).ok()?;
    match mgmt_proto {
        MgmtProto::Nmp => {
            let hdr = crate::nmp::header::Header::parse(&bytes).ok()?;
            hdr.op.is_response().then_some((Key::SeqKey(hdr.seq as u32), bytes))
        }
        MgmtProto::Omp | MgmtProto::CoapServer => {
            let msg = crate::omp::coap::CoapMessage::decode_dgram(&bytes).ok()?;
            if !msg.code.is_omp_success_response() || msg.token.len() != 8 {
                return None;
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&msg.token);
            Some((Key::TokenKey(crate::key::Token(arr)), bytes))
        }
    }
}

#[async_trait]
impl Session for BleSesn {
    async fn open(&self) -> Result<(), Error> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(Error::SesnAlreadyOpen);
        }

        let result: Result<(), Error> = async {
            // `Connector::run` performs its own `AcquireMasterPrimary`; a
            // session opening does not separately arbitrate, matching the
            // original "acquire once, delegate to the raw connect" shape.
            let connector = Connector::new(self.xport.clone());
            let conn = connector
                .run(ConnectParams {
                    peer_addr: self.peer_addr()?,
                    peer_addr_type: 0,
                    own_addr_type: 0,
                    duration_ms: 5000,
                })
                .await?;

            self.maybe_encrypt(conn).await?;
            let negotiated_mtu = self.exchange_mtu(conn).await?;
            let target = self.discover_and_subscribe(conn).await?;
            let pump = self.spawn_notify_pump(conn)?;

            self.mtu.store(negotiated_mtu, Ordering::SeqCst);
            *self.notify_pump.lock().unwrap() = Some(pump);
            let mut link = self.link.write().await;
            *link = Some(Link { conn, target });
            info!(conn_handle = conn.0, negotiated_mtu, "ble session open");
            Ok(())
        }
        .await;

        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.link.write().await.take();
        self.txr.error_all(Error::SesnClosed);
        if let Some(pump) = self.notify_pump.lock().unwrap().take() {
            pump.task.abort();
            self.xport.registry().remove_by_id(Key::ConnKey(pump.conn), pump.listener_id);
        }
        if let Some(link) = conn {
            let seq = self.xport.next_request_seq();
            let _ = self
                .xport
                .request_raw(
                    "terminate",
                    seq,
                    serde_json::json!({ "conn_handle": link.conn.0 }),
                )
                .await;
        }
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The negotiated MTU ceiling from `open()`'s `exchange_mtu` step, or
    /// `preferred_mtu` before a session has ever opened.
    fn mtu_in(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    fn mtu_out(&self) -> u16 {
        let mtu = self.mtu.load(Ordering::SeqCst);
        match self.cfg.mgmt_proto {
            MgmtProto::Nmp => mtu,
            MgmtProto::Omp | MgmtProto::CoapServer => mtu.saturating_sub(OMP_MSG_OVERHEAD as u16),
        }
    }

    fn mgmt_proto(&self) -> MgmtProto {
        self.cfg.mgmt_proto
    }

    fn coap_is_tcp(&self) -> bool {
        false
    }

    async fn abort_rx(&self, key: Key) -> Result<(), Error> {
        self.txr.dispatch_err(key, Error::Cancelled);
        Ok(())
    }

    async fn tx_rx_mgmt(&self, raw: Vec<u8>, key: Key, opts: TxOptions) -> Result<Vec<u8>, Error> {
        if !self.is_open().await {
            return Err(Error::SesnClosed);
        }
        let link = self.link.read().await;
        let link = link.as_ref().ok_or(Error::SesnClosed)?;
        let conn = link.conn;
        let target = link.target;
        let xport = self.xport.clone();

        self.txr
            .tx_rx_mgmt(raw, key, opts, move |chunk| {
                let xport = xport.clone();
                async move {
                    let seq = xport.next_request_seq();
                    let body = serde_json::json!({
                        "conn_handle": conn.0,
                        "chr_uuid": target.chr.to_string(),
                        "data": base64::engine::general_purpose::STANDARD.encode(&chunk),
                    });
                    xport.request_raw("write_cmd", seq, body).await.map(|_| ())
                }
            })
            .await
    }

    async fn tx_rx_mgmt_async(&self, raw: Vec<u8>, key: Key) -> Result<crate::listener::Listener, Error> {
        if !self.is_open().await {
            return Err(Error::SesnClosed);
        }
        let link = self.link.read().await;
        let link = link.as_ref().ok_or(Error::SesnClosed)?;
        let conn = link.conn;
        let target = link.target;
        let xport = self.xport.clone();

        self.txr
            .tx_rx_mgmt_async(raw, key, move |chunk| {
                let xport = xport.clone();
                async move {
                    let seq = xport.next_request_seq();
                    let body = serde_json::json!({
                        "conn_handle": conn.0,
                        "chr_uuid": target.chr.to_string(),
                        "data": base64::engine::general_purpose::STANDARD.encode(&chunk),
                    });
                    xport.request_raw("write_cmd", seq, body).await.map(|_| ())
                }
            })
            .await
    }

    async fn listen_coap(&self, key: Key) -> Result<crate::listener::Listener, Error> {
        let listener = self.txr.registry().add(key)?;
        self.coap_listeners.lock().unwrap().insert(key, listener.id());
        Ok(listener)
    }

    async fn stop_listen_coap(&self, key: Key) -> Result<(), Error> {
        if let Some(id) = self.coap_listeners.lock().unwrap().remove(&key) {
            self.txr.registry().remove_by_id(key, id);
        }
        Ok(())
    }

    async fn tx_coap(&self, raw: Vec<u8>, opts: TxOptions) -> Result<Vec<u8>, Error> {
        let seq = self.seq_gen.next();
        self.tx_rx_mgmt(raw, self.correlation_key(seq), opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BleSesnCfg, BleXportCfg};
    use crate::session::PeerSpec;

    #[tokio::test]
    async fn opening_without_a_peer_address_fails_fast() {
        let xport = Arc::new(BleTransport::new(BleXportCfg::default()));
        let sesn = BleSesn::new(
            xport,
            BleSesnCfg {
                peer: PeerSpec::Name(String::new()),
                ..Default::default()
            },
        );
        let err = sesn.open().await.unwrap_err();
        assert!(matches!(err, Error::Xport) || matches!(err, Error::InvalidArg(_)));
    }

    #[test]
    fn nmp_and_omp_use_different_correlation_key_shapes() {
        let xport = Arc::new(BleTransport::new(BleXportCfg::default()));
        let nmp = BleSesn::new(
            xport.clone(),
            BleSesnCfg {
                mgmt_proto: MgmtProto::Nmp,
                ..Default::default()
            },
        );
        let omp = BleSesn::new(
            xport,
            BleSesnCfg {
                mgmt_proto: MgmtProto::Omp,
                ..Default::default()
            },
        );
        let seq = Seq::new(1);
        assert!(matches!(nmp.correlation_key(seq), Key::SeqKey(_)));
        assert!(matches!(omp.correlation_key(seq), Key::TokenKey(_)));
    }
}
