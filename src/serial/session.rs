//! A serial-transport [`Session`]. Unlike BLE, the serial link has no
//! connect/disconnect step: "open" means claim the transport for this
//! session's correlation/accept routing, "close" releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::key::Key;
use crate::listener::Listener;
use crate::omp::OMP_MSG_OVERHEAD;
use crate::seq::{Seq, SeqGenerator};
use crate::serial::transport::{next_sesn_id, AcceptSesn, SerialTransport};
use crate::session::{MgmtProto, Session, TxOptions};
use crate::transceiver::Transceiver;

/// Default retries for a serial session: three attempts, matching a link
/// that is physically present but can drop a line under load.
pub const SERIAL_DEFAULT_TRIES: u8 = 3;

pub struct SerialSesn {
    xport: Arc<SerialTransport>,
    mgmt_proto: MgmtProto,
    owner: u64,
    self_weak: Weak<SerialSesn>,
    open: AtomicBool,
    seq_gen: SeqGenerator,
    txr: Transceiver,
    coap_listeners: StdMutex<HashMap<Key, u64>>,
    accept_queue: Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
    accept_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
}

impl SerialSesn {
    pub fn new(xport: Arc<SerialTransport>, mgmt_proto: MgmtProto) -> Arc<Self> {
        let (accept_tx, accept_rx) = tokio::sync::mpsc::channel(crate::listener::DEFAULT_QUEUE_BOUND);
        Arc::new_cyclic(|weak| Self {
            xport,
            mgmt_proto,
            owner: next_sesn_id(),
            self_weak: weak.clone(),
            open: AtomicBool::new(false),
            seq_gen: SeqGenerator::new(),
            txr: Transceiver::new(crate::listener::DEFAULT_QUEUE_BOUND),
            coap_listeners: StdMutex::new(HashMap::new()),
            accept_queue: Mutex::new(accept_rx),
            accept_tx,
        })
    }

    fn correlation_key(&self, seq: Seq) -> Key {
        crate::session::correlation_key_for(self.mgmt_proto, seq)
    }

    /// Extracts the correlation key this session's own wire framing would
    /// use for `raw` if it is a response, by peeking the framing this
    /// session's `mgmt_proto` produces. Returns `None` for anything that
    /// doesn't parse as a response in that framing (an unsolicited CoAP
    /// request, or malformed bytes).
    fn response_key(&self, raw: &[u8]) -> Option<Key> {
        match self.mgmt_proto {
            MgmtProto::Nmp => {
                let hdr = crate::nmp::header::Header::parse(raw).ok()?;
                hdr.op.is_response().then(|| Key::SeqKey(hdr.seq as u32))
            }
            MgmtProto::Omp | MgmtProto::CoapServer => {
                if raw.len() < 2 {
                    return None;
                }
                let tkl = usize::from(raw[0] & 0x0f);
                let code = crate::omp::coap::CoapCode(raw[1]);
                if !code.is_omp_success_response() || raw.len() < 2 + tkl {
                    return None;
                }
                let token = &raw[2..2 + tkl];
                if token.len() != 8 {
                    return None;
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(token);
                Some(Key::TokenKey(crate::key::Token(arr)))
            }
        }
    }

    /// Routes one inbound frame demultiplexed by the transport: a
    /// correlated response goes to this session's own `txr` registry (the
    /// bridge the transport itself cannot perform, since only the session
    /// knows its own `mgmt_proto` framing); anything else is treated as an
    /// unsolicited `CoapServer` request and queued for `next_coap_request`.
    fn route_inbound(&self, raw: Vec<u8>) {
        if let Some(key) = self.response_key(&raw) {
            self.txr.dispatch(key, raw);
            return;
        }
        let _ = self.accept_tx.try_send(raw);
    }

    /// Waits for the next unsolicited CoAP request delivered via
    /// [`AcceptSesn::rx_accept`], for a `CoapServer` session's consumer to
    /// drive its own request/response handling.
    pub async fn next_coap_request(&self) -> Option<Vec<u8>> {
        self.accept_queue.lock().await.recv().await
    }
}

impl AcceptSesn for SerialSesn {
    fn rx_accept(&self, raw: Vec<u8>) {
        self.route_inbound(raw);
    }

    fn rx_error(&self, err: Error) {
        self.txr.error_all(err);
    }
}

#[async_trait]
impl Session for SerialSesn {
    async fn open(&self) -> Result<(), Error> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(Error::SesnAlreadyOpen);
        }
        let result: Result<(), Error> = async {
            let strong: Arc<Self> = self.self_weak.upgrade().ok_or(Error::SesnClosed)?;
            self.xport.set_request_sesn(self.owner, strong.clone()).await?;
            if self.mgmt_proto == MgmtProto::CoapServer {
                self.xport.set_accept_sesn(self.owner, strong).await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
            self.xport.clear_request_sesn(self.owner).await;
        }
        result
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.xport.clear_request_sesn(self.owner).await;
        self.xport.clear_accept_sesn(self.owner).await;
        self.txr.error_all(Error::SesnClosed);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn mtu_in(&self) -> u16 {
        self.xport.mtu().saturating_sub(OMP_MSG_OVERHEAD as u16)
    }

    fn mtu_out(&self) -> u16 {
        // 3/4 of the framed line capacity (base64 overhead) less the OMP
        // CoAP envelope, matching the historical `MtuOut` formula.
        ((self.xport.mtu() as u32 * 3 / 4) as u16).saturating_sub(OMP_MSG_OVERHEAD as u16)
    }

    fn mgmt_proto(&self) -> MgmtProto {
        self.mgmt_proto
    }

    fn coap_is_tcp(&self) -> bool {
        true
    }

    async fn abort_rx(&self, key: Key) -> Result<(), Error> {
        self.txr.dispatch_err(key, Error::Cancelled);
        Ok(())
    }

    async fn tx_rx_mgmt(&self, raw: Vec<u8>, key: Key, opts: TxOptions) -> Result<Vec<u8>, Error> {
        if !self.is_open().await {
            return Err(Error::SesnClosed);
        }
        let xport = self.xport.clone();
        self.txr
            .tx_rx_mgmt(raw, key, opts, move |chunk| {
                let xport = xport.clone();
                async move { xport.send(&chunk).await }
            })
            .await
    }

    async fn tx_rx_mgmt_async(&self, raw: Vec<u8>, key: Key) -> Result<Listener, Error> {
        if !self.is_open().await {
            return Err(Error::SesnClosed);
        }
        let xport = self.xport.clone();
        self.txr
            .tx_rx_mgmt_async(raw, key, move |chunk| {
                let xport = xport.clone();
                async move { xport.send(&chunk).await }
            })
            .await
    }

    async fn listen_coap(&self, key: Key) -> Result<Listener, Error> {
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
    use crate::nmp;
    use crate::nmp::header::Op;
    use std::time::Duration;

    #[test]
    fn default_tries_matches_historical_serial_constant() {
        assert_eq!(SERIAL_DEFAULT_TRIES, 3);
    }

    /// Exercises the full send/route/dispatch path through a real
    /// `SerialTransport`, not just the codec: a response fed in via the
    /// transport's inbound routing must reach the session's own
    /// `tx_rx_mgmt` listener.
    #[tokio::test]
    async fn tx_rx_mgmt_receives_a_response_routed_through_the_transport() {
        let xport = SerialTransport::new_for_test();
        let sesn = SerialSesn::new(xport.clone(), MgmtProto::Nmp);
        sesn.open().await.unwrap();

        let seq = Seq::new(11);
        let req = crate::command::echo::EchoReq {
            payload: "ping".into(),
        };
        let (hdr, raw) = nmp::encode_req(&req, seq).unwrap();
        let key = Key::SeqKey(hdr.seq as u32);

        let xport_inject = xport.clone();
        let responder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut rsp_hdr = hdr;
            rsp_hdr.op = Op::WriteRsp;
            let body = serde_cbor::to_vec(&crate::command::echo::EchoRsp {
                payload: "ping".into(),
                rc: 0,
            })
            .unwrap();
            rsp_hdr.length = body.len() as u16;
            let mut rsp_raw = rsp_hdr.to_bytes().to_vec();
            rsp_raw.extend_from_slice(&body);
            xport_inject.inject_test_payload(rsp_raw).await;
        });

        let rsp_raw = sesn
            .tx_rx_mgmt(raw, key, TxOptions::new(Duration::from_secs(1), 1))
            .await
            .unwrap();
        let parsed = nmp::header::Header::parse(&rsp_raw).unwrap();
        let rsp: crate::command::echo::EchoRsp = nmp::decode_rsp_body::<crate::command::echo::EchoReq>(&parsed, &rsp_raw).unwrap();
        assert_eq!(rsp.payload, "ping");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn abort_rx_delivers_cancelled_not_a_malformed_frame() {
        let xport = SerialTransport::new_for_test();
        let sesn = SerialSesn::new(xport, MgmtProto::Nmp);
        sesn.open().await.unwrap();

        let key = Key::SeqKey(1);
        let fut = sesn.tx_rx_mgmt(vec![0; 8], key, TxOptions::new(Duration::from_secs(5), 1));
        tokio::pin!(fut);

        tokio::time::sleep(Duration::from_millis(10)).await;
        sesn.abort_rx(key).await.unwrap();

        let result = fut.await;
        assert!(matches!(result, Err(Error::Cancelled)), "expected Cancelled, got {result:?}");
    }

    #[tokio::test]
    async fn stop_listen_coap_removes_the_standing_listener() {
        let xport = SerialTransport::new_for_test();
        let sesn = SerialSesn::new(xport, MgmtProto::CoapServer);
        sesn.open().await.unwrap();

        let key = Key::TypeKey("omp");
        let mut first = sesn.listen_coap(key).await.unwrap();
        sesn.stop_listen_coap(key).await.unwrap();

        // `TypeKey` admits multiple listeners, so if `stop_listen_coap` had
        // failed to remove `first` (the disguised-no-op bug), it would
        // still receive this dispatch alongside `second`.
        let mut second = sesn.listen_coap(key).await.unwrap();
        assert!(sesn.txr.dispatch(key, b"hi".to_vec()));
        assert_eq!(second.recv().await.unwrap(), b"hi".to_vec());

        let timed_out = tokio::time::timeout(Duration::from_millis(50), first.recv()).await;
        assert!(timed_out.is_err(), "first listener should no longer be bound");
    }
}
