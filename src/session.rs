//! The transport-agnostic session contract: BLE and serial sessions both
//! implement [`Session`], and a [`crate::transceiver::Transceiver`] drives
//! either one identically.

use async_trait::async_trait;
use std::time::Duration;

use crate::command::Request;
use crate::error::Error;
use crate::key::{Key, Token};
use crate::listener::Listener;
use crate::seq::Seq;

/// Which wire protocol a session speaks once open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtProto {
    /// Plain NMP: 8-byte header, CBOR body, no CoAP wrapping.
    Nmp,
    /// OMP: NMP wrapped in a CoAP `PUT /omp` request/response.
    Omp,
    /// A session that additionally serves inbound CoAP requests (used by
    /// serial `CoapServer` designated sessions).
    CoapServer,
}

/// Per-request timeout/retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub timeout: Duration,
    pub tries: u8,
}

impl TxOptions {
    pub const fn new(timeout: Duration, tries: u8) -> Self {
        Self { timeout, tries }
    }
}

/// Default retry policy for a session that does not override it: a single
/// attempt with a 10 second timeout.
pub const DFLT_TX_OPTIONS: TxOptions = TxOptions::new(Duration::from_secs(10), 1);

/// Identifies a peer to connect/scan for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSpec {
    /// Connect to a peer with this address (BLE transports) or at this
    /// device path (serial transports).
    Name(String),
    /// Connect to whichever peer a prior scan already resolved.
    Resolved(String),
}

/// When a session must encrypt its link before opening succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptWhen {
    Never,
    Always,
    /// Encrypt only if the peer requires it during service discovery.
    IfRequired,
}

/// Session-level configuration shared across transports.
#[derive(Debug, Clone)]
pub struct SesnCfg {
    pub peer: PeerSpec,
    pub mgmt_proto: MgmtProto,
    pub encrypt_when: EncryptWhen,
    pub preferred_mtu: u16,
    pub tx_options: TxOptions,
}

impl Default for SesnCfg {
    fn default() -> Self {
        Self {
            peer: PeerSpec::Name(String::new()),
            mgmt_proto: MgmtProto::Nmp,
            encrypt_when: EncryptWhen::Never,
            preferred_mtu: 512,
            tx_options: DFLT_TX_OPTIONS,
        }
    }
}

/// A single management session against one peer, over one transport.
///
/// Implementations: [`crate::ble::session::BleSesn`],
/// [`crate::serial::session::SerialSesn`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens the session: connects/selects the peer, performs any
    /// encryption handshake, and brings the transport-level link up.
    /// Returns [`Error::SesnAlreadyOpen`] if already open.
    async fn open(&self) -> Result<(), Error>;

    /// Closes the session. Idempotent: closing an already-closed session
    /// succeeds without error.
    async fn close(&self) -> Result<(), Error>;

    async fn is_open(&self) -> bool;

    /// Maximum inbound management payload size in bytes.
    fn mtu_in(&self) -> u16;

    /// Maximum outbound management payload size in bytes, after protocol
    /// overhead ([`crate::omp::OMP_MSG_OVERHEAD`] for OMP sessions) is
    /// subtracted.
    fn mtu_out(&self) -> u16;

    fn mgmt_proto(&self) -> MgmtProto;

    /// Whether this session's CoAP framing is the TCP/serial-style framing
    /// rather than the UDP-style datagram framing.
    fn coap_is_tcp(&self) -> bool;

    /// Cancels all outstanding requests on this session with
    /// [`Error::Cancelled`], without closing the underlying link.
    async fn abort_rx(&self, key: Key) -> Result<(), Error>;

    /// Sends `raw` (a fully encoded request) and awaits the matching
    /// response, retrying per `opts`.
    async fn tx_rx_mgmt(&self, raw: Vec<u8>, key: Key, opts: TxOptions) -> Result<Vec<u8>, Error>;

    /// Installs a listener for `key` without blocking for a response; the
    /// caller polls/awaits the returned listener directly. Cancellable by
    /// dropping the returned listener.
    async fn tx_rx_mgmt_async(&self, raw: Vec<u8>, key: Key) -> Result<Listener, Error>;

    /// Registers a standing listener for inbound CoAP requests matching
    /// `key` (typically a [`Key::TypeKey`]), used by `CoapServer` sessions.
    async fn listen_coap(&self, key: Key) -> Result<Listener, Error>;

    async fn stop_listen_coap(&self, key: Key) -> Result<(), Error>;

    /// Sends a raw CoAP request payload and awaits its response, for
    /// sessions speaking plain CoAP outside of OMP's management framing.
    async fn tx_coap(&self, raw: Vec<u8>, opts: TxOptions) -> Result<Vec<u8>, Error>;
}

/// The correlation key a session's wire protocol uses for `seq`: the raw
/// NMP sequence for plain NMP, or its zero-padded CoAP token for OMP.
pub fn correlation_key_for(mgmt_proto: MgmtProto, seq: Seq) -> Key {
    match mgmt_proto {
        MgmtProto::Nmp => Key::SeqKey(seq.get() as u32),
        MgmtProto::Omp | MgmtProto::CoapServer => Key::TokenKey(Token::from_seq(seq)),
    }
}

/// Encodes `req` for whichever protocol `session` speaks, sends it, and
/// decodes the matching response: the glue between a
/// [`crate::command::Request`] and a session's raw [`Session::tx_rx_mgmt`].
pub async fn send_request<R: Request>(
    session: &dyn Session,
    req: &R,
    seq: Seq,
    opts: TxOptions,
) -> Result<R::Response, Error> {
    let key = correlation_key_for(session.mgmt_proto(), seq);
    match session.mgmt_proto() {
        MgmtProto::Nmp => {
            let (_hdr, raw) = crate::nmp::encode_req(req, seq)?;
            let rsp_raw = session.tx_rx_mgmt(raw, key, opts).await?;
            let hdr = crate::nmp::Header::parse(&rsp_raw)?;
            crate::nmp::decode_rsp_body::<R>(&hdr, &rsp_raw)
        }
        MgmtProto::Omp | MgmtProto::CoapServer => {
            let rsp_raw = if session.coap_is_tcp() {
                let (_hdr, frame) = crate::omp::encode_omp_tcp(req, seq)?;
                let rsp_raw = session.tx_rx_mgmt(frame, key, opts).await?;
                return crate::omp::decode_omp_tcp::<R>(&rsp_raw)?
                    .map(|(_hdr, rsp)| rsp)
                    .ok_or_else(|| Error::Decoding("peer returned a non-success omp response".into()));
            } else {
                let (_hdr, dgram) = crate::omp::encode_omp_dgram(req, seq, seq.get() as u16)?;
                session.tx_rx_mgmt(dgram, key, opts).await?
            };
            crate::omp::decode_omp_dgram::<R>(&rsp_raw)?
                .map(|(_hdr, rsp)| rsp)
                .ok_or_else(|| Error::Decoding("peer returned a non-success omp response".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::echo::{EchoReq, EchoRsp};
    use crate::nmp::header::Op;

    #[test]
    fn default_tx_options_match_original_defaults() {
        assert_eq!(DFLT_TX_OPTIONS.tries, 1);
        assert_eq!(DFLT_TX_OPTIONS.timeout, Duration::from_secs(10));
    }

    /// A bare-bones session that only implements `tx_rx_mgmt`, standing in
    /// for a real transport to exercise `send_request`'s encode/decode
    /// glue end to end.
    struct EchoSesn {
        proto: MgmtProto,
        tcp: bool,
    }

    #[async_trait]
    impl Session for EchoSesn {
        async fn open(&self) -> Result<(), Error> {
            Ok(())
        }
        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
        async fn is_open(&self) -> bool {
            true
        }
        fn mtu_in(&self) -> u16 {
            512
        }
        fn mtu_out(&self) -> u16 {
            512
        }
        fn mgmt_proto(&self) -> MgmtProto {
            self.proto
        }
        fn coap_is_tcp(&self) -> bool {
            self.tcp
        }
        async fn abort_rx(&self, _key: Key) -> Result<(), Error> {
            Ok(())
        }
        async fn tx_rx_mgmt(&self, raw: Vec<u8>, _key: Key, _opts: TxOptions) -> Result<Vec<u8>, Error> {
            match self.proto {
                MgmtProto::Nmp => {
                    let mut hdr = crate::nmp::Header::parse(&raw)?;
                    hdr.op = Op::WriteRsp;
                    let body = serde_cbor::to_vec(&EchoRsp {
                        payload: "hi".into(),
                        rc: 0,
                    })
                    .unwrap();
                    hdr.length = body.len() as u16;
                    let mut out = hdr.to_bytes().to_vec();
                    out.extend_from_slice(&body);
                    Ok(out)
                }
                MgmtProto::Omp | MgmtProto::CoapServer => {
                    if self.tcp {
                        unimplemented!("tcp framing covered directly by omp::tests")
                    } else {
                        let req_msg = crate::omp::coap::CoapMessage::decode_dgram(&raw)?;
                        let seq = Seq::from_token(&req_msg.token).unwrap();
                        let mut hdr = crate::nmp::Header::new(Op::Write, 0, seq.get(), 0, 0);
                        hdr.op = Op::WriteRsp;
                        let rsp_body = EchoRsp {
                            payload: "hi".into(),
                            rc: 0,
                        };
                        let mut map = match serde_cbor::value::to_value(&rsp_body).unwrap() {
                            serde_cbor::Value::Map(m) => m,
                            _ => unreachable!(),
                        };
                        map.insert(
                            serde_cbor::Value::Text("_h".into()),
                            serde_cbor::Value::Bytes(hdr.to_bytes().to_vec()),
                        );
                        let payload = serde_cbor::to_vec(&serde_cbor::Value::Map(map)).unwrap();
                        let mut rsp_msg = crate::omp::coap::CoapMessage::new(
                            crate::omp::coap::CoapType::Acknowledgement,
                            crate::omp::coap::CoapCode::CHANGED,
                            req_msg.message_id,
                            req_msg.token.clone(),
                        );
                        rsp_msg.payload = payload;
                        Ok(rsp_msg.encode_dgram()?)
                    }
                }
            }
        }
        async fn tx_rx_mgmt_async(&self, _raw: Vec<u8>, _key: Key) -> Result<Listener, Error> {
            unimplemented!()
        }
        async fn listen_coap(&self, _key: Key) -> Result<Listener, Error> {
            unimplemented!()
        }
        async fn stop_listen_coap(&self, _key: Key) -> Result<(), Error> {
            unimplemented!()
        }
        async fn tx_coap(&self, _raw: Vec<u8>, _opts: TxOptions) -> Result<Vec<u8>, Error> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn send_request_roundtrips_over_nmp() {
        let sesn = EchoSesn {
            proto: MgmtProto::Nmp,
            tcp: false,
        };
        let req = EchoReq {
            payload: "hi".into(),
        };
        let rsp = send_request(&sesn, &req, Seq::new(3), DFLT_TX_OPTIONS)
            .await
            .unwrap();
        assert_eq!(rsp.payload, "hi");
    }

    #[tokio::test]
    async fn send_request_roundtrips_over_omp_datagram() {
        let sesn = EchoSesn {
            proto: MgmtProto::Omp,
            tcp: false,
        };
        let req = EchoReq {
            payload: "hi".into(),
        };
        let rsp = send_request(&sesn, &req, Seq::new(9), DFLT_TX_OPTIONS)
            .await
            .unwrap();
        assert_eq!(rsp.payload, "hi");
    }
}
