//! End-to-end scenarios against the transport-agnostic core: a
//! [`Transceiver`] and [`ListenerRegistry`] driven by an in-process
//! synthetic peer, standing in for a real `blehostd`/serial link.

use std::sync::Arc;
use std::time::Duration;

use mgmt_session::arbitration::RoleArbiter;
use mgmt_session::command::echo::{EchoReq, EchoRsp};
use mgmt_session::error::Error;
use mgmt_session::key::Key;
use mgmt_session::nmp;
use mgmt_session::nmp::header::Op;
use mgmt_session::omp;
use mgmt_session::seq::Seq;
use mgmt_session::session::TxOptions;
use mgmt_session::transceiver::Transceiver;

/// S1: plain-NMP echo round trip through the full send/listen/dispatch
/// path, not just the codec in isolation.
#[tokio::test]
async fn s1_echo_nmp_roundtrip() {
    let tc = Transceiver::new(8);
    let registry = tc.registry().clone();
    let seq = Seq::new(1);
    let req = EchoReq {
        payload: "ping".into(),
    };
    let (hdr, raw) = nmp::encode_req(&req, seq).unwrap();
    let key = Key::SeqKey(hdr.seq as u32);

    let responder_registry = registry.clone();
    let fut = tc.tx_rx_mgmt(raw, key, TxOptions::new(Duration::from_secs(1), 1), move |sent| {
        let registry = responder_registry.clone();
        async move {
            let sent_hdr = nmp::header::Header::parse(&sent).unwrap();
            let mut rsp_hdr = sent_hdr;
            rsp_hdr.op = Op::WriteRsp;
            let body = serde_cbor::to_vec(&EchoRsp {
                payload: "ping".into(),
                rc: 0,
            })
            .unwrap();
            rsp_hdr.length = body.len() as u16;
            let mut rsp_raw = rsp_hdr.to_bytes().to_vec();
            rsp_raw.extend_from_slice(&body);
            registry.dispatch(key, rsp_raw);
            Ok(())
        }
    });

    let rsp_raw = fut.await.unwrap();
    let parsed_hdr = nmp::header::Header::parse(&rsp_raw).unwrap();
    let rsp: EchoRsp = nmp::decode_rsp_body::<EchoReq>(&parsed_hdr, &rsp_raw).unwrap();
    assert_eq!(rsp.payload, "ping");
}

/// S2: OMP echo round trip, including the CoAP/OIC envelope.
#[tokio::test]
async fn s2_echo_omp_roundtrip() {
    let tc = Transceiver::new(8);
    let registry = tc.registry().clone();
    let seq = Seq::new(2);
    let req = EchoReq {
        payload: "pong".into(),
    };
    let (hdr, dgram) = omp::encode_omp_dgram(&req, seq, 0x55).unwrap();
    let key = Key::TokenKey(mgmt_session::key::Token::from_seq(seq));

    let responder_registry = registry.clone();
    let fut = tc.tx_rx_mgmt(dgram, key, TxOptions::new(Duration::from_secs(1), 1), move |_sent| {
        let registry = responder_registry.clone();
        let hdr = hdr;
        async move {
            let mut rsp_hdr = hdr;
            rsp_hdr.op = Op::WriteRsp;

            // Mirror the encoder's own OIC framing: a CBOR map holding the
            // response fields plus the raw NMP header bytes under `_h`.
            let mut map = serde_cbor::value::to_value(EchoRsp {
                payload: "pong".into(),
                rc: 0,
            })
            .unwrap();
            if let serde_cbor::Value::Map(m) = &mut map {
                m.insert(
                    serde_cbor::Value::Text("_h".into()),
                    serde_cbor::Value::Bytes(rsp_hdr.to_bytes().to_vec()),
                );
            }
            let payload = serde_cbor::to_vec(&map).unwrap();

            let mut msg = omp::coap::CoapMessage::new(
                omp::coap::CoapType::Acknowledgement,
                omp::coap::CoapCode::CHANGED,
                0x55,
                seq.to_token().to_vec(),
            );
            msg.payload = payload;
            registry.dispatch(key, msg.encode_dgram().unwrap());
            Ok(())
        }
    });

    let rsp_raw = fut.await.unwrap();
    let (decoded_hdr, decoded): (nmp::Header, EchoRsp) =
        omp::decode_omp_dgram::<EchoReq>(&rsp_raw).unwrap().unwrap();
    assert_eq!(decoded_hdr.seq, 2);
    assert_eq!(decoded.payload, "pong");
}

/// S3: the peer never answers; the transceiver must exhaust its retry
/// budget and report a management timeout rather than hang.
#[tokio::test]
async fn s3_timeout_exhausts_retries() {
    let tc = Transceiver::new(4);
    let key = Key::SeqKey(42);
    let result = tc
        .tx_rx_mgmt(vec![1, 2, 3], key, TxOptions::new(Duration::from_millis(10), 3), |_raw| async {
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(Error::NmpTimeout)));
}

/// S4: a transport crash must cancel every outstanding listener instead
/// of leaving callers blocked forever.
#[tokio::test]
async fn s4_transport_crash_unblocks_all_listeners() {
    let tc = Transceiver::new(4);
    let registry = tc.registry().clone();
    let mut listeners = Vec::new();
    for i in 0..3u32 {
        listeners.push(registry.add(Key::SeqKey(i)).unwrap());
    }

    tc.error_all(Error::Xport);

    for mut l in listeners {
        let result = tokio::time::timeout(Duration::from_millis(200), l.recv())
            .await
            .expect("listener should resolve promptly after error_all");
        assert!(matches!(result, Err(Error::Xport)));
    }
}

/// S5: master-role arbitration is FIFO and a primary waiter preempts the
/// routine queue.
#[tokio::test]
async fn s5_arbitration_primary_preempts_routine_waiters() {
    let arb = Arc::new(RoleArbiter::new());
    let held = arb.acquire(1).await.unwrap();

    let arb_a = arb.clone();
    let routine = tokio::spawn(async move { arb_a.acquire(2).await.map(|g| g.owner()) });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let arb_b = arb.clone();
    let primary = tokio::spawn(async move { arb_b.acquire_primary(3).await.map(|g| g.owner()) });
    tokio::time::sleep(Duration::from_millis(10)).await;

    held.release();
    assert_eq!(primary.await.unwrap().unwrap(), 3);
    let _ = routine.await;
}

/// S6: stopping an in-progress advertise must not deadlock even though no
/// real daemon is present to ack the stop request; `stop()` cancels the
/// wait for the slave role outright.
#[tokio::test]
async fn s6_advertise_stop_cancels_waiting_advertiser() {
    use mgmt_session::ble::advertiser::{AdvParams, Advertiser};
    use mgmt_session::ble::transport::BleTransport;
    use mgmt_session::config::BleXportCfg;

    let xport = Arc::new(BleTransport::new(BleXportCfg::default()));
    // Hold the slave role ourselves so the advertiser has to queue.
    let holder_owner = mgmt_session::ble::transport::next_owner_id();
    let held = xport.slave.acquire(holder_owner).await.unwrap();

    let adv = Arc::new(Advertiser::new(xport.clone()));
    let adv_run = adv.clone();
    let handle = tokio::spawn(async move {
        adv_run
            .run(AdvParams {
                duration_ms: 1000,
                connectable: true,
                own_addr_type: 0,
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    adv.stop();
    held.release();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}
