//! The blehostd wire protocol: newline-delimited JSON over the daemon's
//! UNIX socket. Every frame carries a 16-bit sequence number in its own
//! namespace, disjoint from the NMP/OMP [`crate::seq::Seq`] used once a
//! session is open: this is the daemon's own request/response/event
//! correlation, one layer below management traffic.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Sequence numbers below this value are request/response traffic;
/// at and above it, they are unsolicited daemon events.
pub const EVENT_SEQ_THRESHOLD: u16 = 0xB000;

pub const REQ_SEQ_MIN: u16 = 1;

/// The daemon's own frame-correlation sequence number (distinct from
/// [`crate::seq::Seq`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DaemonSeq(pub u16);

impl DaemonSeq {
    pub fn is_event(self) -> bool {
        self.0 >= EVENT_SEQ_THRESHOLD
    }
}

/// Generates daemon-level sequence numbers. Requests and events are drawn
/// from disjoint ranges so a stray event frame can never alias a pending
/// request's correlation key.
pub struct DaemonSeqGenerator {
    next_req: Mutex<u16>,
    next_evt: Mutex<u16>,
}

impl DaemonSeqGenerator {
    pub fn new() -> Self {
        Self {
            next_req: Mutex::new(REQ_SEQ_MIN),
            next_evt: Mutex::new(EVENT_SEQ_THRESHOLD),
        }
    }

    pub fn next_request(&self) -> DaemonSeq {
        let mut guard = self.next_req.lock().unwrap();
        let seq = *guard;
        *guard = if seq + 1 >= EVENT_SEQ_THRESHOLD {
            REQ_SEQ_MIN
        } else {
            seq + 1
        };
        DaemonSeq(seq)
    }

    pub fn next_event(&self) -> DaemonSeq {
        let mut guard = self.next_evt.lock().unwrap();
        let seq = *guard;
        *guard = if seq == u16::MAX { EVENT_SEQ_THRESHOLD } else { seq + 1 };
        DaemonSeq(seq)
    }
}

impl Default for DaemonSeqGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// The `op` discriminant present on every daemon frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameOp {
    Request,
    Response,
    Event,
}

/// A daemon frame with its envelope fields parsed out but its payload left
/// as a raw [`serde_json::Value`] for type-specific decoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub op: FrameOp,
    pub msg_type: String,
    pub seq: DaemonSeq,
    pub body: Value,
}

impl Frame {
    /// Parses one line of the daemon's newline-delimited JSON stream.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let mut value: Value = serde_json::from_str(line)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::Decoding("daemon frame is not a json object".into()))?;

        let op: FrameOp = obj
            .remove("op")
            .ok_or_else(|| Error::Decoding("daemon frame missing op".into()))
            .and_then(|v| serde_json::from_value(v).map_err(Error::from))?;
        let msg_type = obj
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Decoding("daemon frame missing type".into()))?;
        let seq = obj
            .remove("seq")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Decoding("daemon frame missing seq".into()))?;
        if seq > u16::MAX as u64 {
            return Err(Error::Decoding("daemon frame seq exceeds u16".into()));
        }

        Ok(Frame {
            op,
            msg_type,
            seq: DaemonSeq(seq as u16),
            body: value,
        })
    }

    /// Serializes a request frame for `body`, which must already carry its
    /// type-specific fields; `type` is merged in under the given name.
    pub fn build_request(msg_type: &str, seq: DaemonSeq, mut body: Value) -> Result<String, Error> {
        let obj = body
            .as_object_mut()
            .ok_or_else(|| Error::Encoding("daemon request body must be a json object".into()))?;
        obj.insert("op".into(), serde_json::to_value(FrameOp::Request)?);
        obj.insert("type".into(), Value::String(msg_type.to_string()));
        obj.insert("seq".into(), Value::from(seq.0));
        Ok(serde_json::to_string(&body)?)
    }

    /// Deserializes `self.body` as `T`, the type-specific payload fields
    /// already having had the envelope fields stripped by [`Frame::parse`].
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        serde_json::from_value(self.body.clone()).map_err(Error::from)
    }
}

/// `sync` request/response: the handshake exchanged once at daemon
/// startup to confirm protocol compatibility before any BLE operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRsp {
    pub synced: bool,
}

/// `error` response body: the daemon reports a non-zero status for a
/// request that otherwise matched a known type/seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRsp {
    pub status: u32,
}

/// `connect` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectReq {
    pub own_addr_type: u8,
    pub peer_addr_type: u8,
    pub peer_addr: String,
    pub duration_ms: i32,
}

/// `connect` event: delivered asynchronously once the link completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectEvt {
    pub status: u32,
    pub conn_handle: u16,
}

/// `notify` event: a GATT notification/indication on the subscribed
/// management characteristic, carrying the next (or only) chunk of an
/// NMP/OMP response, base64-encoded in `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyEvt {
    pub conn_handle: u16,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_event_seqs_never_alias() {
        let gen = DaemonSeqGenerator::new();
        let req = gen.next_request();
        let evt = gen.next_event();
        assert!(!req.is_event());
        assert!(evt.is_event());
        assert_ne!(req.0, evt.0);
    }

    #[test]
    fn request_seq_wraps_below_event_threshold() {
        let gen = DaemonSeqGenerator::new();
        for _ in 0..(EVENT_SEQ_THRESHOLD - REQ_SEQ_MIN) {
            let s = gen.next_request();
            assert!(!s.is_event());
        }
        let wrapped = gen.next_request();
        assert_eq!(wrapped.0, REQ_SEQ_MIN);
    }

    #[test]
    fn notify_evt_decodes_conn_handle_and_base64_data() {
        let body = serde_json::json!({ "conn_handle": 3, "data": "aGk=" });
        let evt: NotifyEvt = serde_json::from_value(body).unwrap();
        assert_eq!(evt.conn_handle, 3);
        assert_eq!(evt.data, "aGk=");
    }

    #[test]
    fn frame_roundtrips_through_parse_and_build() {
        let body = serde_json::json!({ "synced": true });
        let line = Frame::build_request("sync", DaemonSeq(1), body).unwrap();
        let frame = Frame::parse(&line).unwrap();
        assert_eq!(frame.op, FrameOp::Request);
        assert_eq!(frame.msg_type, "sync");
        assert_eq!(frame.seq.0, 1);
        let decoded: SyncRsp = frame.decode().unwrap();
        assert!(decoded.synced);
    }
}
