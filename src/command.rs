//! The pluggable boundary between the transceiver core and individual
//! management command payload schemas.
//!
//! The core never interprets a command body: it only needs each request
//! type to name its group/command id and to be (de)serializable as a CBOR
//! map. Concrete command families (image upload, stats, log read, ...) are
//! out of scope for this crate and live as separate implementations of
//! [`Request`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::nmp::header::Op;

/// A management request body.
///
/// `GROUP`/`COMMAND_ID` select the NMP header fields; `OP` is `Read` or
/// `Write` (the transceiver maps it to the matching `*Rsp` op on decode).
pub trait Request: Serialize {
    type Response: DeserializeOwned;

    const GROUP: u16;
    const COMMAND_ID: u8;
    const OP: Op;

    /// Encodes the body as a CBOR byte string. The default implementation
    /// is correct for any `Serialize` body; override only if a command
    /// needs non-map CBOR framing.
    fn encode_body(&self) -> Result<Vec<u8>, Error> {
        serde_cbor::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }
}

/// Decodes a response body given the already-parsed NMP header.
pub fn decode_response<R: Request>(body: &[u8]) -> Result<R::Response, Error> {
    serde_cbor::from_slice(body).map_err(|e| Error::Decoding(e.to_string()))
}

/// A minimal loopback-testable command: the peer echoes `payload` back and
/// reports a status code. Used throughout this crate's own test suite and
/// as a template for real command implementations.
pub mod echo {
    use super::*;

    pub const GROUP_OS: u16 = 0;
    pub const ID_ECHO: u8 = 0;

    #[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
    pub struct EchoReq {
        #[serde(rename = "d")]
        pub payload: String,
    }

    #[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
    pub struct EchoRsp {
        #[serde(rename = "r")]
        pub payload: String,
        #[serde(rename = "rc", default)]
        pub rc: i32,
    }

    impl Request for EchoReq {
        type Response = EchoRsp;
        const GROUP: u16 = GROUP_OS;
        const COMMAND_ID: u8 = ID_ECHO;
        const OP: Op = Op::Write;
    }
}
