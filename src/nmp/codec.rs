//! Plain-NMP framing: 8-byte header followed by a CBOR body.

use crate::command::{self, Request};
use crate::error::Error;
use crate::nmp::header::{Header, Op, HEADER_LEN};
use crate::seq::Seq;

/// Encodes `req` into a full NMP message: header followed by CBOR body.
/// `length` is filled in from the encoded body size, maintaining the
/// header's invariant.
pub fn encode_req<R: Request>(req: &R, seq: Seq) -> Result<(Header, Vec<u8>), Error> {
    let body = req.encode_body()?;
    if body.len() > u16::MAX as usize {
        return Err(Error::InvalidArg("request body exceeds u16 length".into()));
    }
    let hdr = Header::new(R::OP, R::GROUP, seq.get(), R::COMMAND_ID, body.len() as u16);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&hdr.to_bytes());
    out.extend_from_slice(&body);
    Ok((hdr, out))
}

/// Parses the header from a raw NMP message.
pub fn parse_header(raw: &[u8]) -> Result<Header, Error> {
    Header::parse(raw)
}

/// Decodes the response body of a raw NMP message, given the parsed header.
pub fn decode_rsp_body<R: Request>(hdr: &Header, raw: &[u8]) -> Result<R::Response, Error> {
    if !hdr.op.is_response() {
        return Err(Error::Decoding(
            "attempted to decode a request as a response".into(),
        ));
    }
    if usize::from(hdr.length) > raw.len().saturating_sub(HEADER_LEN) {
        return Err(Error::Decoding("nmp length exceeds body size".into()));
    }
    let body = &raw[HEADER_LEN..HEADER_LEN + usize::from(hdr.length)];
    command::decode_response::<R>(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::echo::{EchoReq, EchoRsp};

    #[test]
    fn nmp_request_response_roundtrip() {
        let req = EchoReq {
            payload: "hi".into(),
        };
        let seq = Seq::new(5);
        let (hdr, raw) = encode_req(&req, seq).unwrap();
        assert_eq!(hdr.seq, 5);
        assert_eq!(usize::from(hdr.length), raw.len() - HEADER_LEN);

        // Simulate the peer's response: same header fields, op flipped to
        // the response variant, body replaced with the echoed payload.
        let rsp_body = serde_cbor::to_vec(&EchoRsp {
            payload: "hi".into(),
            rc: 0,
        })
        .unwrap();
        let mut rsp_hdr = hdr;
        rsp_hdr.op = Op::WriteRsp;
        rsp_hdr.length = rsp_body.len() as u16;
        let mut rsp_raw = rsp_hdr.to_bytes().to_vec();
        rsp_raw.extend_from_slice(&rsp_body);

        let parsed_hdr = parse_header(&rsp_raw).unwrap();
        let decoded: EchoRsp = decode_rsp_body::<EchoReq>(&parsed_hdr, &rsp_raw).unwrap();
        assert_eq!(decoded.payload, "hi");
        assert_eq!(decoded.rc, 0);
    }
}
