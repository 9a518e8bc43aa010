//! Newtmgr line framing: base64-encoded chunks delimited by a two-byte
//! start/continuation magic, a big-endian length prefix, and a trailing
//! CRC-16-CCITT over the unencoded payload.

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_IBM_3740};

use crate::error::Error;

const START_MAGIC: [u8; 2] = [0x06, 0x09];
const CONT_MAGIC: [u8; 2] = [0x04, 0x14];
const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// The maximum base64-decoded payload (length prefix + body + crc) carried
/// by a single framed line, before it must be split across continuation
/// lines.
pub fn max_unencoded_chunk(line_mtu: usize) -> usize {
    // base64 expands 3 bytes to 4; reserve the 2-byte magic up front.
    ((line_mtu.saturating_sub(2)) / 4) * 3
}

/// Frames `payload` (a full NMP/OMP message) into one or more base64 lines
/// ready to be written with a trailing `\n`.
pub fn frame(payload: &[u8], line_mtu: usize) -> Result<Vec<String>, Error> {
    if line_mtu < 8 {
        return Err(Error::InvalidArg("serial line mtu too small to frame".into()));
    }

    let mut with_len = Vec::with_capacity(2 + payload.len() + 2);
    let mut len_buf = [0u8; 2];
    if payload.len() > u16::MAX as usize {
        return Err(Error::InvalidArg("serial payload exceeds u16 length".into()));
    }
    BigEndian::write_u16(&mut len_buf, payload.len() as u16);
    with_len.extend_from_slice(&len_buf);
    with_len.extend_from_slice(payload);
    let crc_val = CRC.checksum(payload);
    let mut crc_buf = [0u8; 2];
    BigEndian::write_u16(&mut crc_buf, crc_val);
    with_len.extend_from_slice(&crc_buf);

    let chunk_size = max_unencoded_chunk(line_mtu).max(3);
    let mut lines = Vec::new();
    for (i, chunk) in with_len.chunks(chunk_size).enumerate() {
        let magic = if i == 0 { START_MAGIC } else { CONT_MAGIC };
        let mut line_bytes = Vec::with_capacity(magic.len() + chunk.len());
        line_bytes.extend_from_slice(&magic);
        line_bytes.extend_from_slice(chunk);
        lines.push(base64::engine::general_purpose::STANDARD.encode(&line_bytes));
    }
    Ok(lines)
}

/// Accumulates framed lines back into a complete payload, verifying the
/// CRC once the declared length has been reassembled.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    expected_len: Option<u16>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded line; returns the completed payload once the
    /// length-prefixed message and its CRC have fully arrived.
    pub fn feed(&mut self, line: &str) -> Result<Option<Vec<u8>>, Error> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(line.trim())
            .map_err(|e| Error::Decoding(format!("serial line is not valid base64: {e}")))?;
        if raw.len() < 2 {
            return Err(Error::Decoding("serial line shorter than its magic".into()));
        }
        let magic = [raw[0], raw[1]];
        let body = &raw[2..];

        if magic == START_MAGIC {
            self.buf.clear();
            self.expected_len = None;
            if body.len() < 2 {
                return Err(Error::Decoding("serial start frame missing length prefix".into()));
            }
            self.expected_len = Some(BigEndian::read_u16(&body[0..2]));
            self.buf.extend_from_slice(&body[2..]);
        } else if magic == CONT_MAGIC {
            if self.expected_len.is_none() {
                return Err(Error::Decoding("serial continuation frame with no start".into()));
            }
            self.buf.extend_from_slice(body);
        } else {
            return Err(Error::Decoding("serial frame has unrecognized magic".into()));
        }

        let Some(expected) = self.expected_len else {
            return Ok(None);
        };
        // buffered payload + trailing 2-byte crc must both have arrived.
        if self.buf.len() < usize::from(expected) + 2 {
            return Ok(None);
        }

        let payload = self.buf[..usize::from(expected)].to_vec();
        let crc_bytes = &self.buf[usize::from(expected)..usize::from(expected) + 2];
        let got_crc = BigEndian::read_u16(crc_bytes);
        let want_crc = CRC.checksum(&payload);
        self.expected_len = None;
        self.buf.clear();
        if got_crc != want_crc {
            return Err(Error::Decoding("serial frame crc mismatch".into()));
        }
        Ok(Some(payload))
    }
}
