//! A minimal CoAP (RFC 7252) message codec: just enough to carry OMP's
//! single `PUT /omp` request and its `2.xx` responses.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

pub const URI_PATH_OPTION: u16 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl CoapType {
    fn to_bits(self) -> u8 {
        match self {
            CoapType::Confirmable => 0,
            CoapType::NonConfirmable => 1,
            CoapType::Acknowledgement => 2,
            CoapType::Reset => 3,
        }
    }

    fn from_bits(b: u8) -> Self {
        match b & 0x3 {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Acknowledgement,
            _ => CoapType::Reset,
        }
    }
}

/// A CoAP code, packed as `(class << 5) | detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode(pub u8);

impl CoapCode {
    pub const GET: CoapCode = CoapCode(0x01);
    pub const POST: CoapCode = CoapCode(0x02);
    pub const PUT: CoapCode = CoapCode(0x03);
    pub const DELETE: CoapCode = CoapCode(0x04);

    pub const CREATED: CoapCode = CoapCode(0x41); // 2.01
    pub const DELETED: CoapCode = CoapCode(0x42); // 2.02
    pub const VALID: CoapCode = CoapCode(0x43); // 2.03
    pub const CHANGED: CoapCode = CoapCode(0x44); // 2.04
    pub const CONTENT: CoapCode = CoapCode(0x45); // 2.05

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The four request method codes that a `CoapServer` session must
    /// process and that the OMP response decoder must ignore.
    pub fn is_request(self) -> bool {
        matches!(self, Self::GET | Self::POST | Self::PUT | Self::DELETE)
    }

    /// Whether this is one of the success responses OMP accepts
    /// (`Created`, `Deleted`, `Valid`, `Changed`, `Content`).
    pub fn is_omp_success_response(self) -> bool {
        matches!(
            self,
            Self::CREATED | Self::DELETED | Self::VALID | Self::CHANGED | Self::CONTENT
        )
    }
}

impl std::fmt::Display for CoapCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.0 & 0x1f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn uri_path(segment: impl Into<Vec<u8>>) -> Self {
        CoapOption {
            number: URI_PATH_OPTION,
            value: segment.into(),
        }
    }
}

/// A parsed CoAP message (datagram form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub mtype: CoapType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(mtype: CoapType, code: CoapCode, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn set_path(&mut self, path: &str) {
        self.options
            .retain(|o| o.number != URI_PATH_OPTION);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options.push(CoapOption::uri_path(segment.as_bytes()));
        }
    }

    pub fn path(&self) -> String {
        let mut segments: Vec<&str> = Vec::new();
        for opt in &self.options {
            if opt.number == URI_PATH_OPTION {
                if let Ok(s) = std::str::from_utf8(&opt.value) {
                    segments.push(s);
                }
            }
        }
        segments.join("/")
    }

    /// Encodes this message using RFC 7252 datagram (UDP-style) framing.
    pub fn encode_dgram(&self) -> Result<Vec<u8>, Error> {
        if self.token.len() > 8 {
            return Err(Error::Encoding("coap token longer than 8 bytes".into()));
        }
        let mut out = Vec::new();
        let first = (1u8 << 6) | (self.mtype.to_bits() << 4) | (self.token.len() as u8);
        out.push(first);
        out.push(self.code.0);
        let mut mid = [0u8; 2];
        BigEndian::write_u16(&mut mid, self.message_id);
        out.extend_from_slice(&mid);
        out.extend_from_slice(&self.token);

        // Options must be encoded in ascending option-number order.
        let mut options = self.options.clone();
        options.sort_by_key(|o| o.number);
        let mut prev = 0u16;
        for opt in &options {
            encode_option(&mut out, prev, opt)?;
            prev = opt.number;
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    /// Decodes a message using RFC 7252 datagram (UDP-style) framing.
    pub fn decode_dgram(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::Decoding("coap datagram shorter than 4 bytes".into()));
        }
        let ver = buf[0] >> 6;
        if ver != 1 {
            return Err(Error::Decoding(format!("unsupported coap version {ver}")));
        }
        let mtype = CoapType::from_bits(buf[0] >> 4);
        let tkl = usize::from(buf[0] & 0x0f);
        if tkl > 8 {
            return Err(Error::Decoding("coap token length field > 8".into()));
        }
        let code = CoapCode(buf[1]);
        let message_id = BigEndian::read_u16(&buf[2..4]);

        let mut pos = 4;
        if buf.len() < pos + tkl {
            return Err(Error::Decoding("coap token truncated".into()));
        }
        let token = buf[pos..pos + tkl].to_vec();
        pos += tkl;

        let mut options = Vec::new();
        let mut prev = 0u16;
        while pos < buf.len() && buf[pos] != 0xFF {
            let (opt, new_pos) = decode_option(buf, pos, prev)?;
            prev = opt.number;
            options.push(opt);
            pos = new_pos;
        }

        let payload = if pos < buf.len() && buf[pos] == 0xFF {
            buf[pos + 1..].to_vec()
        } else {
            Vec::new()
        };

        Ok(CoapMessage {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn encode_option_nibble(out: &mut Vec<u8>, high: bool, value: u16) -> Result<u8, Error> {
    // Returns the 4-bit nibble value and pushes any extended bytes needed.
    if value < 13 {
        Ok(value as u8)
    } else if value < 269 {
        out.push((value - 13) as u8);
        Ok(13)
    } else if value - 269 <= u16::MAX as u16 {
        let ext = value - 269;
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, ext);
        out.extend_from_slice(&buf);
        Ok(14)
    } else {
        let _ = high;
        Err(Error::Encoding("coap option value too large".into()))
    }
}

fn encode_option(out: &mut Vec<u8>, prev_number: u16, opt: &CoapOption) -> Result<(), Error> {
    if opt.number < prev_number {
        return Err(Error::Encoding("coap options out of order".into()));
    }
    let delta = opt.number - prev_number;
    let len = opt.value.len();
    if len > u16::MAX as usize {
        return Err(Error::Encoding("coap option value too large".into()));
    }

    // First pass: compute the extended-byte payloads without committing
    // the header byte (its nibble depends on whether the ext bytes exist).
    let mut delta_ext = Vec::new();
    let delta_nibble = encode_option_nibble(&mut delta_ext, true, delta)?;
    let mut len_ext = Vec::new();
    let len_nibble = encode_option_nibble(&mut len_ext, false, len as u16)?;

    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(&opt.value);
    Ok(())
}

fn decode_ext(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<u16, Error> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            if *pos >= buf.len() {
                return Err(Error::Decoding("coap option ext8 truncated".into()));
            }
            let v = u16::from(buf[*pos]) + 13;
            *pos += 1;
            Ok(v)
        }
        14 => {
            if *pos + 2 > buf.len() {
                return Err(Error::Decoding("coap option ext16 truncated".into()));
            }
            let v = BigEndian::read_u16(&buf[*pos..*pos + 2]) + 269;
            *pos += 2;
            Ok(v)
        }
        _ => Err(Error::Decoding("coap option reserved nibble 15".into())),
    }
}

fn decode_option(buf: &[u8], mut pos: usize, prev_number: u16) -> Result<(CoapOption, usize), Error> {
    let header = buf[pos];
    pos += 1;
    let delta_nibble = header >> 4;
    let len_nibble = header & 0x0f;
    let delta = decode_ext(buf, &mut pos, delta_nibble)?;
    let len = decode_ext(buf, &mut pos, len_nibble)? as usize;
    if pos + len > buf.len() {
        return Err(Error::Decoding("coap option value truncated".into()));
    }
    let value = buf[pos..pos + len].to_vec();
    pos += len;
    Ok((
        CoapOption {
            number: prev_number + delta,
            value,
        },
        pos,
    ))
}
