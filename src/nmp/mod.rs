pub mod header;
pub mod codec;

pub use header::{Header, Op, HEADER_LEN};
pub use codec::{decode_rsp_body, encode_req};
