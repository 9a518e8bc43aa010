//! Error taxonomy shared by every transport, session, and codec in this crate.

use thiserror::Error;

/// A category attached to [`Error::BleHost`], decoded from the daemon's
/// base-offset status range (ATT/SM/HCI share one status number space).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostErrorCategory {
    Att,
    Sm,
    Hci,
    Unknown,
}

impl HostErrorCategory {
    /// Classifies a raw daemon `status` value into its category and the
    /// category-relative code, per the base-offset ranges used by blehostd.
    pub fn classify(status: u32) -> (Self, u32) {
        const SM_BASE: u32 = 0x200;
        const HCI_BASE: u32 = 0x300;
        if status >= HCI_BASE {
            (Self::Hci, status - HCI_BASE)
        } else if status >= SM_BASE {
            (Self::Sm, status - SM_BASE)
        } else if status > 0 {
            (Self::Att, status)
        } else {
            (Self::Unknown, status)
        }
    }
}

/// Errors returned by this crate.
///
/// Each operation returns the most specific kind that applies; wrapper
/// layers add context via [`Error::Context`] but never reclassify a more
/// specific error into a less specific one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport is not currently running. Recoverable by waiting for
    /// the transport to restart.
    #[error("transport is not running")]
    Xport,

    /// The BLE daemon reported a non-zero status for a request.
    #[error("ble host error: status {status} ({category:?})")]
    BleHost {
        status: u32,
        category: HostErrorCategory,
    },

    /// A session was opened while already open.
    #[error("session already open")]
    SesnAlreadyOpen,

    /// An operation was attempted on a session that is not open.
    #[error("session closed")]
    SesnClosed,

    /// No response arrived before the per-attempt timeout elapsed.
    #[error("response timed out")]
    RspTimeout,

    /// The management layer exhausted its retry budget (`Tries` attempts).
    #[error("management retry budget exhausted")]
    NmpTimeout,

    /// Pairing/security material was missing or mismatched.
    #[error("security error: {0}")]
    Security(String),

    /// A cooperative abort: session close, advertise stop, or scan cancel.
    #[error("operation cancelled")]
    Cancelled,

    /// Caller supplied a malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Failed to encode an outbound message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode an inbound message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A listener key that must be exclusive (`SeqKey`/`TokenKey`) was
    /// already bound.
    #[error("key already in use")]
    AlreadyInUse,

    /// Underlying I/O failure (socket, subprocess, serial port).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}

impl From<serde_cbor::Error> for Error {
    fn from(e: serde_cbor::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
