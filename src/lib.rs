//! Host-side management session client for devices speaking NMP (plain)
//! or OMP (CoAP-wrapped) over a BLE GATT link or a serial/UART link.
//!
//! A [`session::Session`] is the unit applications drive: open it, issue
//! management requests through [`command::Request`] implementations, and
//! close it. [`ble::BleSesn`] and [`serial::SerialSesn`] are the two
//! concrete transports; both share the same request/response engine in
//! [`transceiver`].

pub mod arbitration;
pub mod ble;
pub mod command;
pub mod config;
pub mod error;
pub mod key;
pub mod listener;
pub mod logging;
pub mod nmp;
pub mod omp;
pub mod seq;
pub mod serial;
pub mod session;
pub mod transceiver;

pub use error::{Error, Result};
pub use session::{MgmtProto, Session, TxOptions};
