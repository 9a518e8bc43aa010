pub mod framing;
pub mod session;
pub mod transport;

pub use session::SerialSesn;
pub use transport::SerialTransport;
