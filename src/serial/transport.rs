//! The serial transport: a single physical port shared by whichever
//! session currently holds it, plus the request/accept routing a
//! `CoapServer` session needs to receive inbound CoAP requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::config::SerialXportCfg;
use crate::error::Error;
use crate::serial::framing::{frame, Reassembler};

static NEXT_SESN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates an opaque id a serial session uses to claim the port's
/// request/accept roles.
pub fn next_sesn_id() -> u64 {
    NEXT_SESN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Routes a decoded frame to the session that owns the port's request role,
/// falling back to whichever session registered itself as the port's CoAP
/// request acceptor. Only the owning session knows whether its own wire
/// framing (`MgmtProto`) makes a given frame a correlated response or an
/// unsolicited request, so the transport hands every frame over raw rather
/// than attempting to peek a header itself. `request_sesn`/`accept_sesn`
/// are each held by at most one session at a time: the port is a single
/// physical resource, and only one `CoapServer` session may accept on it.
struct Routing {
    request_sesn: Option<(u64, Arc<dyn AcceptSesn>)>,
    accept_sesn: Option<(u64, Arc<dyn AcceptSesn>)>,
}

/// The narrow callback surface a serial session exposes to the transport
/// for inbound-frame delivery, avoiding a dependency cycle on the full
/// `Session` trait.
pub trait AcceptSesn: Send + Sync {
    /// Delivers one reassembled inbound frame.
    fn rx_accept(&self, raw: Vec<u8>);

    /// Reports a transport-level failure (the port closed or errored) so
    /// the session can cancel whatever it still has outstanding.
    fn rx_error(&self, err: Error);
}

pub struct SerialTransport {
    cfg: SerialXportCfg,
    port_lock: Mutex<()>,
    write_tx: mpsc::Sender<Vec<u8>>,
    routing: RwLock<Routing>,
}

impl SerialTransport {
    /// Opens the serial port and starts its reader/writer pump tasks.
    pub async fn open(cfg: SerialXportCfg) -> Result<Arc<Self>, Error> {
        let port = tokio_serial::new(cfg.dev_path.to_string_lossy(), cfg.baud_rate)
            .open_native_async()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let (mut read_half, mut write_half) = tokio::io::split(port);

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(16);
        let this = Arc::new(Self {
            cfg,
            port_lock: Mutex::new(()),
            write_tx,
            routing: RwLock::new(Routing {
                request_sesn: None,
                accept_sesn: None,
            }),
        });

        tokio::spawn(async move {
            while let Some(buf) = write_rx.recv().await {
                if let Err(e) = write_half.write_all(&buf).await {
                    warn!(error = %e, "serial port write error");
                    break;
                }
            }
        });

        let reader_this = this.clone();
        tokio::spawn(async move {
            let mut reasm = Reassembler::new();
            let mut buf = vec![0u8; 1024];
            let mut pending_line = Vec::new();
            loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("serial port closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "serial port read error");
                        break;
                    }
                };
                for &b in &buf[..n] {
                    if b == b'\n' {
                        if let Ok(line) = std::str::from_utf8(&pending_line) {
                            match reasm.feed(line) {
                                Ok(Some(payload)) => reader_this.route_payload(payload).await,
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "dropping malformed serial frame"),
                            }
                        }
                        pending_line.clear();
                    } else {
                        pending_line.push(b);
                    }
                }
            }
            let routing = reader_this.routing.read().await;
            if let Some((_, sesn)) = &routing.request_sesn {
                sesn.rx_error(Error::Xport);
            }
            if let Some((_, sesn)) = &routing.accept_sesn {
                sesn.rx_error(Error::Xport);
            }
        });

        Ok(this)
    }

    pub fn mtu(&self) -> u16 {
        self.cfg.mtu
    }

    /// Claims the port's single request-session role for `owner`.
    /// Idempotent if `owner` already holds it; errors if a different
    /// session does.
    pub async fn set_request_sesn(&self, owner: u64, sesn: Arc<dyn AcceptSesn>) -> Result<(), Error> {
        let mut routing = self.routing.write().await;
        if matches!(&routing.request_sesn, Some((existing, _)) if *existing != owner) {
            return Err(Error::SesnAlreadyOpen);
        }
        routing.request_sesn = Some((owner, sesn));
        Ok(())
    }

    /// Releases the request-session role if still held by `owner`.
    pub async fn clear_request_sesn(&self, owner: u64) {
        let mut routing = self.routing.write().await;
        if matches!(&routing.request_sesn, Some((existing, _)) if *existing == owner) {
            routing.request_sesn = None;
        }
    }

    /// Registers the session that should receive inbound CoAP requests not
    /// correlated to any pending response (a `CoapServer` session).
    /// Idempotent if `owner` already holds the role; errors if a different
    /// session does.
    pub async fn set_accept_sesn(&self, owner: u64, sesn: Arc<dyn AcceptSesn>) -> Result<(), Error> {
        let mut routing = self.routing.write().await;
        if matches!(&routing.accept_sesn, Some((existing, _)) if *existing != owner) {
            return Err(Error::SesnAlreadyOpen);
        }
        routing.accept_sesn = Some((owner, sesn));
        Ok(())
    }

    /// Releases the accept-session role if still held by `owner`.
    pub async fn clear_accept_sesn(&self, owner: u64) {
        let mut routing = self.routing.write().await;
        if matches!(&routing.accept_sesn, Some((existing, _)) if *existing == owner) {
            routing.accept_sesn = None;
        }
    }

    /// Sends one already-encoded management message, framing it for the
    /// wire. Only one in-flight send at a time: the port is a single
    /// physical resource.
    pub async fn send(&self, raw: &[u8]) -> Result<(), Error> {
        let _guard = self.port_lock.lock().await;
        for line in frame(raw, self.cfg.mtu as usize)? {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            self.write_tx.send(bytes).await.map_err(|_| Error::Xport)?;
        }
        Ok(())
    }

    async fn route_payload(&self, payload: Vec<u8>) {
        let routing = self.routing.read().await;
        if let Some((_, sesn)) = &routing.request_sesn {
            sesn.rx_accept(payload);
            return;
        }
        if let Some((_, sesn)) = &routing.accept_sesn {
            sesn.rx_accept(payload);
        }
    }

    /// Test-only hook that feeds `payload` through the exact same routing
    /// path a real inbound wire frame takes, without a physical port.
    #[cfg(test)]
    pub(crate) async fn inject_test_payload(&self, payload: Vec<u8>) {
        self.route_payload(payload).await;
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(16);
        tokio::spawn(async move { while write_rx.recv().await.is_some() {} });
        Arc::new(Self {
            cfg: SerialXportCfg::default(),
            port_lock: Mutex::new(()),
            write_tx,
            routing: RwLock::new(Routing {
                request_sesn: None,
                accept_sesn: None,
            }),
        })
    }
}
