//! The request/response engine shared by every [`crate::session::Session`]
//! implementation: install a listener, hand the encoded request to the
//! transport's raw transmit function, wait for the correlated response (or
//! a transport-reported error), retrying up to `Tries` times.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;
use crate::key::Key;
use crate::listener::{Listener, ListenerRegistry};
use crate::session::TxOptions;

/// Splits `raw` into MTU-sized chunks for transports (BLE GATT writes,
/// serial line frames) that cannot carry a full management message in one
/// unit. A single chunk is returned unchanged when it already fits.
pub fn fragment(raw: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if mtu == 0 || raw.len() <= mtu {
        return vec![raw.to_vec()];
    }
    raw.chunks(mtu).map(|c| c.to_vec()).collect()
}

pub struct Transceiver {
    registry: Arc<ListenerRegistry>,
}

impl Transceiver {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            registry: Arc::new(ListenerRegistry::new(queue_bound)),
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Sends `raw` via `transmit` and awaits the response correlated by
    /// `key`, retrying the whole send+wait cycle up to `opts.tries` times
    /// on a per-attempt timeout. A transport error from `transmit` itself
    /// is never retried.
    pub async fn tx_rx_mgmt<F, Fut>(
        &self,
        raw: Vec<u8>,
        key: Key,
        opts: TxOptions,
        mut transmit: F,
    ) -> Result<Vec<u8>, Error>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let tries = opts.tries.max(1);
        for attempt in 1..=tries {
            let mut listener = self.registry.add(key)?;
            if let Err(e) = transmit(raw.clone()).await {
                self.registry.remove(&listener);
                return Err(e);
            }

            let outcome = tokio::time::timeout(opts.timeout, listener.recv()).await;
            self.registry.remove(&listener);

            match outcome {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    debug!(attempt, tries, "management request timed out, retrying");
                    if attempt == tries {
                        warn!("management retry budget exhausted");
                        return Err(Error::NmpTimeout);
                    }
                }
            }
        }
        Err(Error::RspTimeout)
    }

    /// Installs a listener for `key`, fires `transmit` once, and returns
    /// the listener directly rather than awaiting it: the caller drives
    /// its own retry/cancellation policy (dropping the listener cancels).
    pub async fn tx_rx_mgmt_async<F, Fut>(
        &self,
        raw: Vec<u8>,
        key: Key,
        mut transmit: F,
    ) -> Result<Listener, Error>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let listener = self.registry.add(key)?;
        if let Err(e) = transmit(raw).await {
            self.registry.remove(&listener);
            return Err(e);
        }
        Ok(listener)
    }

    /// Delivers an inbound CoAP request to whichever session registered a
    /// `Key::TypeKey` listener for its message type, used by `CoapServer`
    /// sessions' `rx_coap` handler. Returns whether any listener accepted
    /// the frame.
    pub fn process_coap_req(&self, type_key: &'static str, raw: Vec<u8>) -> bool {
        self.registry.dispatch(Key::TypeKey(type_key), raw)
    }

    /// Delivers an inbound response/event frame to whichever listener
    /// owns `key` (a session's normal receive path).
    pub fn dispatch(&self, key: Key, raw: Vec<u8>) -> bool {
        self.registry.dispatch(key, raw)
    }

    /// Cancels the single outstanding listener at `key` with `err`,
    /// without disturbing any other pending request. Used by `abort_rx`.
    pub fn dispatch_err(&self, key: Key, err: Error) -> bool {
        self.registry.dispatch_err(key, err)
    }

    /// Cancels every outstanding listener with `err`, used when the
    /// underlying transport link drops.
    pub fn error_all(&self, err: Error) {
        self.registry.error_all(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn successful_roundtrip_returns_first_response() {
        let tc = Transceiver::new(4);
        let registry = tc.registry().clone();
        let key = Key::SeqKey(1);

        let transmit_calls = Arc::new(AtomicU32::new(0));
        let calls = transmit_calls.clone();
        let fut = tc.tx_rx_mgmt(vec![1, 2, 3], key, TxOptions::new(Duration::from_millis(200), 3), move |_raw| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let responder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.dispatch(key, vec![9, 9]);
        });

        let result = fut.await.unwrap();
        assert_eq!(result, vec![9, 9]);
        assert_eq!(transmit_calls.load(Ordering::SeqCst), 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn exhausting_retries_reports_nmp_timeout() {
        let tc = Transceiver::new(4);
        let key = Key::SeqKey(2);
        let result = tc
            .tx_rx_mgmt(vec![0], key, TxOptions::new(Duration::from_millis(5), 2), |_raw| async {
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::NmpTimeout)));
    }

    #[tokio::test]
    async fn transmit_error_is_not_retried() {
        let tc = Transceiver::new(4);
        let key = Key::SeqKey(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = tc
            .tx_rx_mgmt(vec![0], key, TxOptions::new(Duration::from_millis(50), 5), move |_raw| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Xport) }
            })
            .await;
        assert!(matches!(result, Err(Error::Xport)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fragment_splits_on_mtu_boundaries() {
        let raw = vec![0u8; 10];
        let chunks = fragment(&raw, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(chunks[2].len(), 2);

        let single = fragment(&raw, 64);
        assert_eq!(single.len(), 1);
    }
}
