//! Listener registry: a key → list-of-queues map used to fan inbound frames
//! out to the callers awaiting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::key::Key;

/// The default bound for a listener's inbound queue.
pub const DEFAULT_QUEUE_BOUND: usize = 16;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// An owned queue of inbound frames plus an error channel.
///
/// Created by [`ListenerRegistry::add`]; the caller drives `recv`/`recv_err`
/// (or [`Listener::recv_either`]) and must eventually call
/// [`ListenerRegistry::remove`] on every return path.
#[derive(Debug)]
pub struct Listener {
    id: u64,
    key: Key,
    frames: mpsc::Receiver<Vec<u8>>,
    errs: mpsc::Receiver<Error>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> Key {
        self.key
    }

    /// Waits for the next delivered frame, or returns `Err` once an error
    /// has been posted for this listener (transport loss, session close).
    pub async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        tokio::select! {
            biased;
            Some(err) = self.errs.recv() => Err(err),
            frame = self.frames.recv() => frame.ok_or(Error::Cancelled),
        }
    }
}

struct Entry {
    id: u64,
    frame_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<Error>,
}

/// A key → list-of-queues map used to demultiplex one inbound byte stream
/// to many waiters.
///
/// Internally guarded by a plain [`std::sync::Mutex`] held only across
/// pointer manipulation, never across an `.await` point, per the
/// concurrency model.
pub struct ListenerRegistry {
    inner: Mutex<HashMap<Key, Vec<Entry>>>,
    queue_bound: usize,
    dropped: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_BOUND)
    }
}

impl ListenerRegistry {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            queue_bound,
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new listener under `key`.
    ///
    /// Fails with [`Error::AlreadyInUse`] if `key` is exclusive
    /// (`SeqKey`/`TokenKey`) and already bound.
    pub fn add(&self, key: Key) -> Result<Listener, Error> {
        let mut map = self.inner.lock().unwrap();
        let bucket = map.entry(key).or_default();
        if key.is_exclusive() && !bucket.is_empty() {
            return Err(Error::AlreadyInUse);
        }

        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let (frame_tx, frame_rx) = mpsc::channel(self.queue_bound);
        let (err_tx, err_rx) = mpsc::channel(1);
        bucket.push(Entry {
            id,
            frame_tx,
            err_tx,
        });
        trace!(?key, id, "listener registered");

        Ok(Listener {
            id,
            key,
            frames: frame_rx,
            errs: err_rx,
        })
    }

    /// Removes `listener`. Idempotent: removing an already-removed listener
    /// (or one whose key bucket has already been cleared) is a no-op.
    pub fn remove(&self, listener: &Listener) {
        self.remove_by_id(listener.key, listener.id);
    }

    /// Removes the listener `id` bound to `key`, for callers that only
    /// retained the id/key pair rather than the [`Listener`] itself (e.g. a
    /// standing CoAP listener a session tracks by its registration key).
    /// Idempotent, like [`Self::remove`].
    pub fn remove_by_id(&self, key: Key, id: u64) {
        let mut map = self.inner.lock().unwrap();
        if let Some(bucket) = map.get_mut(&key) {
            bucket.retain(|e| e.id != id);
            if bucket.is_empty() {
                map.remove(&key);
            }
        }
        trace!(id, "listener removed");
    }

    /// Delivers `frame` to every listener bound to `key`. Returns whether at
    /// least one listener received it.
    ///
    /// A listener whose queue is full has the frame dropped and counted
    /// rather than stalling the inbound pump.
    pub fn dispatch(&self, key: Key, frame: Vec<u8>) -> bool {
        let entries: Vec<mpsc::Sender<Vec<u8>>> = {
            let map = self.inner.lock().unwrap();
            match map.get(&key) {
                Some(bucket) => bucket.iter().map(|e| e.frame_tx.clone()).collect(),
                None => Vec::new(),
            }
        };

        if entries.is_empty() {
            debug!(?key, "dispatch: no listener bound, frame dropped");
            return false;
        }

        let mut delivered = false;
        for tx in entries {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(?key, "listener queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Listener is being torn down concurrently; ignore.
                }
            }
        }
        delivered
    }

    /// Delivers `err` to every listener bound to `key`, leaving every other
    /// key's listeners untouched. Used to cancel a single outstanding
    /// request (e.g. `abort_rx`) without tearing down the whole registry.
    /// Returns whether at least one listener was bound to `key`.
    pub fn dispatch_err(&self, key: Key, err: Error) -> bool {
        let entries: Vec<mpsc::Sender<Error>> = {
            let map = self.inner.lock().unwrap();
            match map.get(&key) {
                Some(bucket) => bucket.iter().map(|e| e.err_tx.clone()).collect(),
                None => Vec::new(),
            }
        };
        if entries.is_empty() {
            return false;
        }
        let mut delivered = false;
        for tx in entries {
            if tx.try_send(clone_error(&err)).is_ok() {
                delivered = true;
            }
        }
        delivered
    }

    /// Delivers `err` to every currently-registered listener and clears the
    /// registry. Used on transport loss and session close.
    pub fn error_all(&self, err: Error) {
        let all: Vec<mpsc::Sender<Error>> = {
            let mut map = self.inner.lock().unwrap();
            let all = map
                .values()
                .flatten()
                .map(|e| e.err_tx.clone())
                .collect();
            map.clear();
            all
        };
        for tx in all {
            let _ = tx.try_send(clone_error(&err));
        }
    }

    /// Number of frames dropped because their listener's queue was full.
    ///
    /// Exposed for observability; the registry makes no attempt to
    /// correlate a drop back to a prior request.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn clone_error(err: &Error) -> Error {
    // `Error` isn't `Clone` (it wraps `std::io::Error`), so `error_all`
    // re-derives an equivalent, display-preserving error for each listener.
    match err {
        Error::Xport => Error::Xport,
        Error::SesnClosed => Error::SesnClosed,
        Error::SesnAlreadyOpen => Error::SesnAlreadyOpen,
        Error::Cancelled => Error::Cancelled,
        Error::RspTimeout => Error::RspTimeout,
        Error::NmpTimeout => Error::NmpTimeout,
        other => Error::Decoding(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[test]
    fn exclusivity_enforced_for_seq_key() {
        let reg = ListenerRegistry::default();
        let a = reg.add(Key::SeqKey(1)).unwrap();
        let err = reg.add(Key::SeqKey(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse));
        reg.remove(&a);
        reg.add(Key::SeqKey(1)).unwrap();
    }

    #[test]
    fn conn_key_admits_multiple_listeners() {
        let reg = ListenerRegistry::default();
        let h = crate::key::ConnHandle(1);
        let _a = reg.add(Key::ConnKey(h)).unwrap();
        let _b = reg.add(Key::ConnKey(h)).unwrap();
    }

    #[tokio::test]
    async fn dispatch_delivers_to_live_listener_and_drops_to_unbound_key() {
        let reg = ListenerRegistry::default();
        let mut l = reg.add(Key::SeqKey(7)).unwrap();

        assert!(reg.dispatch(Key::SeqKey(7), b"hi".to_vec()));
        assert_eq!(l.recv().await.unwrap(), b"hi".to_vec());

        assert!(!reg.dispatch(Key::SeqKey(99), b"lost".to_vec()));
        assert_eq!(reg.dropped_count(), 0);

        reg.remove(&l);
    }

    #[tokio::test]
    async fn error_all_unblocks_waiters() {
        let reg = ListenerRegistry::default();
        let mut l = reg.add(Key::SeqKey(1)).unwrap();
        reg.error_all(Error::Xport);
        assert!(matches!(l.recv().await, Err(Error::Xport)));
    }

    #[tokio::test]
    async fn dispatch_err_cancels_only_its_own_key() {
        let reg = ListenerRegistry::default();
        let mut target = reg.add(Key::SeqKey(1)).unwrap();
        let mut other = reg.add(Key::SeqKey(2)).unwrap();

        assert!(reg.dispatch_err(Key::SeqKey(1), Error::Cancelled));
        assert!(matches!(target.recv().await, Err(Error::Cancelled)));

        assert!(reg.dispatch(Key::SeqKey(2), b"still alive".to_vec()));
        assert_eq!(other.recv().await.unwrap(), b"still alive".to_vec());
    }

    #[test]
    fn remove_by_id_matches_remove() {
        let reg = ListenerRegistry::default();
        let a = reg.add(Key::SeqKey(5)).unwrap();
        reg.remove_by_id(Key::SeqKey(5), a.id());
        reg.add(Key::SeqKey(5)).unwrap();
    }
}
