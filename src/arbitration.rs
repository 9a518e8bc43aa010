//! Master/slave role arbitration for the BLE daemon: the host-side BLE
//! stack underneath `blehostd` allows only one outstanding master-role
//! operation (connect, discover) and one outstanding slave-role operation
//! (advertise) at a time. Waiters queue FIFO; a "primary" waiter (e.g. a
//! connect started on behalf of a higher-priority caller) jumps the queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::Error;

struct Waiter {
    owner: u64,
    grant: oneshot::Sender<Result<(), Error>>,
}

struct RoleState {
    holder: Option<u64>,
    queue: VecDeque<Waiter>,
}

impl RoleState {
    fn new() -> Self {
        Self {
            holder: None,
            queue: VecDeque::new(),
        }
    }
}

/// A single master or slave role arbiter. `BleTransport` owns two distinct
/// instances of this type: one for the master role, one for the slave role.
pub struct RoleArbiter {
    state: Mutex<RoleState>,
}

/// Returned by [`RoleArbiter::acquire`]; dropping it releases the role.
pub struct RoleGrant<'a> {
    arbiter: &'a RoleArbiter,
    owner: u64,
    released: bool,
}

impl<'a> RoleGrant<'a> {
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Releases the role explicitly. Equivalent to dropping the grant, but
    /// lets callers observe the point of release.
    pub fn release(mut self) {
        self.released = true;
        self.arbiter.release(self.owner);
    }
}

impl Drop for RoleGrant<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.arbiter.release(self.owner);
        }
    }
}

impl RoleArbiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoleState::new()),
        }
    }

    /// Acquires the role for `owner`, waiting FIFO behind any other
    /// waiters. Rejects with [`Error::AlreadyInUse`] if `owner` already
    /// holds or is already queued for this role (recursive acquire).
    pub async fn acquire(&self, owner: u64) -> Result<RoleGrant<'_>, Error> {
        self.acquire_inner(owner, false).await
    }

    /// Acquires the role for `owner`, jumping ahead of all non-primary
    /// waiters already queued (used for a connect issued on behalf of a
    /// caller that must preempt routine traffic).
    pub async fn acquire_primary(&self, owner: u64) -> Result<RoleGrant<'_>, Error> {
        self.acquire_inner(owner, true).await
    }

    async fn acquire_inner(&self, owner: u64, primary: bool) -> Result<RoleGrant<'_>, Error> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.holder == Some(owner) || state.queue.iter().any(|w| w.owner == owner) {
                return Err(Error::AlreadyInUse);
            }
            if state.holder.is_none() && state.queue.is_empty() {
                state.holder = Some(owner);
                return Ok(RoleGrant {
                    arbiter: self,
                    owner,
                    released: false,
                });
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { owner, grant: tx };
            if primary {
                state.queue.push_front(waiter);
            } else {
                state.queue.push_back(waiter);
            }
            rx
        };

        rx.await.map_err(|_| Error::Cancelled)??;
        Ok(RoleGrant {
            arbiter: self,
            owner,
            released: false,
        })
    }

    /// Cancels a specific queued waiter with `err`, e.g. to stop an
    /// advertiser that gave up waiting for the slave role. A no-op if the
    /// waiter has already been granted or was never queued.
    pub fn stop_waiting(&self, owner: u64, err: Error) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.queue.iter().position(|w| w.owner == owner) {
            let waiter = state.queue.remove(idx).unwrap();
            let _ = waiter.grant.send(Err(err));
        }
    }

    fn release(&self, owner: u64) {
        let next = {
            let mut state = self.state.lock().unwrap();
            if state.holder != Some(owner) {
                return;
            }
            state.holder = None;
            state.queue.pop_front()
        };
        if let Some(waiter) = next {
            let mut state = self.state.lock().unwrap();
            state.holder = Some(waiter.owner);
            drop(state);
            let _ = waiter.grant.send(Ok(()));
        }
    }
}

impl Default for RoleArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn uncontended_acquire_is_immediate() {
        let arb = RoleArbiter::new();
        let grant = arb.acquire(1).await.unwrap();
        assert_eq!(grant.owner(), 1);
    }

    #[tokio::test]
    async fn recursive_acquire_is_rejected() {
        let arb = RoleArbiter::new();
        let _grant = arb.acquire(1).await.unwrap();
        let err = arb.acquire(1).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse));
    }

    #[tokio::test]
    async fn waiters_are_granted_fifo() {
        let arb = Arc::new(RoleArbiter::new());
        let grant = arb.acquire(1).await.unwrap();

        let arb2 = arb.clone();
        let second = tokio::spawn(async move { arb2.acquire(2).await.map(|g| g.owner()) });
        let arb3 = arb.clone();
        let third = tokio::spawn(async move { arb3.acquire(3).await.map(|g| g.owner()) });

        tokio::time::sleep(Duration::from_millis(10)).await;
        grant.release();

        assert_eq!(second.await.unwrap().unwrap(), 2);
        // third is still queued behind whichever grant `second` is holding
        // until it releases; release it now to unblock.
        tokio::time::sleep(Duration::from_millis(10)).await;
        // second's grant already dropped when its task returned owner(),
        // consuming the RoleGrant, so third should already be granted.
        assert_eq!(third.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn primary_jumps_the_queue() {
        let arb = Arc::new(RoleArbiter::new());
        let grant = arb.acquire(1).await.unwrap();

        let arb2 = arb.clone();
        let routine = tokio::spawn(async move { arb2.acquire(2).await.map(|g| g.owner()) });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let arb3 = arb.clone();
        let primary = tokio::spawn(async move { arb3.acquire_primary(3).await.map(|g| g.owner()) });
        tokio::time::sleep(Duration::from_millis(5)).await;

        grant.release();
        assert_eq!(primary.await.unwrap().unwrap(), 3);
        // routine was queued first but yields to the primary waiter.
        let _ = routine.await;
    }

    #[tokio::test]
    async fn stop_waiting_cancels_a_queued_waiter() {
        let arb = Arc::new(RoleArbiter::new());
        let _grant = arb.acquire(1).await.unwrap();

        let arb2 = arb.clone();
        let waiter = tokio::spawn(async move { arb2.acquire(2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        arb.stop_waiting(2, Error::Cancelled);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
