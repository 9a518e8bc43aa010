//! The NMP/OMP correlation sequence.
//!
//! This is the 8-bit value carried in the NMP header's `sequence` field and,
//! for OMP, zero-padded into the CoAP token. It is distinct from the BLE
//! daemon's own 16-bit protocol sequence (see [`crate::ble::protocol::DaemonSeq`]),
//! which correlates daemon-level requests (connect, scan, ...) and is never
//! embedded in a management message.

use std::fmt;
use std::sync::Mutex;

/// An 8-bit management-protocol correlation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seq(u8);

impl Seq {
    pub const fn new(v: u8) -> Self {
        Seq(v)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The CoAP token equivalent: the sequence zero-padded to 8 bytes, per
    /// the OMP wire format (`token = [0,0,0,0,0,0,0,seq]`).
    pub fn to_token(self) -> [u8; 8] {
        let mut token = [0u8; 8];
        token[7] = self.0;
        token
    }

    /// Recovers a sequence from an 8-byte CoAP token. Only the last byte is
    /// meaningful; leading bytes are expected to be zero but are not
    /// validated here (callers that care should check before calling).
    pub fn from_token(token: &[u8]) -> Option<Self> {
        token.last().map(|&b| Seq(b))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide, mutex-guarded generator of [`Seq`] values.
///
/// Wraps at 256. Two in-flight requests sharing a transceiver never observe
/// the same sequence: callers install their listener before the sequence
/// can be reused, and the generator never reuses a value synchronously with
/// its previous issuance.
#[derive(Debug, Default)]
pub struct SeqGenerator {
    next: Mutex<u8>,
}

impl SeqGenerator {
    pub const fn new() -> Self {
        Self {
            next: Mutex::new(0),
        }
    }

    /// Returns the next sequence, wrapping from 255 back to 0.
    pub fn next(&self) -> Seq {
        let mut guard = self.next.lock().unwrap();
        let seq = *guard;
        *guard = guard.wrapping_add(1);
        Seq(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wraps_at_256() {
        let gen = SeqGenerator::new();
        for i in 0..256 {
            assert_eq!(gen.next().get(), i as u8);
        }
        assert_eq!(gen.next().get(), 0);
    }

    #[test]
    fn token_roundtrip() {
        let seq = Seq::new(42);
        let token = seq.to_token();
        assert_eq!(token, [0, 0, 0, 0, 0, 0, 0, 42]);
        assert_eq!(Seq::from_token(&token), Some(seq));
    }

    #[test]
    fn concurrent_next_calls_are_pairwise_distinct_mod_256() {
        let gen = Arc::new(SeqGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                (0..32).map(|_| gen.next().get()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 256);
        for v in all {
            assert!(seen.insert(v), "sequence {v} issued more than once");
        }
    }
}
