//! The listener registry index: a small tagged union so dispatch is a single
//! `O(1)` map lookup instead of three parallel dictionaries.

use crate::seq::Seq;

/// Connection handle issued by the BLE daemon at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u16);

/// A CoAP token, as carried by OMP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub [u8; 8]);

impl Token {
    pub fn from_seq(seq: Seq) -> Self {
        Token(seq.to_token())
    }
}

/// Discriminated index into a [`crate::listener::ListenerRegistry`].
///
/// `SeqKey` and `TokenKey` are exclusive: at most one listener may be bound
/// to a given value at a time. `ConnKey` and `TypeKey` admit multiple
/// listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Correlates one request to one response (BLE daemon ops and NMP).
    SeqKey(u32),
    /// Correlates a CoAP token to a CoAP response (OMP).
    TokenKey(Token),
    /// Routes connection-scoped events to the session owning the handle.
    ConnKey(ConnHandle),
    /// Routes daemon-level broadcasts keyed by message type name.
    TypeKey(&'static str),
}

impl Key {
    /// Whether this key variant requires exclusive listener ownership.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Key::SeqKey(_) | Key::TokenKey(_))
    }
}
