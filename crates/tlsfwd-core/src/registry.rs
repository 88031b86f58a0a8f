//! Pairing registry.
//!
//! The single source of truth for "who forwards to whom": every registered
//! session socket maps to exactly one peer, and the relation is symmetric.
//! Owned by the event loop; no locking.

use crate::error::{FwdError, FwdResult};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Opaque handle identifying one socket known to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Symmetric map from each live session socket to its forwarding peer.
#[derive(Debug, Default)]
pub struct PairingRegistry {
    peers: HashMap<SocketId, SocketId>,
}

impl PairingRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert both `a → b` and `b → a`.
    ///
    /// # Errors
    ///
    /// Fails without modifying the registry if either handle is already
    /// paired or if `a == b`. Correct callers never hit this.
    pub fn register(&mut self, a: SocketId, b: SocketId) -> FwdResult<()> {
        if a == b {
            return Err(FwdError::Other(format!("cannot pair {a} with itself")));
        }
        for id in [a, b] {
            if let Some(existing) = self.peers.get(&id) {
                return Err(FwdError::Other(format!(
                    "{id} is already paired with {existing}"
                )));
            }
        }
        self.peers.insert(a, b);
        self.peers.insert(b, a);
        debug!(a = %a, b = %b, "pair registered");
        Ok(())
    }

    /// The handle paired with `x`, or `None` if `x` is not registered.
    pub fn peer_of(&self, x: SocketId) -> Option<SocketId> {
        self.peers.get(&x).copied()
    }

    /// Remove `x → y` and `y → x`, returning the removed pair.
    ///
    /// A second call for an already-removed handle is a no-op returning
    /// `None`, so close events racing in from both legs are tolerated.
    pub fn unregister(&mut self, x: SocketId) -> Option<(SocketId, SocketId)> {
        let y = self.peers.remove(&x)?;
        self.peers.remove(&y);
        debug!(a = %x, b = %y, "pair unregistered");
        Some((x, y))
    }

    /// Whether `x` is currently paired.
    pub fn contains(&self, x: SocketId) -> bool {
        self.peers.contains_key(&x)
    }

    /// Number of registered handles (twice the number of pairs).
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no pairs are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All registered handles.
    pub fn ids(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.peers.keys().copied()
    }

    /// Whether `peer_of(peer_of(x)) == x` holds for every registered `x`.
    pub fn is_symmetric(&self) -> bool {
        self.peers
            .iter()
            .all(|(x, y)| x != y && self.peers.get(y) == Some(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u64) -> Vec<SocketId> {
        (0..n).map(SocketId).collect()
    }

    #[test]
    fn register_is_symmetric() {
        let mut reg = PairingRegistry::new();
        let s = ids(6);
        reg.register(s[0], s[1]).unwrap();
        reg.register(s[2], s[3]).unwrap();
        reg.register(s[5], s[4]).unwrap();

        assert_eq!(reg.len(), 6);
        for x in reg.ids().collect::<Vec<_>>() {
            let peer = reg.peer_of(x).unwrap();
            assert_eq!(reg.peer_of(peer), Some(x));
        }
        assert!(reg.is_symmetric());
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut reg = PairingRegistry::new();
        let s = ids(3);
        reg.register(s[0], s[1]).unwrap();
        assert!(reg.register(s[1], s[2]).is_err());
        assert!(reg.register(s[2], s[0]).is_err());
        assert!(reg.register(s[2], s[2]).is_err());
        // Failed registrations leave no trace.
        assert!(!reg.contains(s[2]));
        assert_eq!(reg.peer_of(s[1]), Some(s[0]));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unregister_removes_both_directions() {
        let mut reg = PairingRegistry::new();
        let s = ids(4);
        reg.register(s[0], s[1]).unwrap();
        reg.register(s[2], s[3]).unwrap();

        assert_eq!(reg.unregister(s[1]), Some((s[1], s[0])));
        assert!(!reg.contains(s[0]));
        assert!(!reg.contains(s[1]));
        assert_eq!(reg.peer_of(s[2]), Some(s[3]));
        assert!(reg.is_symmetric());
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut reg = PairingRegistry::new();
        let s = ids(2);
        reg.register(s[0], s[1]).unwrap();
        assert!(reg.unregister(s[0]).is_some());
        assert_eq!(reg.unregister(s[0]), None);
        assert_eq!(reg.unregister(s[1]), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_handle_has_no_peer() {
        let reg = PairingRegistry::new();
        assert_eq!(reg.peer_of(SocketId(42)), None);
    }
}
