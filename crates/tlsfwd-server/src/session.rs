//! Session lifecycle management.
//!
//! Owns creation and destruction of pairings:
//!
//! - **Accept path**: [`establish`] dials the destination and runs the upgrade
//!   hook on the configured leg, producing a [`PendingPair`]; the event loop
//!   then hands it to [`RelayContext::open_session`], which registers both
//!   legs and starts watching them.
//! - **Close path**: [`RelayContext::close_session`] unregisters the pair,
//!   stops watching both legs, and closes each of them exactly once.
//!
//! The [`RelayContext`] is the only place the pairing registry and watch set
//! are mutated, and it is only ever touched from the event loop task.

use crate::dialer::Dialer;
use crate::stats::RelayStats;
use crate::watch::{Chunk, CloseReason, Leg, LegEvent, WatchSet};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use tlsfwd_core::{BoxedIo, FwdResult, PairingRegistry, SocketId, UpgradeHook, UpgradeMode};

/// Both legs of a pairing, connected and upgraded but not yet registered.
pub struct PendingPair {
    /// Inbound leg (accepted from the client).
    pub client: BoxedIo,
    /// Address of the connecting client.
    pub client_addr: SocketAddr,
    /// Outbound leg (dialed to the destination).
    pub server: BoxedIo,
    /// Address of the destination as connected.
    pub server_addr: SocketAddr,
}

/// Accept path up to registration: dial, then upgrade the configured leg.
///
/// On failure every leg opened so far is dropped (and thereby closed), the
/// failure is logged with the client's address, and the matching counter in
/// `stats` is bumped. Nothing is registered in that case.
///
/// # Arguments
///
/// * `client` - The freshly accepted inbound leg.
/// * `client_addr` - Remote address of the inbound leg.
/// * `dialer` - Opens the outbound leg.
/// * `hook` - Upgrade hook applied to exactly one leg.
/// * `mode` - Which leg `hook` is applied to.
/// * `stats` - Counters for dial and upgrade failures.
pub async fn establish(
    client: BoxedIo,
    client_addr: SocketAddr,
    dialer: &Dialer,
    hook: &dyn UpgradeHook,
    mode: UpgradeMode,
    stats: &RelayStats,
) -> FwdResult<PendingPair> {
    let (server, server_addr) = match dialer.connect().await {
        Ok(dialed) => dialed,
        Err(e) => {
            stats.dial_failed();
            warn!(
                client = %client_addr,
                error = %e,
                "cannot reach destination, closing client connection"
            );
            return Err(e);
        }
    };
    let server: BoxedIo = Box::new(server);

    let upgraded = if mode.upgrades_outbound() {
        hook.upgrade(server, mode)
            .await
            .map(|server| (client, server))
    } else {
        hook.upgrade(client, mode)
            .await
            .map(|client| (client, server))
    };

    match upgraded {
        Ok((client, server)) => Ok(PendingPair {
            client,
            client_addr,
            server,
            server_addr,
        }),
        Err(e) => {
            stats.upgrade_failed();
            warn!(
                client = %client_addr,
                server = %server_addr,
                mode = %mode,
                error = %e,
                "transport upgrade failed, closing both legs"
            );
            Err(e)
        }
    }
}

/// Explicit relay state: pairing registry, watch set, and handle allocator.
pub struct RelayContext {
    registry: PairingRegistry,
    watch: WatchSet,
    next_id: u64,
    stats: Arc<RelayStats>,
}

impl RelayContext {
    /// Create a context whose watch set holds only the listening socket.
    ///
    /// # Arguments
    ///
    /// * `events_tx` - Channel on which leg tasks report to the event loop.
    /// * `stats` - Shared counters.
    pub fn new(events_tx: mpsc::Sender<LegEvent>, stats: Arc<RelayStats>) -> Self {
        Self {
            registry: PairingRegistry::new(),
            watch: WatchSet::new(SocketId(0), events_tx),
            next_id: 1,
            stats,
        }
    }

    fn allocate(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a freshly established pair and start watching both legs.
    ///
    /// Returns the `(client, server)` handles.
    pub fn open_session(&mut self, pair: PendingPair) -> FwdResult<(SocketId, SocketId)> {
        let client_id = self.allocate();
        let server_id = self.allocate();
        self.registry.register(client_id, server_id)?;
        self.watch.watch_pair(
            Leg {
                id: client_id,
                io: pair.client,
                peer_addr: pair.client_addr,
            },
            Leg {
                id: server_id,
                io: pair.server,
                peer_addr: pair.server_addr,
            },
        );
        self.stats.session_opened();

        info!(
            client = %pair.client_addr,
            server = %pair.server_addr,
            client_id = %client_id,
            server_id = %server_id,
            "connected"
        );
        Ok((client_id, server_id))
    }

    /// Forward a chunk read from `from` to its peer.
    ///
    /// Events from handles no longer registered are stale leftovers of a
    /// teardown and are dropped. Never waits: the chunk already holds a slot
    /// in the peer's write queue. Returns whether the bytes were delivered.
    pub fn forward(&mut self, from: SocketId, chunk: Chunk) -> bool {
        let n = chunk.data.len();
        let Some(to) = self.registry.peer_of(from) else {
            debug!(id = %from, bytes = n, "dropping data from closed leg");
            return false;
        };

        chunk.deliver();
        trace!(from = %from, to = %to, bytes = n, "forwarded");
        self.stats.forwarded(n);
        true
    }

    /// Tear down the pairing containing `x`.
    ///
    /// Unregisters both legs, removes them from the watch set, and closes
    /// each exactly once. Returns `false` (and does nothing) if `x` was
    /// already torn down, so redundant close events from both legs are safe.
    pub fn close_session(&mut self, x: SocketId, reason: CloseReason) -> bool {
        let Some((x, y)) = self.registry.unregister(x) else {
            debug!(id = %x, "close for leg already closed");
            return false;
        };

        let x_addr = self.watch.peer_addr(x);
        let y_addr = self.watch.peer_addr(y);
        match &reason {
            CloseReason::PeerShutdown => {}
            CloseReason::PeerReset(e) => {
                warn!(id = %x, peer = ?x_addr, error = %e, "leg reset");
            }
            CloseReason::WriteFailure(e) => {
                warn!(id = %x, peer = ?x_addr, error = %e, "write to leg failed");
            }
        }

        for id in [x, y] {
            if let Some(watcher) = self.watch.unwatch(id) {
                watcher.close();
                self.stats.leg_closed();
            }
        }
        self.stats.session_closed();

        info!(peer = ?x_addr, paired_with = ?y_addr, "disconnected");
        true
    }

    /// Whether the watch set is exactly the listener plus the registered
    /// handles, and the registry is symmetric.
    pub fn is_consistent(&self) -> bool {
        let watched: BTreeSet<SocketId> = self.watch.ids().collect();
        let expected: BTreeSet<SocketId> = std::iter::once(self.watch.listener())
            .chain(self.registry.ids())
            .collect();
        watched == expected && self.registry.is_symmetric()
    }

    #[cfg(test)]
    pub fn registry(&self) -> &PairingRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn watch_set(&self) -> &WatchSet {
        &self.watch
    }
}
