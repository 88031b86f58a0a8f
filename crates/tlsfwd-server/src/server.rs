//! Multiplexer: the relay's event loop.
//!
//! A single task owns the [`RelayContext`] and waits on three sources:
//!
//! 1. the listening socket: each accepted connection spawns an establish
//!    task (dial + upgrade) so a slow destination never stalls the loop;
//! 2. established pairs coming back from those tasks, which are registered;
//! 3. [`LegEvent`]s from the watched legs, which are forwarded or torn down.
//!
//! One event is dispatched per iteration, so at most one new connection is
//! handled per pass and no handle destroyed earlier in a pass is touched.

use crate::dialer::Dialer;
use crate::session::{establish, PendingPair, RelayContext};
use crate::stats::RelayStats;
use crate::watch::LegEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use tlsfwd_core::{FwdError, FwdResult, UpgradeHook, UpgradeMode};

/// Pending-connection backlog of the listening socket.
const LISTEN_BACKLOG: u32 = 23;

/// Capacity of the loop's inbound channels.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Pause after the first failed accept (EMFILE and friends).
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between accept attempts.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying accept after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(7);
    (ACCEPT_BACKOFF_MIN * (1u32 << shift)).min(ACCEPT_BACKOFF_MAX)
}

/// The relay: a bound listener plus everything needed to pair connections.
pub struct Relay {
    listener: TcpListener,
    dialer: Arc<Dialer>,
    hook: Arc<dyn UpgradeHook>,
    mode: UpgradeMode,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Bind the listening socket.
    ///
    /// The socket is created with `SO_REUSEADDR` so a restarted relay can
    /// rebind while old connections linger in `TIME_WAIT`.
    ///
    /// # Arguments
    ///
    /// * `addr` - Local address to listen on.
    /// * `dialer` - Opens the outbound leg for every accepted client.
    /// * `hook` - Upgrade hook applied to the leg selected by `mode`.
    /// * `mode` - Which leg is upgraded.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Bind`] if the socket cannot be created, bound, or
    /// put into listening state.
    pub fn bind(
        addr: SocketAddr,
        dialer: Dialer,
        hook: Arc<dyn UpgradeHook>,
        mode: UpgradeMode,
    ) -> FwdResult<Self> {
        let bind_err = |source: std::io::Error| FwdError::Bind {
            addr: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        info!(
            addr = %addr,
            destination = %dialer.destination(),
            mode = %mode,
            "relay listening"
        );

        Ok(Self {
            listener,
            dialer: Arc::new(dialer),
            hook,
            mode,
            stats: Arc::new(RelayStats::new()),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> FwdResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared relay counters.
    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Run the event loop until the task is dropped.
    ///
    /// Per-session failures are logged and contained; the loop itself never
    /// returns an error once running. Nothing in a pass waits on a single
    /// leg: forwarding only hands over chunks that already own queue space.
    pub async fn run(self) -> FwdResult<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<LegEvent>(EVENT_QUEUE_DEPTH);
        let (pair_tx, mut pair_rx) = mpsc::channel::<PendingPair>(EVENT_QUEUE_DEPTH);
        let mut ctx = RelayContext::new(events_tx, self.stats.clone());

        let mut accept_failures: u32 = 0;
        let mut resume_accept = Instant::now();

        loop {
            let accepting = Instant::now() >= resume_accept;

            tokio::select! {
                accepted = self.listener.accept(), if accepting => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            accept_failures = 0;
                            debug!(peer = %peer_addr, "accepted connection");
                            self.spawn_establish(stream, peer_addr, pair_tx.clone());
                        }
                        Err(e) => {
                            accept_failures = accept_failures.saturating_add(1);
                            let delay = accept_backoff(accept_failures);
                            warn!(error = %e, retry_in = ?delay, "accept failed");
                            resume_accept = Instant::now() + delay;
                        }
                    }
                }
                _ = sleep_until(resume_accept), if !accepting => {}
                Some(pair) = pair_rx.recv() => {
                    let client_addr = pair.client_addr;
                    if let Err(e) = ctx.open_session(pair) {
                        warn!(client = %client_addr, error = %e, "could not register pairing");
                    }
                }
                Some(event) = events_rx.recv() => {
                    match event {
                        LegEvent::Data { id, chunk } => {
                            ctx.forward(id, chunk);
                        }
                        LegEvent::Closed { id, reason } => {
                            ctx.close_session(id, reason);
                        }
                    }
                }
            }

            debug_assert!(
                ctx.is_consistent(),
                "watch set diverged from pairing registry"
            );
        }
    }

    /// Run the accept path for one client off the loop task.
    fn spawn_establish(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        pair_tx: mpsc::Sender<PendingPair>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "could not set TCP_NODELAY on inbound leg");
        }

        let dialer = self.dialer.clone();
        let hook = self.hook.clone();
        let mode = self.mode;
        let stats = self.stats.clone();

        tokio::spawn(async move {
            // Failures are logged and counted inside `establish`.
            if let Ok(pair) = establish(
                Box::new(stream),
                peer_addr,
                &dialer,
                hook.as_ref(),
                mode,
                &stats,
            )
            .await
            {
                if pair_tx.send(pair).await.is_err() {
                    debug!(peer = %peer_addr, "event loop gone, dropping pairing");
                }
            }
        });
    }
}
