//! Watch set: the sockets the event loop is currently waiting on.
//!
//! Every registered leg gets two tasks:
//!
//! - a **reader** that pulls chunks of up to [`CHUNK_SIZE`] bytes and reports
//!   them (or end-of-stream / reset) to the loop as [`LegEvent`]s;
//! - a **writer** that drains the leg's write queue, shutting the write side
//!   down once the queue is closed.
//!
//! A reader only reads after reserving a slot in its peer's write queue, so a
//! peer that stops draining pauses that one reader and never the event loop.
//! Each [`Chunk`] carries its reserved slot; delivering it cannot block.
//!
//! Removing a leg from the set ([`WatchSet::unwatch`]) hands back its
//! [`Watcher`]; [`Watcher::close`] stops the reader, closes the write queue,
//! and bounds how long the writer may keep flushing. Because removal is
//! exclusive, each leg is closed at most once.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::{self, OwnedPermit, WeakSender};
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use tlsfwd_core::{split_session, BoxedIo, SessionReader, SessionWriter, SocketId};

/// Maximum bytes read from a leg per event.
pub const CHUNK_SIZE: usize = 4096;

/// Chunks buffered per leg before its peer's reader pauses.
const WRITE_QUEUE_DEPTH: usize = 64;

/// How long a closed leg may keep flushing queued bytes before it is dropped.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a leg stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Zero-length read: the remote end performed an orderly shutdown.
    PeerShutdown,
    /// Read error, typically a connection reset.
    PeerReset(String),
    /// Writing forwarded bytes to this leg failed.
    WriteFailure(String),
}

/// Bytes read from one leg, with room already reserved in the peer's queue.
pub struct Chunk {
    pub data: Vec<u8>,
    slot: OwnedPermit<Vec<u8>>,
}

impl Chunk {
    /// Hand the bytes to the peer's writer. Never waits.
    pub fn deliver(self) {
        self.slot.send(self.data);
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.data.len()).finish()
    }
}

/// Event reported by a leg's I/O tasks to the event loop.
#[derive(Debug)]
pub enum LegEvent {
    /// Bytes read from leg `id`, to be forwarded to its peer.
    Data { id: SocketId, chunk: Chunk },
    /// Leg `id` ended; the whole pairing must be torn down.
    Closed { id: SocketId, reason: CloseReason },
}

/// One connected leg about to be watched.
pub struct Leg {
    pub id: SocketId,
    pub io: BoxedIo,
    pub peer_addr: SocketAddr,
}

/// Handles to the I/O tasks of one watched leg.
pub struct Watcher {
    peer_addr: SocketAddr,
    reader: AbortHandle,
    writer: AbortHandle,
    /// Only strong sender of the leg's write queue; the peer's reader holds a weak one.
    write_tx: mpsc::Sender<Vec<u8>>,
}

impl Watcher {
    /// Remote address of the leg.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Stop watching and close the leg.
    ///
    /// The reader is aborted immediately. The writer may flush what was
    /// already queued and shut the write side down, but is aborted after
    /// [`FLUSH_TIMEOUT`] if the remote stops draining. The OS socket is
    /// released once both tasks have dropped their halves.
    pub fn close(self) {
        self.reader.abort();
        drop(self.write_tx);

        let writer = self.writer;
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_TIMEOUT).await;
            writer.abort();
        });
    }
}

/// The listening socket plus every registered session leg.
pub struct WatchSet {
    listener: SocketId,
    legs: HashMap<SocketId, Watcher>,
    events_tx: mpsc::Sender<LegEvent>,
}

impl WatchSet {
    /// Create a watch set containing only the listening socket.
    ///
    /// # Arguments
    ///
    /// * `listener` - Handle of the listening socket; never paired.
    /// * `events_tx` - Channel the leg tasks report to.
    pub fn new(listener: SocketId, events_tx: mpsc::Sender<LegEvent>) -> Self {
        Self {
            listener,
            legs: HashMap::new(),
            events_tx,
        }
    }

    /// Handle of the listening socket.
    pub fn listener(&self) -> SocketId {
        self.listener
    }

    /// Start watching both legs of a pairing.
    ///
    /// Each leg's reader is wired to the other leg's write queue. Callers
    /// must only watch handles they have just registered.
    pub fn watch_pair(&mut self, a: Leg, b: Leg) {
        let (a_tx, a_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let a_to_b = b_tx.downgrade();
        let b_to_a = a_tx.downgrade();

        self.start(a, a_tx, a_rx, a_to_b);
        self.start(b, b_tx, b_rx, b_to_a);
    }

    fn start(
        &mut self,
        leg: Leg,
        write_tx: mpsc::Sender<Vec<u8>>,
        write_rx: mpsc::Receiver<Vec<u8>>,
        peer_queue: WeakSender<Vec<u8>>,
    ) {
        let id = leg.id;
        let (reader, writer) = split_session(leg.io);

        let reader_task = tokio::spawn(read_loop(id, reader, peer_queue, self.events_tx.clone()));
        let writer_task = tokio::spawn(write_loop(id, writer, write_rx, self.events_tx.clone()));

        let previous = self.legs.insert(
            id,
            Watcher {
                peer_addr: leg.peer_addr,
                reader: reader_task.abort_handle(),
                writer: writer_task.abort_handle(),
                write_tx,
            },
        );
        debug_assert!(previous.is_none(), "{id} watched twice");
    }

    /// Stop watching `id`, returning its watcher if it was watched.
    pub fn unwatch(&mut self, id: SocketId) -> Option<Watcher> {
        self.legs.remove(&id)
    }

    /// Remote address of a watched leg.
    pub fn peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.legs.get(&id).map(Watcher::peer_addr)
    }

    /// Every watched handle, listener first.
    pub fn ids(&self) -> impl Iterator<Item = SocketId> + '_ {
        std::iter::once(self.listener).chain(self.legs.keys().copied())
    }

    #[cfg(test)]
    pub fn contains(&self, id: SocketId) -> bool {
        id == self.listener || self.legs.contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.legs.len() + 1
    }
}

/// Reader task: forward chunks from one leg to the event loop.
async fn read_loop(
    id: SocketId,
    mut reader: SessionReader,
    peer_queue: WeakSender<Vec<u8>>,
    events_tx: mpsc::Sender<LegEvent>,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let Some(peer_tx) = peer_queue.upgrade() else {
            debug!(id = %id, "peer queue closed, ending reader");
            break;
        };
        // Waits here while the peer is not draining.
        let Ok(slot) = peer_tx.reserve_owned().await else {
            debug!(id = %id, "peer writer stopped, ending reader");
            break;
        };

        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(id = %id, "leg reached end of stream");
                let _ = events_tx
                    .send(LegEvent::Closed {
                        id,
                        reason: CloseReason::PeerShutdown,
                    })
                    .await;
                break;
            }
            Ok(n) => {
                trace!(id = %id, bytes = n, "read chunk");
                let chunk = Chunk {
                    data: buf[..n].to_vec(),
                    slot,
                };
                if events_tx.send(LegEvent::Data { id, chunk }).await.is_err() {
                    debug!(id = %id, "event loop gone, ending reader");
                    break;
                }
            }
            Err(e) => {
                let _ = events_tx
                    .send(LegEvent::Closed {
                        id,
                        reason: CloseReason::PeerReset(e.to_string()),
                    })
                    .await;
                break;
            }
        }
    }
}

/// Writer task: drain the write queue into one leg, then shut it down.
async fn write_loop(
    id: SocketId,
    mut writer: SessionWriter,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<LegEvent>,
) {
    while let Some(data) = write_rx.recv().await {
        if let Err(e) = writer.write(&data).await {
            let _ = events_tx
                .send(LegEvent::Closed {
                    id,
                    reason: CloseReason::WriteFailure(e.to_string()),
                })
                .await;
            return;
        }
    }

    // Queue closed: the pairing was torn down.
    if let Err(e) = writer.close().await {
        debug!(id = %id, error = %e, "shutdown of write side failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Watch two in-memory legs as #1 and #2; returns their far ends.
    fn watched_pair(set: &mut WatchSet, capacity: usize) -> (DuplexStream, DuplexStream) {
        let (a, a_far) = tokio::io::duplex(capacity);
        let (b, b_far) = tokio::io::duplex(capacity);
        set.watch_pair(
            Leg {
                id: SocketId(1),
                io: Box::new(a),
                peer_addr: addr(1),
            },
            Leg {
                id: SocketId(2),
                io: Box::new(b),
                peer_addr: addr(2),
            },
        );
        (a_far, b_far)
    }

    async fn next_event(rx: &mut mpsc::Receiver<LegEvent>) -> LegEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for leg event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn reader_reports_data_then_shutdown() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        let (mut a_far, mut b_far) = watched_pair(&mut set, 1024);

        a_far.write_all(b"\0bin\0").await.unwrap();
        match next_event(&mut events_rx).await {
            LegEvent::Data { id, chunk } => {
                assert_eq!(id, SocketId(1));
                assert_eq!(chunk.data, b"\0bin\0");
                chunk.deliver();
            }
            other => panic!("unexpected event {other:?}"),
        }
        let mut buf = [0u8; 5];
        timeout(WAIT, b_far.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"\0bin\0");

        drop(a_far);
        match next_event(&mut events_rx).await {
            LegEvent::Closed { id, reason } => {
                assert_eq!(id, SocketId(1));
                assert_eq!(reason, CloseReason::PeerShutdown);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_are_chunked() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        let (mut a_far, _b_far) = watched_pair(&mut set, 4 * CHUNK_SIZE);

        a_far.write_all(&vec![7u8; CHUNK_SIZE + 100]).await.unwrap();
        let mut total = 0;
        while total < CHUNK_SIZE + 100 {
            match next_event(&mut events_rx).await {
                LegEvent::Data { chunk, .. } => {
                    assert!(chunk.data.len() <= CHUNK_SIZE);
                    total += chunk.data.len();
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(total, CHUNK_SIZE + 100);
    }

    #[tokio::test]
    async fn reader_pauses_while_peer_queue_is_full() {
        let (events_tx, mut events_rx) = mpsc::channel(4 * WRITE_QUEUE_DEPTH);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        // The peer's far end never reads, so its writer stalls after one
        // buffer's worth and the queue fills up.
        let (a_far, _b_far) = watched_pair(&mut set, 16);

        let feeder = tokio::spawn(async move {
            let mut a_far = a_far;
            let _ = a_far.write_all(&vec![1u8; 16 * (WRITE_QUEUE_DEPTH + 8)]).await;
            a_far
        });

        let mut delivered = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(300), events_rx.recv()).await {
            match event {
                LegEvent::Data { chunk, .. } => {
                    chunk.deliver();
                    delivered += 1;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        // Queue depth plus the chunk held by the stalled writer (and one
        // more the writer may have partially written).
        assert!(delivered <= WRITE_QUEUE_DEPTH + 2, "delivered {delivered} chunks");
        assert!(!feeder.is_finished(), "reader should have stopped draining the leg");
        feeder.abort();
    }

    #[tokio::test]
    async fn close_flushes_queue_then_shuts_down() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        let (mut a_far, mut b_far) = watched_pair(&mut set, 1024);

        a_far.write_all(b"last words").await.unwrap();
        match next_event(&mut events_rx).await {
            LegEvent::Data { chunk, .. } => chunk.deliver(),
            other => panic!("unexpected event {other:?}"),
        }
        set.unwatch(SocketId(1)).unwrap().close();
        set.unwatch(SocketId(2)).unwrap().close();

        let mut received = Vec::new();
        timeout(WAIT, b_far.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn close_releases_leg_whose_remote_never_reads() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        let (a_far, mut b_far) = watched_pair(&mut set, 64);

        let feeder = tokio::spawn(async move {
            let mut a_far = a_far;
            a_far.write_all(&[9u8; 1024]).await.unwrap();
            a_far
        });
        let mut queued = 0;
        while queued < 1024 {
            match next_event(&mut events_rx).await {
                LegEvent::Data { chunk, .. } => {
                    queued += chunk.data.len();
                    chunk.deliver();
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let _a_far = feeder.await.unwrap();

        // The writer for #2 is now stuck: b_far never reads.
        set.unwatch(SocketId(1)).unwrap().close();
        set.unwatch(SocketId(2)).unwrap().close();

        // Once the leg is dropped, writes from the remote end fail.
        let closed = timeout(FLUSH_TIMEOUT + WAIT, async {
            loop {
                if b_far.write_all(b"x").await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "leg still open after close");
    }

    #[tokio::test]
    async fn membership_tracks_watch_and_unwatch() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut set = WatchSet::new(SocketId(0), events_tx);
        let (_a_far, _b_far) = watched_pair(&mut set, 64);

        assert!(set.contains(SocketId(0)));
        assert!(set.contains(SocketId(1)));
        assert!(set.contains(SocketId(2)));
        assert_eq!(set.len(), 3);
        assert_eq!(set.peer_addr(SocketId(2)), Some(addr(2)));

        let watcher = set.unwatch(SocketId(2)).unwrap();
        assert_eq!(watcher.peer_addr(), addr(2));
        watcher.close();
        assert!(set.unwatch(SocketId(2)).is_none());
        assert!(!set.contains(SocketId(2)));

        set.unwatch(SocketId(1)).unwrap().close();
        assert_eq!(set.ids().collect::<Vec<_>>(), vec![SocketId(0)]);
    }
}
