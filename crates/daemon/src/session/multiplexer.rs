//! Session output relay.
//!
//! Fans one session's output out to every attached client and keeps the
//! scrollback that late joiners are replayed. The client set and the
//! scrollback sit behind one per-session lock, so a client that attaches
//! always receives its replay before any chunk produced after the attach.
//! Slow clients are handled by dropping messages when their buffers are full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::ServerMessage;
use tokio::sync::{mpsc, Mutex};

use super::scrollback::ScrollbackBuffer;

/// Unique identifier for a client.
pub type ClientId = String;

/// Default channel capacity for client output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total messages sent successfully.
    pub messages_sent: u64,
    /// Messages dropped due to slow client.
    pub messages_dropped: u64,
    /// Whether the client is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// A handle representing an attached client.
///
/// Each client has a bounded channel. When the channel is full, messages are
/// dropped rather than blocking the session or other clients.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ServerMessage>,
    stats: ClientStats,
}

impl ClientHandle {
    /// Creates a new client handle with the default capacity.
    pub fn new(id: ClientId) -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new client handle with a specific channel capacity.
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            stats: ClientStats::default(),
        };
        (handle, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns a clone of the current statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    /// Attempts to send a message without blocking.
    ///
    /// Returns true if the message was queued, false if it was dropped.
    fn try_send(&mut self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(client_id = %self.id, "Client recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        client_id = %self.id,
                        dropped = self.stats.messages_dropped,
                        "Client is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Client channel closed");
                false
            }
        }
    }

    /// Delivers the final messages of a session and releases the channel.
    ///
    /// The exit notice must not be lost to a full buffer, so when the
    /// channel is full it is handed to a task that waits for room.
    fn finish(mut self, notice: Option<&str>) {
        if let Some(text) = notice {
            self.try_send(ServerMessage::output(text));
        }

        match self.tx.try_send(ServerMessage::Exit) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                let tx = self.tx;
                tokio::spawn(async move {
                    let _ = tx.send(message).await;
                });
            }
        }
    }

    /// Checks if the client channel is closed.
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct RelayState {
    clients: HashMap<ClientId, ClientHandle>,
    scrollback: ScrollbackBuffer,
    closed: bool,
}

/// Fan-out relay for one session.
pub struct SessionRelay {
    state: Mutex<RelayState>,
    /// Last activity timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
    channel_capacity: usize,
}

impl SessionRelay {
    /// Creates a relay with the given scrollback budget in bytes.
    pub fn new(scrollback_capacity: usize) -> Self {
        Self::with_channel_capacity(scrollback_capacity, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a relay whose clients get channels of `channel_capacity`.
    pub fn with_channel_capacity(scrollback_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RelayState {
                clients: HashMap::new(),
                scrollback: ScrollbackBuffer::new(scrollback_capacity),
                closed: false,
            }),
            last_activity: AtomicU64::new(now_millis()),
            channel_capacity,
        }
    }

    /// Registers a client and queues the scrollback replay for it.
    ///
    /// The replay is always the first message on the returned receiver and
    /// is sent even when the scrollback is empty. Attaching to a relay that
    /// has already closed yields a receiver holding only the exit notice.
    pub async fn attach(&self, client_id: ClientId) -> mpsc::Receiver<ServerMessage> {
        let (mut handle, rx) = ClientHandle::with_capacity(client_id.clone(), self.channel_capacity);

        let mut state = self.state.lock().await;
        if state.closed {
            handle.finish(None);
            return rx;
        }

        let replay = state.scrollback.get_all();
        handle.try_send(ServerMessage::output(replay));
        state.clients.insert(client_id.clone(), handle);

        tracing::debug!(
            client_id = %client_id,
            clients = state.clients.len(),
            "Client attached to relay"
        );
        rx
    }

    /// Removes a client. Returns its statistics if it was attached.
    pub async fn detach(&self, client_id: &ClientId) -> Option<ClientStats> {
        let mut state = self.state.lock().await;
        let stats = state.clients.remove(client_id).map(|h| h.stats());
        if stats.is_some() {
            tracing::debug!(client_id = %client_id, "Client detached from relay");
        }
        stats
    }

    /// Records a chunk of process output and fans it out.
    ///
    /// Returns the number of clients that received the chunk.
    pub async fn publish(&self, chunk: &str) -> usize {
        let mut state = self.state.lock().await;
        if state.closed {
            return 0;
        }

        state.scrollback.append(chunk);
        self.touch();

        let mut disconnected = Vec::new();
        let mut delivered = 0;
        for (client_id, handle) in state.clients.iter_mut() {
            if handle.is_closed() {
                disconnected.push(client_id.clone());
                continue;
            }
            if handle.try_send(ServerMessage::output(chunk)) {
                delivered += 1;
            }
        }

        for client_id in disconnected {
            state.clients.remove(&client_id);
            tracing::debug!(client_id = %client_id, "Removed disconnected client");
        }

        delivered
    }

    /// Sends an optional notice and then `exit` to every client, and closes
    /// the relay. Later publishes are ignored. Returns the number of clients
    /// that were notified.
    pub async fn close(&self, notice: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;

        let clients: Vec<ClientHandle> = state.clients.drain().map(|(_, h)| h).collect();
        let count = clients.len();
        for handle in clients {
            handle.finish(notice);
        }
        count
    }

    /// Marks the session as active now.
    ///
    /// The stored timestamp never moves backwards.
    pub fn touch(&self) {
        self.last_activity.fetch_max(now_millis(), Ordering::Relaxed);
    }

    /// Returns the last activity timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Time elapsed since the last activity.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity()))
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Returns the number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Returns statistics for a specific client.
    pub async fn client_stats(&self, client_id: &ClientId) -> Option<ClientStats> {
        self.state
            .lock()
            .await
            .clients
            .get(client_id)
            .map(|h| h.stats())
    }

    /// Returns the current scrollback size in bytes.
    pub async fn scrollback_len(&self) -> usize {
        self.state.lock().await.scrollback.len()
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
