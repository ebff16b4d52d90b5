//! Client fan-out.
//!
//! Each connected WebSocket client owns a bounded queue and a sender task,
//! so one slow client never stalls the ingest path or its peers.
//!
//! Backpressure policy on a full queue:
//! 1. drop the oldest `heartbeat` (redundant),
//! 2. else drop the oldest `position_update` / `gate_metrics` (the newest
//!    batch supersedes them),
//! 3. never drop an `event` or `start_line_definition`. If only those are
//!    queued, the client may briefly exceed capacity, and once the overflow
//!    persists past the grace period it is disconnected as a slow consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use coach_types::MessageType;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::RelayCounters;

/// A fabricated envelope, serialized once and shared across all clients.
#[derive(Debug, Clone)]
pub struct OutboundMsg {
    pub kind: MessageType,
    pub seq: u64,
    pub json: Arc<str>,
}

impl OutboundMsg {
    fn droppable(&self) -> bool {
        matches!(
            self.kind,
            MessageType::Heartbeat | MessageType::PositionUpdate | MessageType::GateMetrics
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseReason {
    SlowConsumer,
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-client outbound queue.
pub struct ClientQueue {
    pub id: Uuid,
    capacity: usize,
    grace: Duration,
    buf: Mutex<VecDeque<OutboundMsg>>,
    overflow_since: Mutex<Option<Instant>>,
    closing: Mutex<Option<CloseReason>>,
    notify: Notify,
}

impl ClientQueue {
    fn new(capacity: usize, grace: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            capacity,
            grace,
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            overflow_since: Mutex::new(None),
            closing: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn close(&self, reason: CloseReason) {
        let mut closing = lock(&self.closing);
        if closing.is_none() {
            *closing = Some(reason);
        }
        drop(closing);
        self.notify.notify_one();
    }

    fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.closing)
    }

    pub fn depth(&self) -> usize {
        lock(&self.buf).len()
    }

    /// Enqueue one message under the drop policy. Returns `false` when the
    /// client must be disconnected as a slow consumer.
    fn enqueue(&self, msg: OutboundMsg, counters: &RelayCounters) -> bool {
        if self.close_reason().is_some() {
            return true;
        }
        let mut buf = lock(&self.buf);

        if buf.len() < self.capacity {
            buf.push_back(msg);
            *lock(&self.overflow_since) = None;
        } else if let Some(i) = buf.iter().position(|m| m.kind == MessageType::Heartbeat) {
            buf.remove(i);
            counters.client_drops.fetch_add(1, Ordering::Relaxed);
            buf.push_back(msg);
        } else if let Some(i) = buf.iter().position(|m| m.droppable()) {
            buf.remove(i);
            counters.client_drops.fetch_add(1, Ordering::Relaxed);
            buf.push_back(msg);
        } else if msg.droppable() {
            // Only never-drop messages are queued; shed the lossy newcomer.
            counters.client_drops.fetch_add(1, Ordering::Relaxed);
        } else {
            // A never-drop message against a queue of never-drop messages:
            // tolerate the overflow for the grace period, then cut the cord.
            let mut since = lock(&self.overflow_since);
            let started = *since.get_or_insert_with(Instant::now);
            if started.elapsed() > self.grace {
                return false;
            }
            buf.push_back(msg);
        }

        drop(buf);
        self.notify.notify_one();
        true
    }

    /// Await the next message; `None` means the client is closing.
    pub async fn next(&self) -> Option<OutboundMsg> {
        loop {
            if self.close_reason().is_some() {
                return None;
            }
            if let Some(msg) = lock(&self.buf).pop_front() {
                return Some(msg);
            }
            self.notify.notified().await;
        }
    }
}

/// Tracks connected clients and fans every outbound message to all of them.
pub struct Broadcaster {
    clients: RwLock<HashMap<Uuid, Arc<ClientQueue>>>,
    capacity: usize,
    grace: Duration,
    pub send_timeout: Duration,
    counters: Arc<RelayCounters>,
}

impl Broadcaster {
    pub fn new(
        capacity: usize,
        grace: Duration,
        send_timeout: Duration,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            capacity,
            grace,
            send_timeout,
            counters,
        }
    }

    pub fn register(&self) -> Arc<ClientQueue> {
        let client = Arc::new(ClientQueue::new(self.capacity, self.grace));
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.insert(client.id, client.clone());
        info!("Client {} connected ({} total)", client.id, clients.len());
        client
    }

    /// Idempotent removal; called from the socket handler on any exit path.
    pub fn unregister(&self, id: &Uuid) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.remove(id).is_some() {
            info!("Client {id} disconnected ({} total)", clients.len());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.depth())
            .collect()
    }

    /// Enqueue to every client. Non-blocking relative to the ingest path.
    pub fn broadcast(&self, msg: &OutboundMsg) {
        let clients: Vec<Arc<ClientQueue>> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for client in clients {
            if !client.enqueue(msg.clone(), &self.counters) {
                warn!("Client {} is a slow consumer, disconnecting", client.id);
                self.counters
                    .slow_consumer_disconnects
                    .fetch_add(1, Ordering::Relaxed);
                client.close(CloseReason::SlowConsumer);
            }
        }
    }

    /// Ask every client sender to close (shutdown path).
    pub fn close_all(&self) {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        for client in clients.values() {
            client.close(CloseReason::Shutdown);
        }
    }
}

/// Per-client sender loop: drains the queue into the socket, enforcing the
/// per-send timeout, and emits the close frame when asked to stop.
pub async fn run_sender(
    client: Arc<ClientQueue>,
    mut sink: SplitSink<WebSocket, Message>,
    send_timeout: Duration,
) {
    loop {
        match client.next().await {
            Some(msg) => {
                let frame = Message::Text(msg.json.as_ref().to_owned().into());
                match tokio::time::timeout(send_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!("Client {} send timed out, disconnecting", client.id);
                        break;
                    }
                }
            }
            None => {
                let (code, reason) = match client.close_reason() {
                    Some(CloseReason::SlowConsumer) => (close_code::POLICY, "slow consumer"),
                    _ => (close_code::NORMAL, "shutdown"),
                };
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageType, seq: u64) -> OutboundMsg {
        OutboundMsg {
            kind,
            seq,
            json: Arc::from(format!("{{\"seq\":{seq}}}")),
        }
    }

    fn counters() -> RelayCounters {
        RelayCounters::default()
    }

    #[tokio::test]
    async fn heartbeats_dropped_first() {
        let c = counters();
        let q = ClientQueue::new(3, Duration::from_secs(2));
        q.enqueue(msg(MessageType::Heartbeat, 1), &c);
        q.enqueue(msg(MessageType::PositionUpdate, 2), &c);
        q.enqueue(msg(MessageType::PositionUpdate, 3), &c);
        // Full: the heartbeat goes before any position update.
        assert!(q.enqueue(msg(MessageType::PositionUpdate, 4), &c));
        assert_eq!(c.client_drops.load(Ordering::Relaxed), 1);

        assert_eq!(q.next().await.unwrap().seq, 2);
        assert_eq!(q.next().await.unwrap().seq, 3);
        assert_eq!(q.next().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn lossy_batches_dropped_when_no_heartbeat_queued() {
        let c = counters();
        let q = ClientQueue::new(2, Duration::from_secs(2));
        q.enqueue(msg(MessageType::PositionUpdate, 1), &c);
        q.enqueue(msg(MessageType::Event, 2), &c);
        assert!(q.enqueue(msg(MessageType::GateMetrics, 3), &c));
        // The oldest lossy message (seq 1) was displaced; the event stayed.
        assert_eq!(q.next().await.unwrap().seq, 2);
        assert_eq!(q.next().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn events_never_dropped_incoming_lossy_shed_instead() {
        let c = counters();
        let q = ClientQueue::new(2, Duration::from_secs(2));
        q.enqueue(msg(MessageType::Event, 1), &c);
        q.enqueue(msg(MessageType::StartLineDefinition, 2), &c);
        // Queue is all never-drop: incoming heartbeat is shed, both stay.
        assert!(q.enqueue(msg(MessageType::Heartbeat, 3), &c));
        assert_eq!(q.depth(), 2);
        assert_eq!(q.next().await.unwrap().seq, 1);
        assert_eq!(q.next().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn persistent_event_overflow_disconnects_after_grace() {
        let c = counters();
        let q = ClientQueue::new(1, Duration::from_millis(10));
        q.enqueue(msg(MessageType::Event, 1), &c);
        // First overflow starts the grace period and is tolerated.
        assert!(q.enqueue(msg(MessageType::Event, 2), &c));
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still overflowing past the grace period: disconnect.
        assert!(!q.enqueue(msg(MessageType::Event, 3), &c));
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients_and_close_is_idempotent() {
        let counters = Arc::new(RelayCounters::default());
        let b = Broadcaster::new(8, Duration::from_secs(2), Duration::from_secs(5), counters);
        let c1 = b.register();
        let c2 = b.register();
        assert_eq!(b.client_count(), 2);

        b.broadcast(&msg(MessageType::Event, 7));
        assert_eq!(c1.next().await.unwrap().seq, 7);
        assert_eq!(c2.next().await.unwrap().seq, 7);

        b.unregister(&c1.id);
        b.unregister(&c1.id);
        assert_eq!(b.client_count(), 1);
    }
}
