//! The message fabricator: the single point where outbound envelopes are
//! stamped (seq, wall clock, session id, schema version) and routed to the
//! broadcaster and the recorder.
//!
//! Stamping is synchronous; the ingest path never suspends here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use coach_types::{Envelope, Payload, SCHEMA_VERSION};

use crate::broadcaster::{Broadcaster, OutboundMsg};
use crate::queue::BoundedQueue;
use crate::state::{now_ms, RelayCounters};

pub struct Fabricator {
    /// Next sequence number. Stamping and routing happen under this lock so
    /// every client queue observes envelopes in seq order.
    next_seq: Mutex<u64>,
    session_id: RwLock<Option<String>>,
    broadcaster: Arc<Broadcaster>,
    recorder_queue: Arc<BoundedQueue<Envelope>>,
    recording: Arc<AtomicBool>,
    counters: Arc<RelayCounters>,
}

impl Fabricator {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        recorder_queue: Arc<BoundedQueue<Envelope>>,
        recording: Arc<AtomicBool>,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            next_seq: Mutex::new(1),
            session_id: RwLock::new(None),
            broadcaster,
            recorder_queue,
            recording,
            counters,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    /// Stamp and route one outbound message. Returns the assigned `seq`.
    pub fn emit(&self, payload: Payload) -> u64 {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;
        *next_seq += 1;

        let envelope = Envelope {
            kind: payload.message_type(),
            schema_version: SCHEMA_VERSION.to_string(),
            seq,
            ts_ms: now_ms(),
            session_id: self.session_id(),
            payload,
        };

        let msg = OutboundMsg {
            kind: envelope.kind,
            seq,
            json: Arc::from(envelope.to_json()),
        };
        self.broadcaster.broadcast(&msg);

        // The recorder queue counts its own displacement on overflow.
        if self.recording.load(Ordering::Relaxed) {
            self.recorder_queue.push(envelope);
        }
        drop(next_seq);

        self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);
        seq
    }

    pub fn messages_relayed(&self) -> u64 {
        self.counters.messages_relayed.load(Ordering::Relaxed)
    }
}
