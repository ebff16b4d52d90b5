//! Upstream subscribers.
//!
//! One long-lived task per upstream topic. Each connects a ZMQ SUB socket
//! with a topic-prefix filter, pushes raw frames into a bounded drop-oldest
//! queue, and reconnects with jittered exponential backoff. Transport errors
//! are logged and retried; they never escape the task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::queue::BoundedQueue;

/// Backoff jitter band: ±20 %.
const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// Handle onto a running subscriber task.
#[derive(Clone)]
pub struct SubscriberHandle {
    pub name: &'static str,
    pub queue: Arc<BoundedQueue<String>>,
    pub connected: Arc<AtomicBool>,
    pub reconnects: Arc<AtomicU64>,
}

impl SubscriberHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

pub struct SubscriberConfig {
    pub name: &'static str,
    pub endpoint: String,
    pub topic: String,
    pub reconnect_min_s: f64,
    pub reconnect_max_s: f64,
    pub queue_capacity: usize,
}

/// Spawn a subscriber task; returns immediately with its handle.
pub fn spawn_subscriber(cfg: SubscriberConfig, shutdown: watch::Receiver<bool>) -> SubscriberHandle {
    let handle = SubscriberHandle {
        name: cfg.name,
        queue: Arc::new(BoundedQueue::new(cfg.queue_capacity)),
        connected: Arc::new(AtomicBool::new(false)),
        reconnects: Arc::new(AtomicU64::new(0)),
    };
    tokio::spawn(run_subscriber(cfg, handle.clone(), shutdown));
    handle
}

async fn run_subscriber(
    cfg: SubscriberConfig,
    handle: SubscriberHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay_s = cfg.reconnect_min_s;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect(&cfg).await {
            Ok(mut socket) => {
                info!("[{}] subscribed to {} on {}", cfg.name, cfg.topic, cfg.endpoint);
                handle.connected.store(true, Ordering::Relaxed);

                loop {
                    tokio::select! {
                        msg = socket.recv() => match msg {
                            Ok(msg) => {
                                // A successful receive resets the backoff.
                                delay_s = cfg.reconnect_min_s;
                                if let Some(payload) = extract_payload(msg, &cfg.topic) {
                                    handle.queue.push(payload);
                                }
                            }
                            Err(e) => {
                                warn!("[{}] receive failed: {e}", cfg.name);
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            handle.connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                handle.connected.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("[{}] connect to {} failed: {e}", cfg.name, cfg.endpoint);
            }
        }

        handle.reconnects.fetch_add(1, Ordering::Relaxed);
        let jittered = delay_s * rand::thread_rng().gen_range(JITTER_LOW..JITTER_HIGH);
        warn!("[{}] upstream down, reconnecting in {:.1}s", cfg.name, jittered);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(jittered)) => {}
            _ = shutdown.changed() => return,
        }
        delay_s = (delay_s * 2.0).min(cfg.reconnect_max_s);
    }
}

async fn connect(cfg: &SubscriberConfig) -> Result<SubSocket, zeromq::ZmqError> {
    let mut socket = SubSocket::new();
    socket.connect(&cfg.endpoint).await?;
    socket.subscribe(&cfg.topic).await?;
    Ok(socket)
}

/// Pull the payload out of a SUB frame. Publishers send multipart
/// `[topic, payload]`; a single-frame message carries the topic as a prefix
/// of the payload body.
fn extract_payload(msg: ZmqMessage, topic: &str) -> Option<String> {
    let frames = msg.into_vec();
    match frames.len() {
        0 => None,
        1 => {
            let body = String::from_utf8_lossy(&frames[0]).into_owned();
            let stripped = body
                .strip_prefix(topic)
                .map(|rest| rest.trim_start_matches([' ', ':']).to_string())
                .unwrap_or(body);
            Some(stripped)
        }
        _ => Some(String::from_utf8_lossy(&frames[frames.len() - 1]).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_takes_last_frame() {
        let mut msg = ZmqMessage::from("position".to_string());
        msg.push_back(bytes::Bytes::from_static(b"SERVER_TS:1\nCOUNT:0\n"));
        let payload = extract_payload(msg, "position").unwrap();
        assert_eq!(payload, "SERVER_TS:1\nCOUNT:0\n");
    }

    #[test]
    fn single_frame_strips_topic_prefix() {
        let msg = ZmqMessage::from("position SERVER_TS:1".to_string());
        assert_eq!(extract_payload(msg, "position").unwrap(), "SERVER_TS:1");
    }
}
