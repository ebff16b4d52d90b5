//! ZMQ PUB sockets for the two upstream streams.
//!
//! Frames go out as multipart `[topic, payload]`, matching what the relay's
//! subscribers expect. Send errors are logged and skipped; the mock never
//! stops publishing because one frame failed.

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

pub struct UpstreamPublisher {
    position: PubSocket,
    gate: PubSocket,
    position_topic: String,
    gate_topic: String,
}

impl UpstreamPublisher {
    pub async fn bind(
        position_bind: &str,
        gate_bind: &str,
        position_topic: &str,
        gate_topic: &str,
    ) -> Result<Self> {
        let mut position = PubSocket::new();
        position
            .bind(position_bind)
            .await
            .with_context(|| format!("binding position PUB socket on {position_bind}"))?;
        let mut gate = PubSocket::new();
        gate.bind(gate_bind)
            .await
            .with_context(|| format!("binding gate PUB socket on {gate_bind}"))?;

        info!("📡 Publishing positions on {position_bind}, gate metrics on {gate_bind}");
        Ok(Self {
            position,
            gate,
            position_topic: position_topic.to_string(),
            gate_topic: gate_topic.to_string(),
        })
    }

    pub async fn send_positions(&mut self, frame: &str) {
        let msg = multipart(&self.position_topic, frame);
        if let Err(e) = self.position.send(msg).await {
            warn!("position publish failed: {e}");
        } else {
            debug!("position frame out ({} bytes)", frame.len());
        }
    }

    pub async fn send_gate(&mut self, frame: &str) {
        let msg = multipart(&self.gate_topic, frame);
        if let Err(e) = self.gate.send(msg).await {
            warn!("gate publish failed: {e}");
        }
    }
}

fn multipart(topic: &str, payload: &str) -> ZmqMessage {
    let mut msg = ZmqMessage::from(topic.to_string());
    msg.push_back(Bytes::from(payload.to_string()));
    msg
}
