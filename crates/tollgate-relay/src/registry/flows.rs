//! Datagram flow registry for one HTTP/3 connection.
//!
//! Every HTTP datagram starts with the quarter stream id of the request that
//! owns it. The demux task reads datagrams off the QUIC connection and hands
//! them to the matching CONNECT-UDP handler.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::tunnel::varint;

/// Datagrams buffered per flow before new ones are dropped.
pub const FLOW_QUEUE: usize = 256;

/// Thread-safe map from quarter stream id to the flow's datagram queue.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: Arc<RwLock<HashMap<u64, mpsc::Sender<Bytes>>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow and return the receiver for its datagrams, without
    /// the quarter stream id prefix.
    pub async fn register(&self, quarter_id: u64) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        self.flows.write().await.insert(quarter_id, tx);
        debug!(quarter_id, "Datagram flow registered");
        rx
    }

    /// Remove a flow. Its receiver sees the end of the queue.
    pub async fn unregister(&self, quarter_id: u64) -> bool {
        let removed = self.flows.write().await.remove(&quarter_id).is_some();
        if removed {
            debug!(quarter_id, "Datagram flow unregistered");
        }
        removed
    }

    /// Route a raw datagram to its flow. Returns whether it was queued.
    /// Unknown flows, malformed prefixes and full queues drop the datagram.
    pub async fn dispatch(&self, datagram: Bytes) -> bool {
        let Some((quarter_id, len)) = varint::decode(&datagram) else {
            trace!("Dropping datagram without a flow id");
            return false;
        };
        let flows = self.flows.read().await;
        let Some(tx) = flows.get(&quarter_id) else {
            trace!(quarter_id, "Dropping datagram for unknown flow");
            return false;
        };
        match tx.try_send(datagram.slice(len..)) {
            Ok(()) => true,
            Err(e) => {
                trace!(quarter_id, error = %e, "Dropping datagram");
                false
            }
        }
    }

    /// Count of registered flows.
    pub async fn flow_count(&self) -> usize {
        self.flows.read().await.len()
    }
}

/// Prefix `payload` with the flow's quarter stream id.
pub fn prefix_datagram(quarter_id: u64, payload: &[u8]) -> Bytes {
    let mut buf = bytes::BytesMut::with_capacity(varint::encoded_len(quarter_id) + payload.len());
    varint::encode(quarter_id, &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}
