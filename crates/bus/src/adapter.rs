//! Bus adapter seam plus the in-memory adapter used for multi-engine
//! setups inside one process. Concrete transports (DDS, ...) implement the
//! same trait out of tree.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{BusError, Result};
use crate::protocol::ProtocolEvent;

/// A transport endpoint the engine broadcasts through and bulk-polls from.
/// Adapters may run their own receive threads; `poll` is called from the
/// engine tick thread.
pub trait BusAdapter: Send {
    fn name(&self) -> &str;

    /// Broadcast one event to every peer on this transport.
    fn send(&mut self, event: &ProtocolEvent) -> Result<()>;

    /// Drain every event received since the last poll into `sink`.
    /// Returns the number of events appended.
    fn poll(&mut self, sink: &mut Vec<ProtocolEvent>) -> usize;
}

type Frame = Vec<u8>;

struct HubInner {
    peers: Vec<(usize, mpsc::UnboundedSender<Frame>)>,
    next_endpoint: usize,
}

/// An in-process bus hub. Every connected adapter receives every frame sent
/// by any other adapter (never its own). Frames are serde_json bytes so the
/// wire shape is exercised end to end.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Mutex<HubInner>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                peers: Vec::new(),
                next_endpoint: 0,
            })),
        }
    }

    /// Connect a new endpoint to the hub.
    pub fn connect(&self, name: impl Into<String>) -> InMemoryBusAdapter {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let endpoint = inner.next_endpoint;
        inner.next_endpoint += 1;
        inner.peers.push((endpoint, tx));
        InMemoryBusAdapter {
            name: name.into(),
            endpoint,
            hub: self.inner.clone(),
            rx,
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryBusAdapter {
    name: String,
    endpoint: usize,
    hub: Arc<Mutex<HubInner>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl BusAdapter for InMemoryBusAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, event: &ProtocolEvent) -> Result<()> {
        let frame = serde_json::to_vec(event).map_err(BusError::Encode)?;
        let inner = self.hub.lock();
        for (endpoint, tx) in &inner.peers {
            if *endpoint == self.endpoint {
                continue;
            }
            // A closed peer just dropped its adapter; skip it.
            let _ = tx.send(frame.clone());
        }
        Ok(())
    }

    fn poll(&mut self, sink: &mut Vec<ProtocolEvent>) -> usize {
        let mut count = 0;
        while let Ok(frame) = self.rx.try_recv() {
            match serde_json::from_slice::<ProtocolEvent>(&frame) {
                Ok(event) => {
                    sink.push(event);
                    count += 1;
                }
                Err(err) => {
                    tracing::warn!(adapter = %self.name, error = %err, "Dropping malformed bus frame");
                }
            }
        }
        count
    }
}

impl Drop for InMemoryBusAdapter {
    fn drop(&mut self) {
        let mut inner = self.hub.lock();
        inner.peers.retain(|(endpoint, _)| *endpoint != self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{BusAddress, NodeType};
    use crate::protocol::{ControlCommand, ProtocolBody};
    use volition_core::UniqueId;

    fn event() -> ProtocolEvent {
        let mut e = ProtocolEvent::new(ProtocolBody::Control {
            command: ControlCommand::Start,
        });
        e.sender_node = BusAddress::new(NodeType::Node, UniqueId::random(), "a");
        e
    }

    #[test]
    fn frames_reach_every_other_endpoint() {
        let hub = InMemoryBus::new();
        let mut a = hub.connect("a");
        let mut b = hub.connect("b");
        let mut c = hub.connect("c");

        a.send(&event()).unwrap();

        let mut sink = Vec::new();
        assert_eq!(a.poll(&mut sink), 0, "no self-delivery");
        assert_eq!(b.poll(&mut sink), 1);
        assert_eq!(c.poll(&mut sink), 1);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn disconnected_endpoints_are_pruned() {
        let hub = InMemoryBus::new();
        let mut a = hub.connect("a");
        let b = hub.connect("b");
        drop(b);
        assert!(a.send(&event()).is_ok());
    }
}
