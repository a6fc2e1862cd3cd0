//! Transport capability (C4, §6): `start/stop`, protocol-addressed `send`,
//! inbound message and peer connect/disconnect callbacks. `MemoryTransport`
//! is the in-process test double every C4-C8 test drives instead of real
//! QUIC/mDNS sockets, generalizing the teacher's `MemoryConnection`/
//! `memory_connection_pair` channel idiom to the spec's higher-level
//! "send(protocol, target, bytes)" shape: delivery is a direct call into
//! the target's dispatch table rather than routed through a channel task.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

pub type MessageCallback = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;
pub type PeerCallback = Box<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// `target` is a multiaddr (ending `/p2p/<device_id>`) or the device id
    /// of an already-connected peer.
    async fn send(&self, protocol: &str, target: &str, bytes: Vec<u8>) -> Result<()>;
    fn on_message(&self, protocol: &str, cb: MessageCallback);
    fn on_peer_connected(&self, cb: PeerCallback);
    fn on_peer_disconnected(&self, cb: PeerCallback);
    async fn get_connected_peers(&self) -> Vec<String>;
}

pub fn peer_id_of(target: &str) -> &str {
    match target.rfind("/p2p/") {
        Some(idx) => &target[idx + "/p2p/".len()..],
        None => target,
    }
}

/// Shared "network": maps device id to a weak handle on its transport, so
/// `send` can dispatch directly into the recipient without a relay task.
#[derive(Default)]
pub struct MemoryHub {
    nodes: Mutex<HashMap<String, Weak<MemoryTransport>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct MemoryTransport {
    device_id: String,
    hub: Arc<MemoryHub>,
    self_weak: Mutex<Weak<MemoryTransport>>,
    started: Mutex<bool>,
    connected: Mutex<HashSet<String>>,
    handlers: Mutex<HashMap<String, Vec<MessageCallback>>>,
    on_connected: Mutex<Vec<PeerCallback>>,
    on_disconnected: Mutex<Vec<PeerCallback>>,
}

impl MemoryTransport {
    pub fn new(device_id: impl Into<String>, hub: Arc<MemoryHub>) -> Arc<Self> {
        let transport = Arc::new(Self {
            device_id: device_id.into(),
            hub,
            self_weak: Mutex::new(Weak::new()),
            started: Mutex::new(false),
            connected: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            on_connected: Mutex::new(Vec::new()),
            on_disconnected: Mutex::new(Vec::new()),
        });
        *transport.self_weak.lock().unwrap() = Arc::downgrade(&transport);
        transport
    }

    fn mark_connected(&self, peer: &str) {
        let inserted = self.connected.lock().unwrap().insert(peer.to_string());
        if inserted {
            for cb in self.on_connected.lock().unwrap().iter() {
                cb(peer.to_string());
            }
        }
    }

    fn dispatch(&self, protocol: &str, from: String, bytes: Vec<u8>) {
        self.mark_connected(&from);
        let handlers = self.handlers.lock().unwrap();
        if let Some(cbs) = handlers.get(protocol) {
            for cb in cbs {
                cb(from.clone(), bytes.clone());
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        let weak = self.self_weak.lock().unwrap().clone();
        self.hub.nodes.lock().unwrap().insert(self.device_id.clone(), weak);
        *self.started.lock().unwrap() = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.started.lock().unwrap() = false;
        self.hub.nodes.lock().unwrap().remove(&self.device_id);
        let peers: Vec<String> = self.connected.lock().unwrap().drain().collect();
        for peer in peers {
            for cb in self.on_disconnected.lock().unwrap().iter() {
                cb(peer.clone());
            }
        }
        Ok(())
    }

    async fn send(&self, protocol: &str, target: &str, bytes: Vec<u8>) -> Result<()> {
        if !*self.started.lock().unwrap() {
            return Err(Error::NotStarted);
        }
        let peer = peer_id_of(target).to_string();
        let recipient = {
            let nodes = self.hub.nodes.lock().unwrap();
            nodes.get(&peer).cloned()
        };
        let Some(recipient) = recipient.and_then(|w| w.upgrade()) else {
            return Err(Error::DialFailed(format!("no route to {peer}")));
        };
        self.mark_connected(&peer);
        recipient.dispatch(protocol, self.device_id.clone(), bytes);
        Ok(())
    }

    fn on_message(&self, protocol: &str, cb: MessageCallback) {
        self.handlers.lock().unwrap().entry(protocol.to_string()).or_default().push(cb);
    }

    fn on_peer_connected(&self, cb: PeerCallback) {
        self.on_connected.lock().unwrap().push(cb);
    }

    fn on_peer_disconnected(&self, cb: PeerCallback) {
        self.on_disconnected.lock().unwrap().push(cb);
    }

    async fn get_connected_peers(&self) -> Vec<String> {
        self.connected.lock().unwrap().iter().cloned().collect()
    }
}
