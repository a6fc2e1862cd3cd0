//! Per-protocol messengers over a [`Transport`] (C4): targeted send,
//! broadcast to connected peers, and inbound dispatch — generalizing the
//! teacher's `Session`/`SyncService` wrap-a-connection shape to the spec's
//! protocol-addressed transport.

use crate::protocol::{decode_body, encode_body, SyncMessage};
use crate::transport::Transport;
use crate::error::Result;
use std::sync::{Arc, Mutex, Weak};

type Handler = Box<dyn Fn(SyncMessage) + Send + Sync>;

/// Sends/receives [`SyncMessage`] envelopes on one named protocol.
pub struct ProtocolMessenger {
    protocol: &'static str,
    transport: Arc<dyn Transport>,
    handlers: Mutex<Vec<Handler>>,
}

impl ProtocolMessenger {
    pub fn new(protocol: &'static str, transport: Arc<dyn Transport>) -> Arc<Self> {
        let messenger = Arc::new(Self { protocol, transport: transport.clone(), handlers: Mutex::new(Vec::new()) });
        let weak: Weak<Self> = Arc::downgrade(&messenger);
        transport.on_message(
            protocol,
            Box::new(move |from, bytes| {
                let Some(messenger) = weak.upgrade() else { return };
                match decode_body(&bytes) {
                    Some(msg) => messenger.dispatch(msg),
                    None => tracing::debug!(protocol = messenger.protocol, %from, "dropped malformed frame"),
                }
            }),
        );
        messenger
    }

    pub async fn send(&self, target: &str, msg: &SyncMessage) -> Result<()> {
        let bytes = encode_body(msg)?;
        self.transport.send(self.protocol, target, bytes).await
    }

    /// Sends to every currently connected peer; individual failures are
    /// logged and never aggregated into a fatal error.
    pub async fn broadcast(&self, msg: &SyncMessage) {
        for peer in self.transport.get_connected_peers().await {
            if let Err(err) = self.send(&peer, msg).await {
                tracing::warn!(protocol = self.protocol, %peer, %err, "broadcast dispatch failed");
            }
        }
    }

    pub fn on_message(&self, cb: Handler) {
        self.handlers.lock().unwrap().push(cb);
    }

    fn dispatch(&self, msg: SyncMessage) {
        for cb in self.handlers.lock().unwrap().iter() {
            cb(msg.clone());
        }
    }
}

type TrustPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Wraps a messenger with a trust predicate; inbound messages from an
/// untrusted `from` are dropped before reaching downstream handlers, and
/// outbound broadcasts are filtered to trusted peers before dispatch.
/// Applied to CLIP and HISTORY, never to TRUST.
pub struct TrustedMessenger {
    inner: Arc<ProtocolMessenger>,
    is_trusted: TrustPredicate,
    handlers: Mutex<Vec<Handler>>,
}

impl TrustedMessenger {
    pub fn new(inner: Arc<ProtocolMessenger>, is_trusted: impl Fn(&str) -> bool + Send + Sync + 'static) -> Arc<Self> {
        let is_trusted: TrustPredicate = Box::new(is_trusted);
        let wrapper = Arc::new(Self { inner: inner.clone(), is_trusted, handlers: Mutex::new(Vec::new()) });
        let weak: Weak<Self> = Arc::downgrade(&wrapper);
        inner.on_message(Box::new(move |msg| {
            let Some(wrapper) = weak.upgrade() else { return };
            let from = msg.from_field();
            if !(wrapper.is_trusted)(from) {
                tracing::warn!(%from, "dropped message from untrusted peer");
                return;
            }
            wrapper.dispatch(msg);
        }));
        wrapper
    }

    pub async fn send(&self, target: &str, msg: &SyncMessage) -> Result<()> {
        self.inner.send(target, msg).await
    }

    /// Sends only to connected peers that pass the trust predicate — the
    /// outbound counterpart to the inbound gate in `dispatch`, so an
    /// untrusted peer that the transport has marked "connected" (e.g. by
    /// sending even one rejected trust-request) never receives a CLIP or
    /// HISTORY broadcast.
    pub async fn broadcast(&self, msg: &SyncMessage) {
        for peer in self.inner.transport.get_connected_peers().await {
            if !(self.is_trusted)(&peer) {
                continue;
            }
            if let Err(err) = self.inner.send(&peer, msg).await {
                tracing::warn!(protocol = self.inner.protocol, %peer, %err, "broadcast dispatch failed");
            }
        }
    }

    pub fn on_message(&self, cb: Handler) {
        self.handlers.lock().unwrap().push(cb);
    }

    fn dispatch(&self, msg: SyncMessage) {
        for cb in self.handlers.lock().unwrap().iter() {
            cb(msg.clone());
        }
    }
}
