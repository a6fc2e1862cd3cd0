//! End-to-end scenarios wiring identity, pairing, trust, clip sync, and
//! history sync together over the in-memory transport, mirroring the
//! teacher's `mesh_sync_tests.rs`/`persistent_sync.rs` two-device setups.

use openclipboard_core::clipboard::{ClipboardIo, ManualClipboard};
use openclipboard_core::history::{ClipHistoryStore, HistoryQuery};
use openclipboard_core::history_sync::HistorySyncController;
use openclipboard_core::identity::{now_ms, IdentityService};
use openclipboard_core::messenger::{ProtocolMessenger, TrustedMessenger};
use openclipboard_core::pairing::PairingPayload;
use openclipboard_core::protocol::{trust_request_signing_bytes, SyncMessage, CLIP_PROTOCOL, HISTORY_PROTOCOL, TRUST_PROTOCOL};
use openclipboard_core::store::MemoryKvStore;
use openclipboard_core::sync::ClipboardSyncController;
use openclipboard_core::transport::{MemoryHub, MemoryTransport, Transport};
use openclipboard_core::trust::{TrustEvent, TrustManager, TrustMessenger, TrustedDevice};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct QuicTrustMessenger {
    inner: Arc<ProtocolMessenger>,
}

#[async_trait::async_trait]
impl TrustMessenger for QuicTrustMessenger {
    async fn send(&self, target: &TrustedDevice, msg: SyncMessage) -> openclipboard_core::Result<()> {
        self.inner.send(&target.device_id, &msg).await
    }
}

struct Device {
    id: String,
    identity: Arc<IdentityService<MemoryKvStore>>,
    trust: Arc<TrustManager<MemoryKvStore>>,
    transport: Arc<MemoryTransport>,
    clipboard: Arc<ManualClipboard>,
    history: Arc<ClipHistoryStore<MemoryKvStore>>,
    // Held alive for the device's lifetime: `start()` registers the clip
    // handler on the transport via a weak self-reference.
    _sync: Arc<ClipboardSyncController<ManualClipboard, MemoryKvStore>>,
    history_sync: Arc<HistorySyncController<MemoryKvStore>>,
}

impl Device {
    async fn spin_up(name: &str, hub: Arc<MemoryHub>) -> Self {
        let identity = Arc::new(IdentityService::new(MemoryKvStore::new()));
        identity.rename(name).unwrap();
        let device_id = identity.get().unwrap().device_id;
        identity.update_multiaddrs(vec![format!("/ip4/127.0.0.1/udp/0/quic/p2p/{device_id}")]).unwrap();

        let transport = MemoryTransport::new(device_id.clone(), hub);
        transport.start().await.unwrap();

        let trust = TrustManager::new(identity.clone(), MemoryKvStore::new());
        let trust_raw = ProtocolMessenger::new(TRUST_PROTOCOL, transport.clone());
        let trust_messenger: Arc<dyn TrustMessenger> = Arc::new(QuicTrustMessenger { inner: trust_raw.clone() });
        trust.bind_messenger(trust_messenger);
        let trust_for_dispatch = trust.clone();
        trust_raw.on_message(Box::new(move |msg| {
            let trust = trust_for_dispatch.clone();
            tokio::spawn(async move { trust.handle_trust_message(msg).await });
        }));

        let clipboard = Arc::new(ManualClipboard::new(device_id.clone()));
        let history = Arc::new(ClipHistoryStore::new(MemoryKvStore::new()).unwrap());
        let sync = ClipboardSyncController::new(device_id.clone(), clipboard.clone(), history.clone());
        let clip_raw = ProtocolMessenger::new(CLIP_PROTOCOL, transport.clone());
        let trusted_for_clip = trust.clone();
        let clip_messenger = TrustedMessenger::new(clip_raw, move |from| trusted_for_clip.is_trusted(from));
        sync.bind_messaging(clip_messenger);
        sync.start().await.unwrap();

        let history_raw = ProtocolMessenger::new(HISTORY_PROTOCOL, transport.clone());
        let trusted_for_history = trust.clone();
        let history_messenger = TrustedMessenger::new(history_raw, move |from| trusted_for_history.is_trusted(from));
        let history_sync = HistorySyncController::new(device_id.clone(), history.clone(), history_messenger);

        let history_sync_for_approval = history_sync.clone();
        trust.on(
            TrustEvent::Approved,
            Box::new(move |device| {
                let history_sync = history_sync_for_approval.clone();
                let device_id = device.device_id.clone();
                tokio::spawn(async move { history_sync.on_peer_approved(&device_id).await });
            }),
        );

        Device { id: device_id, identity, trust, transport, clipboard, history, _sync: sync, history_sync }
    }

    fn pairing_payload(&self) -> PairingPayload {
        let identity = self.identity.get().unwrap();
        PairingPayload {
            device_id: identity.device_id,
            device_name: identity.device_name,
            public_key: identity.public_key,
            multiaddrs: identity.multiaddrs,
            timestamp: now_ms() / 1000,
            version: "1".into(),
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn scenario_1_pair_then_send_one_clip() {
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice-laptop", hub.clone()).await;
    let b = Device::spin_up("bob-phone", hub.clone()).await;

    // A encodes a pairing payload; B decodes it and sends a trust-request to A.
    let payload = a.pairing_payload();
    let encoded = payload.encode();
    let decoded = PairingPayload::decode(&encoded).unwrap();

    let a_device = TrustedDevice {
        device_id: decoded.device_id.clone(),
        device_name: decoded.device_name.clone(),
        public_key: decoded.public_key.clone(),
        multiaddrs: decoded.multiaddrs.clone(),
        created_at: now_ms(),
        last_seen: None,
    };

    let approved = Arc::new(Mutex::new(false));
    let approved2 = approved.clone();
    a.trust.on(TrustEvent::Approved, Box::new(move |_| *approved2.lock().unwrap() = true));

    b.trust.send_trust_request(&a_device).await.unwrap();
    settle().await;

    // A should have seen the request and auto-approve it here (as the "user").
    let pending = a.trust.pending();
    assert_eq!(pending.len(), 1);
    a.trust.send_trust_ack(&b.id, true).await.unwrap();
    settle().await;

    assert!(a.trust.is_trusted(&b.id));
    assert!(b.trust.is_trusted(&a.id));
    assert!(*approved.lock().unwrap());

    // A broadcasts a clip; B's history should contain exactly that clip.
    a.clipboard.process_local_text("hello");
    settle().await;

    let items = b.history.query(&HistoryQuery::default());
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].clip.content, "hello");
    assert_eq!(b.clipboard.current_text().as_deref(), Some("hello"));
}

#[tokio::test]
async fn scenario_2_replay_beyond_skew_is_rejected() {
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;

    // Capture a validly-signed request at t0, then replay it far outside
    // the freshness window — the signature stays valid, only the clock
    // skew check should reject it.
    let remote = b.identity.get().unwrap();
    let payload = remote.public_view();
    let t0 = now_ms();
    let signing_bytes = trust_request_signing_bytes(&b.id, &a.id, &payload, t0).unwrap();
    let sig = remote.sign(&signing_bytes).unwrap();
    let replayed = SyncMessage::TrustRequest { from: b.id.clone(), to: a.id.clone(), payload, sent_at: t0 - 600_000, sig };

    a.trust.handle_trust_message(replayed).await.unwrap();
    assert!(a.trust.pending().is_empty());
}

#[tokio::test]
async fn scenario_3_pending_request_sits_untrusted_until_acked() {
    // The literal 10-minute TTL expiry (pending -> rejected, no trust-ack
    // sent) is exercised directly against the pending map in
    // `trust::tests::expired_pending_request_is_rejected_and_emits_event`,
    // since waiting out PENDING_TTL_MS for real isn't practical here. This
    // scenario covers the reachable half from outside the crate: a fresh
    // request stays pending and untrusted until the user acks it.
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;

    let remote_id = b.identity.get().unwrap();
    let remote_payload = remote_id.public_view();
    let sent_at = now_ms();
    let signing_bytes = trust_request_signing_bytes(&b.id, &a.id, &remote_payload, sent_at).unwrap();
    let sig = remote_id.sign(&signing_bytes).unwrap();
    let msg = SyncMessage::TrustRequest { from: b.id.clone(), to: a.id.clone(), payload: remote_payload, sent_at, sig };
    a.trust.handle_trust_message(msg).await.unwrap();

    assert_eq!(a.trust.pending().len(), 1);
    assert!(!a.trust.is_trusted(&b.id));
}

#[tokio::test]
async fn scenario_4_echo_suppression_does_not_rebroadcast() {
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;
    trust_each_other(&a, &b).await;

    a.clipboard.process_local_text("abc");
    settle().await;
    assert_eq!(b.clipboard.current_text().as_deref(), Some("abc"));

    // B's OS-level clipboard poll re-observes the same text it just wrote
    // remotely; this must not be treated as a new local clip.
    let broadcast_count_before = b.transport.get_connected_peers().await.len();
    b.clipboard.process_local_text("abc");
    settle().await;

    let items = a.history.query(&HistoryQuery::default());
    assert_eq!(items.len(), 1, "B must not have rebroadcast the echoed clip back to A");
    assert_eq!(b.transport.get_connected_peers().await.len(), broadcast_count_before);
}

#[tokio::test]
async fn scenario_5_catch_up_sync_on_approval() {
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;

    for i in 0..250 {
        a.history
            .add(
                openclipboard_core::protocol::Clip {
                    id: format!("c{i}"),
                    kind: openclipboard_core::protocol::ClipKind::Text,
                    content: "x".repeat(50),
                    timestamp: now_ms(),
                    sender_id: a.id.clone(),
                    expires_at: None,
                },
                a.id.clone(),
                true,
            )
            .unwrap();
    }

    trust_each_other(&a, &b).await;
    settle().await;
    settle().await;

    let items = b.history.query(&HistoryQuery::default());
    assert_eq!(items.len(), 250);

    // Re-approving is idempotent in-process: resending produces the same set.
    a.history_sync.on_peer_approved(&b.id).await;
    settle().await;
    assert_eq!(b.history.query(&HistoryQuery::default()).len(), 250);
}

#[tokio::test]
async fn scenario_6_burst_of_duplicate_clips_applied_once() {
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;
    trust_each_other(&a, &b).await;

    let applied = Arc::new(Mutex::new(0));
    let applied2 = applied.clone();
    b.history.on_new(Box::new(move |_| *applied2.lock().unwrap() += 1));

    let clip = openclipboard_core::protocol::Clip {
        id: "c2".into(),
        kind: openclipboard_core::protocol::ClipKind::Text,
        content: "burst".into(),
        timestamp: now_ms(),
        sender_id: a.id.clone(),
        expires_at: None,
    };
    let msg = SyncMessage::Clip { from: a.id.clone(), clip, sent_at: now_ms() };
    let bytes = openclipboard_core::protocol::encode_body(&msg).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let transport = a.transport.clone();
        let target = b.id.clone();
        let bytes = bytes.clone();
        handles.push(tokio::spawn(async move {
            transport.send(openclipboard_core::protocol::CLIP_PROTOCOL, &target, bytes).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    settle().await;

    assert_eq!(*applied.lock().unwrap(), 1);
    assert_eq!(b.clipboard.current_text().as_deref(), Some("burst"));
}

#[tokio::test]
async fn untrusted_connected_peer_never_receives_broadcast() {
    // `c` becomes "connected" to `a` at the transport level (any protocol,
    // any bytes, even garbage) without ever being trusted, the way an
    // unsigned/rejected trust-request sender would. A trusted-only CLIP
    // broadcast from `a` must still skip `c`.
    let hub = MemoryHub::new();
    let a = Device::spin_up("alice", hub.clone()).await;
    let b = Device::spin_up("bob", hub.clone()).await;
    let c = Device::spin_up("carol", hub.clone()).await;
    trust_each_other(&a, &b).await;

    c.transport.send(CLIP_PROTOCOL, &a.id, vec![0xFF, 0x00, 0xFF]).await.unwrap();
    settle().await;
    assert!(a.transport.get_connected_peers().await.contains(&c.id));
    assert!(!a.trust.is_trusted(&c.id));

    a.clipboard.process_local_text("secret");
    settle().await;

    assert_eq!(b.history.query(&HistoryQuery::default()).len(), 1);
    assert!(c.history.query(&HistoryQuery::default()).is_empty());
    assert!(c.clipboard.current_text().is_none());
}

async fn trust_each_other(a: &Device, b: &Device) {
    let a_device = TrustedDevice {
        device_id: a.id.clone(),
        device_name: "alice".into(),
        public_key: a.identity.get().unwrap().public_key,
        multiaddrs: a.identity.get().unwrap().multiaddrs,
        created_at: now_ms(),
        last_seen: None,
    };
    b.trust.send_trust_request(&a_device).await.unwrap();
    settle().await;
    a.trust.send_trust_ack(&b.id, true).await.unwrap();
    settle().await;
}
