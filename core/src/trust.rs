//! Trust manager (C6): trusted-peer set, pending-request lifecycle, pairing
//! state machine, domain events. Ownership shape follows the teacher's
//! `MemoryTrustStore`/`FileTrustStore` split into `trusted`/`pending` maps.

use crate::error::{Error, Result};
use crate::identity::{device_id_from_public_key, now_ms, verify_signature, IdentityService};
use crate::protocol::{trust_request_signing_bytes, SyncMessage, TrustAckPayload, TrustRequestPayload};
use crate::store::KvStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const PENDING_TTL_MS: i64 = 10 * 60 * 1000;
const SKEW_BOUND_MS: i64 = 300 * 1000;

/// A peer's published identity, as carried in pairing payloads and
/// trust-request/ack envelopes. Private key MUST be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedDevice {
    pub device_id: String,
    pub device_name: String,
    pub public_key: Vec<u8>,
    pub multiaddrs: Vec<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

impl TrustedDevice {
    fn multiaddrs_match_device_id(&self) -> bool {
        let suffix = format!("/p2p/{}", self.device_id);
        self.multiaddrs.iter().all(|a| a.ends_with(&suffix))
    }
}

fn load_trusted(store: &dyn KvStore) -> HashMap<String, TrustedDevice> {
    let Ok(Some(raw)) = store.get(TRUSTED_DEVICES_KEY) else { return HashMap::new() };
    let Ok(devices) = serde_json::from_str::<Vec<TrustedDevice>>(&raw) else { return HashMap::new() };
    devices.into_iter().map(|d| (d.device_id.clone(), d)).collect()
}

#[derive(Debug, Clone)]
pub struct PendingTrustRequest {
    pub request: TrustRequestPayload,
    pub received_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustEvent {
    Request,
    Approved,
    Rejected,
    Removed,
}

/// Sends a trust message to a target (multiaddr, or peer id of an already
/// connected peer). Bound into the manager once a real messenger exists;
/// `send_trust_request`/`send_trust_ack` are no-ops until then.
#[async_trait]
pub trait TrustMessenger: Send + Sync {
    async fn send(&self, target: &TrustedDevice, msg: SyncMessage) -> Result<()>;
}

type Listener = Box<dyn Fn(TrustedDevice) + Send + Sync>;

const TRUSTED_DEVICES_KEY: &str = "trustedDevices";

pub struct TrustManager<S: KvStore> {
    identity: Arc<IdentityService<S>>,
    store: Box<dyn KvStore>,
    trusted: Mutex<HashMap<String, TrustedDevice>>,
    pending: Mutex<HashMap<String, PendingTrustRequest>>,
    /// One single-shot expiry task per pending entry, keyed by device_id.
    /// Aborted on approve/reject/ack-send/duplicate-reset/`stop`, per the
    /// "cancellation on transition is mandatory" timer contract.
    pending_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    messenger: Mutex<Option<Arc<dyn TrustMessenger>>>,
    listeners: Mutex<HashMap<TrustEvent, Vec<Listener>>>,
    self_weak: Mutex<Weak<TrustManager<S>>>,
}

impl<S: KvStore + 'static> TrustManager<S> {
    /// `store` persists the `trustedDevices` array (spec's persisted state
    /// layout); it may be the same physical store as the identity's or a
    /// separate one, mirroring the teacher's separate identity/trust files.
    pub fn new(identity: Arc<IdentityService<S>>, store: impl KvStore + 'static) -> Arc<Self> {
        let trusted = load_trusted(&store);
        let manager = Arc::new(Self {
            identity,
            store: Box::new(store),
            trusted: Mutex::new(trusted),
            pending: Mutex::new(HashMap::new()),
            pending_timers: Mutex::new(HashMap::new()),
            messenger: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            self_weak: Mutex::new(Weak::new()),
        });
        *manager.self_weak.lock().unwrap() = Arc::downgrade(&manager);
        manager
    }

    /// Cancels every outstanding pending-request timer. Does not otherwise
    /// touch trusted/pending state; callers that tear down a `TrustManager`
    /// (e.g. the `serve` loop) call this alongside stopping the transport.
    pub fn stop(&self) {
        for (_, handle) in self.pending_timers.lock().unwrap().drain() {
            handle.abort();
        }
    }

    /// Spawns the single-shot expiry task for a freshly-inserted pending
    /// request, aborting any prior timer for the same `device_id` first (a
    /// duplicate request resets the timer).
    fn arm_pending_timer(&self, device_id: &str, expires_at: i64) {
        let mut timers = self.pending_timers.lock().unwrap();
        if let Some(old) = timers.remove(device_id) {
            old.abort();
        }

        let weak = self.self_weak.lock().unwrap().clone();
        let key = device_id.to_string();
        let task_device_id = key.clone();
        let delay = Duration::from_millis((expires_at - now_ms()).max(0) as u64);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.expire_pending(&task_device_id);
            }
        });
        timers.insert(key, handle);
    }

    /// Removes `device_id`'s pending entry if it is still present and emits
    /// `Rejected`. A no-op if the entry was already removed by an ack or a
    /// prior expiry (guards against the lazy `prune_expired_pending` sweep
    /// and the active timer racing each other).
    fn expire_pending(&self, device_id: &str) {
        let removed = self.pending.lock().unwrap().remove(device_id);
        self.pending_timers.lock().unwrap().remove(device_id);
        if let Some(p) = removed {
            self.emit(TrustEvent::Rejected, p.request.payload);
        }
    }

    fn persist_trusted(&self) {
        let devices: Vec<TrustedDevice> = self.trusted.lock().unwrap().values().cloned().collect();
        let Ok(json) = serde_json::to_string(&devices) else { return };
        if let Err(err) = self.store.set(TRUSTED_DEVICES_KEY, &json) {
            tracing::warn!(%err, "failed to persist trusted devices");
        }
    }

    pub fn bind_messenger(&self, messenger: Arc<dyn TrustMessenger>) {
        *self.messenger.lock().unwrap() = Some(messenger);
    }

    pub fn on(&self, event: TrustEvent, cb: Listener) {
        self.listeners.lock().unwrap().entry(event).or_default().push(cb);
    }

    fn emit(&self, event: TrustEvent, device: TrustedDevice) {
        let listeners = self.listeners.lock().unwrap();
        if let Some(cbs) = listeners.get(&event) {
            for cb in cbs {
                cb(device.clone());
            }
        }
    }

    pub fn list(&self) -> Vec<TrustedDevice> {
        self.trusted.lock().unwrap().values().cloned().collect()
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.trusted.lock().unwrap().contains_key(device_id)
    }

    pub fn pending(&self) -> Vec<PendingTrustRequest> {
        self.prune_expired_pending();
        self.pending.lock().unwrap().values().cloned().collect()
    }

    pub fn remove(&self, device_id: &str) {
        let removed = self.trusted.lock().unwrap().remove(device_id);
        if let Some(device) = removed {
            self.persist_trusted();
            self.emit(TrustEvent::Removed, device);
        }
    }

    /// Lazy backstop for the active per-entry timers in [`Self::arm_pending_timer`]
    /// (e.g. if the process was paused/suspended past a wake timer). Safe to
    /// call redundantly — `expire_pending` no-ops on an already-removed id.
    fn prune_expired_pending(&self) {
        let now = now_ms();
        let expired_ids: Vec<String> = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired_ids {
            self.expire_pending(&id);
        }
    }

    /// Builds, signs, and sends a `trust-request` to `device`. Silently
    /// no-ops if no messenger has been bound.
    pub async fn send_trust_request(&self, device: &TrustedDevice) -> Result<()> {
        let Some(messenger) = self.messenger.lock().unwrap().clone() else {
            return Ok(());
        };

        let local = self.identity.get()?;
        let payload = local.public_view();
        let sent_at = now_ms();
        let signing_bytes = trust_request_signing_bytes(&local.device_id, &device.device_id, &payload, sent_at)?;
        let sig = local.sign(&signing_bytes)?;

        let msg = SyncMessage::TrustRequest {
            from: local.device_id.clone(),
            to: device.device_id.clone(),
            payload,
            sent_at,
            sig,
        };
        messenger.send(device, msg).await
    }

    /// User-driven approve/reject of a pending request from `device_id`.
    pub async fn send_trust_ack(&self, device_id: &str, accepted: bool) -> Result<()> {
        let request = self
            .pending
            .lock()
            .unwrap()
            .remove(device_id)
            .ok_or_else(|| Error::InvalidMessage(format!("no pending trust request from {device_id}")))?;

        if let Some(handle) = self.pending_timers.lock().unwrap().remove(device_id) {
            handle.abort();
        }

        if request.expires_at <= now_ms() {
            self.emit(TrustEvent::Rejected, request.request.payload);
            return Err(Error::InvalidMessage(format!("pending trust request from {device_id} has expired")));
        }

        let local = self.identity.get()?;
        let responder = local.public_view();
        let requester = TrustedDevice {
            device_id: request.request.payload.device_id.clone(),
            device_name: request.request.payload.device_name.clone(),
            public_key: request.request.payload.public_key.clone(),
            multiaddrs: request.request.payload.multiaddrs.clone(),
            created_at: request.request.payload.created_at,
            last_seen: Some(now_ms()),
        };

        let msg = SyncMessage::TrustAck {
            from: local.device_id.clone(),
            to: requester.device_id.clone(),
            payload: TrustAckPayload { accepted, request: request.request.clone(), responder: responder.clone() },
            sent_at: now_ms(),
        };

        let messenger = self.messenger.lock().unwrap().clone();
        if let Some(messenger) = messenger {
            messenger.send(&requester, msg).await?;
        }

        if accepted {
            self.trusted.lock().unwrap().insert(requester.device_id.clone(), requester.clone());
            self.persist_trusted();
            self.emit(TrustEvent::Approved, requester);
        } else {
            self.emit(TrustEvent::Rejected, requester);
        }
        Ok(())
    }

    /// Dispatches an inbound `trust-request`/`trust-ack`. Anything else is
    /// ignored. All validation failures are logged and dropped.
    pub async fn handle_trust_message(&self, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::TrustRequest { from, to, payload, sent_at, sig } => {
                self.handle_trust_request(from, to, payload, sent_at, sig).await
            }
            SyncMessage::TrustAck { from, to, payload, sent_at } => {
                self.handle_trust_ack(from, to, payload, sent_at)
            }
            _ => Ok(()),
        }
    }

    async fn handle_trust_request(
        &self,
        from: String,
        to: String,
        payload: TrustedDevice,
        sent_at: i64,
        sig: Vec<u8>,
    ) -> Result<()> {
        let local = self.identity.get()?;

        if payload.device_id != from {
            tracing::warn!(%from, "trust-request payload device_id mismatch");
            return Ok(());
        }
        if to != local.device_id {
            tracing::warn!(%from, "trust-request addressed to another device");
            return Ok(());
        }
        if (now_ms() - sent_at).abs() > SKEW_BOUND_MS {
            tracing::warn!(%from, "trust-request outside freshness window");
            return Ok(());
        }
        if !payload.multiaddrs_match_device_id() {
            tracing::warn!(%from, "trust-request multiaddr does not match device_id");
            return Ok(());
        }
        let Ok(signing_bytes) = trust_request_signing_bytes(&from, &to, &payload, sent_at) else {
            tracing::warn!(%from, "failed to canonicalize trust-request for verification");
            return Ok(());
        };
        if !verify_signature(&payload.public_key, &signing_bytes, &sig) {
            tracing::warn!(%from, "trust-request signature invalid");
            return Ok(());
        }
        if payload.device_id != device_id_from_public_key(&payload.public_key) {
            tracing::warn!(%from, "trust-request device_id does not match public key");
            return Ok(());
        }

        if self.is_trusted(&from) {
            let request = TrustRequestPayload { from: from.clone(), to, payload: payload.clone(), sent_at, sig };
            let ack = SyncMessage::TrustAck {
                from: local.device_id.clone(),
                to: from.clone(),
                payload: TrustAckPayload {
                    accepted: true,
                    request,
                    responder: local.public_view(),
                },
                sent_at: now_ms(),
            };
            let messenger = self.messenger.lock().unwrap().clone();
            if let Some(messenger) = messenger {
                messenger.send(&payload, ack).await?;
            }
            return Ok(());
        }

        let now = now_ms();
        let expires_at = now + PENDING_TTL_MS;
        let request = TrustRequestPayload { from: from.clone(), to, payload: payload.clone(), sent_at, sig };
        self.pending.lock().unwrap().insert(from.clone(), PendingTrustRequest { request, received_at: now, expires_at });
        self.arm_pending_timer(&from, expires_at);
        self.emit(TrustEvent::Request, payload);
        Ok(())
    }

    fn handle_trust_ack(&self, from: String, to: String, payload: TrustAckPayload, _sent_at: i64) -> Result<()> {
        let local = match self.identity.get() {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };

        if to != local.device_id {
            tracing::warn!(%from, "trust-ack addressed to another device");
            return Ok(());
        }
        if !payload.accepted {
            tracing::debug!(%from, "trust-ack declined by peer");
            return Ok(());
        }
        if payload.request.from != local.device_id || payload.request.to != from {
            tracing::warn!(%from, "trust-ack does not match an outstanding request");
            return Ok(());
        }
        if payload.responder.device_id != from {
            tracing::warn!(%from, "trust-ack responder device_id mismatch");
            return Ok(());
        }
        let Ok(signing_bytes) = trust_request_signing_bytes(
            &payload.request.from,
            &payload.request.to,
            &payload.request.payload,
            payload.request.sent_at,
        ) else {
            return Ok(());
        };
        if !verify_signature(&payload.request.payload.public_key, &signing_bytes, &payload.request.sig) {
            tracing::warn!(%from, "trust-ack embedded request signature invalid");
            return Ok(());
        }

        self.trusted.lock().unwrap().insert(from.clone(), payload.responder.clone());
        self.persist_trusted();
        self.emit(TrustEvent::Approved, payload.responder);
        Ok(())
    }
}
