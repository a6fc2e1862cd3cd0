//! Device identity service (C2).

use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::trust::TrustedDevice;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

const IDENTITY_KEY: &str = "localDeviceIdentity";

/// Local device identity. `private_key` never leaves the device and is
/// never serialized onto the wire — only [`DeviceIdentity::public_view`]
/// (a [`TrustedDevice`]) is ever shared with peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub multiaddrs: Vec<String>,
    pub created_at: i64,
}

impl DeviceIdentity {
    pub fn public_view(&self) -> TrustedDevice {
        TrustedDevice {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            public_key: self.public_key.clone(),
            multiaddrs: self.multiaddrs.clone(),
            created_at: self.created_at,
            last_seen: None,
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes: [u8; 32] = self
            .private_key
            .clone()
            .try_into()
            .map_err(|_| Error::IdentityUnavailable("malformed private key".into()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.signing_key()?;
        Ok(key.sign(data).to_bytes().to_vec())
    }
}

/// Derive the canonical `device_id` from raw Ed25519 public key bytes.
///
/// SHA-256 of the key, hex-encoded. Stable across restarts for the same
/// key pair; implementation-defined beyond that, per spec.
pub fn device_id_from_public_key(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(digest)
}

/// Verify `signature` over `data` against a raw Ed25519 public key.
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else { return false };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else { return false };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else { return false };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(data, &signature).is_ok()
}

/// Produces, persists, and rehydrates the local device identity.
pub struct IdentityService<S: KvStore> {
    store: S,
    cached: Mutex<Option<DeviceIdentity>>,
}

impl<S: KvStore> IdentityService<S> {
    pub fn new(store: S) -> Self {
        Self { store, cached: Mutex::new(None) }
    }

    /// Returns the cached identity, loading/generating it on first call.
    pub fn get(&self) -> Result<DeviceIdentity> {
        if let Some(id) = self.cached.lock().unwrap().clone() {
            return Ok(id);
        }

        let loaded = self.load_or_generate()?;
        *self.cached.lock().unwrap() = Some(loaded.clone());
        Ok(loaded)
    }

    fn load_or_generate(&self) -> Result<DeviceIdentity> {
        let stored = self
            .store
            .get(IDENTITY_KEY)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(raw) = stored else {
            return self.generate_and_persist();
        };

        let mut identity: DeviceIdentity = match serde_json::from_str(&raw) {
            Ok(i) => i,
            Err(_) => return self.generate_and_persist(),
        };

        if identity.private_key.is_empty() {
            return self.generate_and_persist();
        }

        // The private key wins if the stored public key disagrees with it.
        let signing_key = identity.signing_key()?;
        let derived_public = signing_key.verifying_key().to_bytes().to_vec();
        if derived_public != identity.public_key {
            tracing::debug!(device_id = %identity.device_id, "re-deriving public key from stored private key");
            identity.public_key = derived_public;
            identity.device_id = device_id_from_public_key(&identity.public_key);
            self.persist(&identity)?;
        }

        Ok(identity)
    }

    fn generate_and_persist(&self) -> Result<DeviceIdentity> {
        let signing_key = SigningKey::generate(&mut rand_core::OsRng);
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        let device_id = device_id_from_public_key(&public_key);

        let identity = DeviceIdentity {
            device_id,
            device_name: "unnamed device".to_string(),
            public_key,
            private_key: signing_key.to_bytes().to_vec(),
            multiaddrs: Vec::new(),
            created_at: now_ms(),
        };

        self.persist(&identity)?;
        Ok(identity)
    }

    fn persist(&self, identity: &DeviceIdentity) -> Result<()> {
        let json = serde_json::to_string(identity)?;
        self.store
            .set(IDENTITY_KEY, &json)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn rename(&self, name: &str) -> Result<DeviceIdentity> {
        let mut identity = self.get()?;
        identity.device_name = name.to_string();
        self.persist(&identity)?;
        *self.cached.lock().unwrap() = Some(identity.clone());
        tracing::debug!(device_id = %identity.device_id, "renamed device");
        Ok(identity)
    }

    pub fn update_multiaddrs(&self, multiaddrs: Vec<String>) -> Result<DeviceIdentity> {
        let mut identity = self.get()?;
        identity.multiaddrs = multiaddrs;
        self.persist(&identity)?;
        *self.cached.lock().unwrap() = Some(identity.clone());
        tracing::debug!(device_id = %identity.device_id, "updated multiaddrs");
        Ok(identity)
    }

    pub fn public_view(&self) -> Result<TrustedDevice> {
        Ok(self.get()?.public_view())
    }
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[test]
    fn device_id_stable_across_restarts() {
        let store = MemoryKvStore::new();
        let svc = IdentityService::new(store);
        let a = svc.get().unwrap();
        let b = svc.get().unwrap();
        assert_eq!(a.device_id, b.device_id);
    }

    #[test]
    fn device_id_rehydrates_from_private_key() {
        let store = MemoryKvStore::new();
        let first_id = {
            let svc = IdentityService::new(store);
            svc.get().unwrap()
        };

        // Simulate a fresh process loading the same persisted store.
        let store2 = MemoryKvStore::new();
        KvStore::set(&store2, IDENTITY_KEY, &serde_json::to_string(&first_id).unwrap()).unwrap();
        let svc2 = IdentityService::new(store2);
        let rehydrated = svc2.get().unwrap();
        assert_eq!(rehydrated.device_id, first_id.device_id);
    }

    #[test]
    fn distinct_keys_yield_distinct_ids() {
        let a = IdentityService::new(MemoryKvStore::new()).get().unwrap();
        let b = IdentityService::new(MemoryKvStore::new()).get().unwrap();
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn stored_public_key_mismatch_is_corrected_from_private_key() {
        let store = MemoryKvStore::new();
        let svc = IdentityService::new(store);
        let mut identity = svc.get().unwrap();
        let real_public = identity.public_key.clone();

        // Corrupt the stored public key but keep the private key intact.
        identity.public_key = vec![0u8; 32];
        svc.persist(&identity).unwrap();
        *svc.cached.lock().unwrap() = None;

        let fixed = svc.get().unwrap();
        assert_eq!(fixed.public_key, real_public);
        assert_eq!(fixed.device_id, device_id_from_public_key(&real_public));
    }

    #[test]
    fn rename_preserves_keys() {
        let svc = IdentityService::new(MemoryKvStore::new());
        let before = svc.get().unwrap();
        let after = svc.rename("Alice's Laptop").unwrap();
        assert_eq!(after.device_name, "Alice's Laptop");
        assert_eq!(after.device_id, before.device_id);
        assert_eq!(after.private_key, before.private_key);
    }

    #[test]
    fn update_multiaddrs_replaces_list() {
        let svc = IdentityService::new(MemoryKvStore::new());
        svc.get().unwrap();
        let after = svc
            .update_multiaddrs(vec!["/ip4/1.2.3.4/tcp/9/p2p/x".into()])
            .unwrap();
        assert_eq!(after.multiaddrs.len(), 1);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let svc = IdentityService::new(MemoryKvStore::new());
        let identity = svc.get().unwrap();
        let sig = identity.sign(b"hello").unwrap();
        assert!(verify_signature(&identity.public_key, b"hello", &sig));
        assert!(!verify_signature(&identity.public_key, b"tampered", &sig));
    }

    #[test]
    fn public_view_strips_private_key() {
        let svc = IdentityService::new(MemoryKvStore::new());
        let identity = svc.get().unwrap();
        let view = identity.public_view();
        assert_eq!(view.device_id, identity.device_id);
        assert_eq!(view.public_key, identity.public_key);
    }
}
