//! History sync controller (C8): on peer approval, ships recent local clips
//! in bounded chunks over the HISTORY messenger. On inbound `sync-history`
//! from a trusted peer, imports the batch.

use crate::history::{ClipHistoryStore, HistoryQuery, RETENTION_MS};
use crate::identity::now_ms;
use crate::messenger::TrustedMessenger;
use crate::protocol::{Clip, SyncMessage};
use crate::store::HistoryBackend;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const MAX_CLIPS_PER_CHUNK: usize = 100;
const MAX_CHUNK_BYTES: usize = 500 * 1024;

pub struct HistorySyncController<B: HistoryBackend + 'static> {
    local_id: String,
    history: Arc<ClipHistoryStore<B>>,
    messenger: Arc<TrustedMessenger>,
    synced: Mutex<HashSet<String>>,
}

impl<B: HistoryBackend + 'static> HistorySyncController<B> {
    pub fn new(local_id: impl Into<String>, history: Arc<ClipHistoryStore<B>>, messenger: Arc<TrustedMessenger>) -> Arc<Self> {
        let controller = Arc::new(Self { local_id: local_id.into(), history, messenger, synced: Mutex::new(HashSet::new()) });

        let weak = Arc::downgrade(&controller);
        controller.messenger.on_message(Box::new(move |msg| {
            let Some(controller) = weak.upgrade() else { return };
            if let SyncMessage::HistorySync { payload, .. } = msg
                && let Err(err) = controller.history.import_batch(payload)
            {
                tracing::warn!(%err, "failed to import history batch");
            }
        }));

        controller
    }

    /// Call on a trust manager's `approved` event. No-ops if `device_id` has
    /// already been synced with during this process lifetime.
    pub async fn on_peer_approved(&self, device_id: &str) {
        if !self.synced.lock().unwrap().insert(device_id.to_string()) {
            return;
        }

        let since = now_ms() - RETENTION_MS;
        let clips: Vec<Clip> = self
            .history
            .query(&HistoryQuery { since: Some(since), ..Default::default() })
            .into_iter()
            .filter(|item| item.is_local)
            .map(|item| item.clip)
            .collect();

        for chunk in chunk_clips(clips) {
            let msg = SyncMessage::HistorySync { from: self.local_id.clone(), payload: chunk, sent_at: now_ms() };
            if let Err(err) = self.messenger.send(device_id, &msg).await {
                tracing::warn!(%device_id, %err, "history sync chunk dispatch failed");
            }
        }
    }
}

/// Splits `clips` into chunks of at most `MAX_CLIPS_PER_CHUNK` clips whose
/// serialized form is at most `MAX_CHUNK_BYTES`. Stops (does not error) if a
/// single remaining clip already exceeds the byte bound alone.
fn chunk_clips(clips: Vec<Clip>) -> Vec<Vec<Clip>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Clip> = Vec::new();
    let mut current_bytes = 0usize;

    for clip in clips {
        let clip_bytes = serde_json::to_vec(&clip).map(|b| b.len()).unwrap_or(0);
        if clip_bytes > MAX_CHUNK_BYTES {
            tracing::warn!(clip_id = %clip.id, "single clip exceeds chunk byte bound, skipping");
            continue;
        }

        let would_overflow = current.len() >= MAX_CLIPS_PER_CHUNK || current_bytes + clip_bytes > MAX_CHUNK_BYTES;
        if would_overflow {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += clip_bytes;
        current.push(clip);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::ProtocolMessenger;
    use crate::protocol::ClipKind;
    use crate::store::MemoryKvStore;
    use crate::transport::{MemoryHub, MemoryTransport, Transport};

    fn make_clip(id: &str, timestamp: i64) -> Clip {
        Clip { id: id.into(), kind: ClipKind::Text, content: "x".repeat(100), timestamp, sender_id: "a".into(), expires_at: None }
    }

    #[test]
    fn chunking_respects_clip_count_bound() {
        let clips: Vec<Clip> = (0..250).map(|i| make_clip(&format!("c{i}"), i as i64)).collect();
        let chunks = chunk_clips(clips);
        assert!(chunks.iter().all(|c| c.len() <= MAX_CLIPS_PER_CHUNK));
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 250);
    }

    #[test]
    fn chunking_respects_byte_bound() {
        let big_clip_count = 20;
        let clips: Vec<Clip> = (0..big_clip_count)
            .map(|i| Clip {
                id: format!("big{i}"),
                kind: ClipKind::Text,
                content: "y".repeat(30 * 1024),
                timestamp: i as i64,
                sender_id: "a".into(),
                expires_at: None,
            })
            .collect();
        let chunks = chunk_clips(clips);
        for chunk in &chunks {
            let bytes = serde_json::to_vec(chunk).unwrap().len();
            assert!(bytes <= MAX_CHUNK_BYTES);
        }
    }

    #[tokio::test]
    async fn catch_up_sync_delivers_all_local_clips_and_is_idempotent() {
        let hub = MemoryHub::new();

        let transport_a = MemoryTransport::new("a", hub.clone());
        transport_a.start().await.unwrap();
        let history_a = Arc::new(ClipHistoryStore::new(MemoryKvStore::new()).unwrap());
        for i in 0..250 {
            history_a.add(make_clip(&format!("c{i}"), now_ms()), "a", true).unwrap();
        }
        let raw_a = ProtocolMessenger::new("/clipboard/history/1.0.0", transport_a.clone());
        let messenger_a = TrustedMessenger::new(raw_a, |_| true);
        let controller_a = HistorySyncController::new("a", history_a, messenger_a);

        let transport_b = MemoryTransport::new("b", hub.clone());
        transport_b.start().await.unwrap();
        let history_b = Arc::new(ClipHistoryStore::new(MemoryKvStore::new()).unwrap());
        let raw_b = ProtocolMessenger::new("/clipboard/history/1.0.0", transport_b.clone());
        let messenger_b = TrustedMessenger::new(raw_b, |_| true);
        let _controller_b = HistorySyncController::new("b", history_b.clone(), messenger_b);

        transport_a.send("/clipboard/history/1.0.0", "b", vec![]).await.ok();

        controller_a.on_peer_approved("b").await;
        assert_eq!(history_b.query(&HistoryQuery::default()).len(), 250);

        // re-approving the same device id in this process is a no-op (dedup).
        controller_a.on_peer_approved("b").await;
        assert_eq!(history_b.query(&HistoryQuery::default()).len(), 250);
    }
}
