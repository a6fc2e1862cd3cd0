//! Clip history store (C5): deduplicated, time-ordered record of local and
//! remote clips with retention, backed by a [`HistoryBackend`] the way the
//! teacher's `ClipboardHistory` wraps a bounded `Mutex<VecDeque<..>>` —
//! generalized here to keyed-by-id replace-on-readd instead of a FIFO ring.

use crate::error::Result;
use crate::protocol::{Clip, ClipKind};
use crate::store::HistoryBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub const RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub clip: Clip,
    pub received_from: String,
    pub synced_at: i64,
    pub is_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub kind: Option<ClipKind>,
    pub search: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

type NewClipListener = Box<dyn Fn(HistoryItem) + Send + Sync>;

pub struct ClipHistoryStore<B: HistoryBackend> {
    backend: B,
    items: Mutex<HashMap<String, HistoryItem>>,
    listeners: Mutex<Vec<NewClipListener>>,
}

impl<B: HistoryBackend> ClipHistoryStore<B> {
    pub fn new(backend: B) -> Result<Self> {
        let mut items = HashMap::new();
        for (id, raw) in backend.get_all()? {
            if let Ok(item) = serde_json::from_str::<HistoryItem>(&raw) {
                items.insert(id, item);
            }
        }
        Ok(Self { backend, items: Mutex::new(items), listeners: Mutex::new(Vec::new()) })
    }

    pub fn on_new(&self, cb: NewClipListener) {
        self.listeners.lock().unwrap().push(cb);
    }

    /// Inserts or replaces the item keyed by `clip.id`; emits `on_new`
    /// synchronously after the write is visible.
    pub fn add(&self, clip: Clip, received_from: impl Into<String>, is_local: bool) -> Result<()> {
        let item = HistoryItem { clip, received_from: received_from.into(), synced_at: crate::identity::now_ms(), is_local };
        self.backend.set(&item.clip.id, &serde_json::to_string(&item)?)?;
        self.items.lock().unwrap().insert(item.clip.id.clone(), item.clone());

        let listeners = self.listeners.lock().unwrap();
        for cb in listeners.iter() {
            cb(item.clone());
        }
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Option<HistoryItem> {
        self.items.lock().unwrap().get(id).cloned()
    }

    pub fn query(&self, q: &HistoryQuery) -> Vec<HistoryItem> {
        let items = self.items.lock().unwrap();
        let mut matched: Vec<HistoryItem> = items
            .values()
            .filter(|item| q.kind.is_none_or(|k| item.clip.kind == k))
            .filter(|item| q.since.is_none_or(|since| item.clip.timestamp >= since))
            .filter(|item| {
                q.search.as_ref().is_none_or(|needle| {
                    item.clip.content.to_lowercase().contains(&needle.to_lowercase())
                })
            })
            .cloned()
            .collect();

        matched.sort_by_key(|item| std::cmp::Reverse(item.clip.timestamp));
        if let Some(limit) = q.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Adds each clip only if not already present; never downgrades
    /// `is_local=true` to `false`.
    pub fn import_batch(&self, clips: Vec<Clip>) -> Result<()> {
        for clip in clips {
            if self.get_by_id(&clip.id).is_some() {
                continue;
            }
            self.add(clip, "import", false)?;
        }
        Ok(())
    }

    /// Removes items with `timestamp < now - RETENTION_MS` or an expired
    /// `expires_at`.
    pub fn prune_expired(&self) -> Result<()> {
        let now = crate::identity::now_ms();
        let cutoff = now - RETENTION_MS;
        let expired: Vec<String> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.clip.timestamp < cutoff || item.clip.expires_at.is_some_and(|e| e < now))
            .map(|item| item.clip.id.clone())
            .collect();

        for id in expired {
            self.remove(&id)?;
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.backend.remove(id)?;
        self.items.lock().unwrap().remove(id);
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        self.backend.clear_all()?;
        self.items.lock().unwrap().clear();
        Ok(())
    }
}
