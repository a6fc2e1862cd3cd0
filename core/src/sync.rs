//! Clipboard sync controller (C7): binds `ClipboardIo`, `ClipHistoryStore`,
//! and a clip `TrustedMessenger`. Echo suppression is delegated to
//! `ClipboardIo` (`[crate::clipboard]`); this controller owns the in-flight
//! dedup set, generalizing the teacher's `MemoryConnection`-style small
//! owned guard (`closed: Arc<AtomicBool>`) into an RAII `InFlightGuard`.

use crate::clipboard::ClipboardIo;
use crate::error::Result;
use crate::history::ClipHistoryStore;
use crate::identity::now_ms;
use crate::messenger::TrustedMessenger;
use crate::protocol::{Clip, ClipKind, SyncMessage};
use crate::store::HistoryBackend;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

pub struct ClipboardSyncController<C: ClipboardIo + 'static, B: HistoryBackend + 'static> {
    local_id: String,
    clipboard: Arc<C>,
    history: Arc<ClipHistoryStore<B>>,
    messenger: Mutex<Option<Arc<TrustedMessenger>>>,
    auto_sync: AtomicBool,
    in_flight: Arc<Mutex<HashSet<String>>>,
    running: AtomicBool,
}

impl<C: ClipboardIo + 'static, B: HistoryBackend + 'static> ClipboardSyncController<C, B> {
    pub fn new(local_id: impl Into<String>, clipboard: Arc<C>, history: Arc<ClipHistoryStore<B>>) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            clipboard,
            history,
            messenger: Mutex::new(None),
            auto_sync: AtomicBool::new(true),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            running: AtomicBool::new(false),
        })
    }

    pub fn bind_messaging(&self, messenger: Arc<TrustedMessenger>) {
        *self.messenger.lock().unwrap() = Some(messenger);
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.auto_sync.store(enabled, Ordering::SeqCst);
    }

    pub fn is_auto_sync(&self) -> bool {
        self.auto_sync.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let weak: Weak<Self> = Arc::downgrade(self);
        self.clipboard.on_local_clip(Box::new(move |clip| {
            let Some(controller) = weak.upgrade() else { return };
            tokio::spawn(async move { controller.handle_local_clip(clip).await });
        }));

        if let Some(messenger) = self.messenger.lock().unwrap().clone() {
            let weak: Weak<Self> = Arc::downgrade(self);
            messenger.on_message(Box::new(move |msg| {
                let Some(controller) = weak.upgrade() else { return };
                tokio::spawn(async move { controller.handle_clip_message(msg).await });
            }));
        }

        self.clipboard.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.in_flight.lock().unwrap().clear();
        self.clipboard.stop().await
    }

    async fn handle_local_clip(&self, clip: Clip) {
        if let Err(err) = self.history.add(clip.clone(), self.local_id.clone(), true) {
            tracing::warn!(clip_id = %clip.id, %err, "failed to store local clip");
        }

        if !self.auto_sync.load(Ordering::SeqCst) {
            return;
        }
        let Some(messenger) = self.messenger.lock().unwrap().clone() else { return };
        let msg = SyncMessage::Clip { from: self.local_id.clone(), clip, sent_at: now_ms() };
        messenger.broadcast(&msg).await;
    }

    async fn handle_clip_message(&self, msg: SyncMessage) {
        let SyncMessage::Clip { from, clip, .. } = msg else { return };

        if from == self.local_id {
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(clip.id.clone()) {
                return;
            }
        }
        let _guard = InFlightGuard { set: self.in_flight.clone(), id: clip.id.clone() };

        if self.history.get_by_id(&clip.id).is_some() {
            return;
        }

        if let Err(err) = self.history.add(clip.clone(), from.clone(), false) {
            tracing::warn!(clip_id = %clip.id, %err, "failed to store remote clip");
            return;
        }

        if matches!(clip.kind, ClipKind::Text | ClipKind::Url) {
            self.clipboard.write_remote_clip(&clip);
        }
    }
}
