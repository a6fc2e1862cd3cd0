//! Clipboard IO (§4.7): external interface plus a runnable reference
//! implementation, generalizing the teacher's `ClipboardProvider`/
//! `MockClipboard` (`clipboard.rs`) from a raw read/write abstraction to the
//! spec's normalize-on-change contract with echo suppression.

use crate::error::Result;
use crate::identity::now_ms;
use crate::protocol::{Clip, ClipKind};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const THIRTY_DAYS_MS: i64 = 30 * 24 * 60 * 60 * 1000;

type LocalClipCallback = Box<dyn Fn(Clip) + Send + Sync>;

#[async_trait]
pub trait ClipboardIo: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn on_local_clip(&self, cb: LocalClipCallback);
    /// Writes a remote clip's content into the clipboard. MUST be
    /// idempotent per clip id and MUST NOT re-trigger local-change
    /// detection for the written content.
    fn write_remote_clip(&self, clip: &Clip);
    /// Feeds externally observed clipboard text through normalization and
    /// (if it produces a clip) the `on_local_clip` callbacks.
    fn process_local_text(&self, text: &str);
}

/// Strips control characters and trims, classifies the result, and assigns
/// id/timestamp/sender_id. Returns `None` for empty input (no clip emitted).
pub fn normalize_local_text(text: &str, sender_id: &str) -> Option<Clip> {
    let cleaned: String = text.chars().filter(|c| !c.is_control() || *c == '\n' || *c == '\t').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    let now = now_ms();
    let id = Uuid::new_v4().to_string();

    if let Some(rest) = strip_data_uri_prefix(cleaned, "data:image/png;base64,")
        .or_else(|| strip_data_uri_prefix(cleaned, "data:image/jpeg;base64,"))
    {
        return Some(Clip {
            id,
            kind: ClipKind::Image,
            content: rest.to_string(),
            timestamp: now,
            sender_id: sender_id.to_string(),
            expires_at: Some(now + THIRTY_DAYS_MS),
        });
    }

    if let Some(rest) = strip_generic_data_uri(cleaned) {
        return Some(Clip {
            id,
            kind: ClipKind::File,
            content: rest.to_string(),
            timestamp: now,
            sender_id: sender_id.to_string(),
            expires_at: Some(now + THIRTY_DAYS_MS),
        });
    }

    if is_http_url(cleaned) {
        return Some(Clip { id, kind: ClipKind::Url, content: cleaned.to_string(), timestamp: now, sender_id: sender_id.to_string(), expires_at: None });
    }

    Some(Clip { id, kind: ClipKind::Text, content: cleaned.to_string(), timestamp: now, sender_id: sender_id.to_string(), expires_at: None })
}

fn strip_data_uri_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.strip_prefix(prefix)
}

fn strip_generic_data_uri(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("data:")?;
    let (_mime, payload) = rest.split_once(";base64,")?;
    Some(payload)
}

fn is_http_url(text: &str) -> bool {
    (text.starts_with("http://") || text.starts_with("https://")) && !text.contains(char::is_whitespace)
}

fn fnv1a_hash(text: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    text.bytes().fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

/// Manual-mode clipboard (spec §4.7): no polling, host drives changes via
/// `process_local_text`. Generalizes the teacher's `MockClipboard`
/// read/write/on_change shape to the spec's normalize-then-emit contract.
pub struct ManualClipboard {
    device_id: String,
    current: Mutex<Option<String>>,
    last_remote_hash: Mutex<Option<u64>>,
    listeners: Mutex<Vec<LocalClipCallback>>,
}

impl ManualClipboard {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            current: Mutex::new(None),
            last_remote_hash: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn current_text(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClipboardIo for ManualClipboard {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn on_local_clip(&self, cb: LocalClipCallback) {
        self.listeners.lock().unwrap().push(cb);
    }

    fn write_remote_clip(&self, clip: &Clip) {
        if !matches!(clip.kind, ClipKind::Text | ClipKind::Url) {
            return;
        }
        *self.current.lock().unwrap() = Some(clip.content.clone());
        *self.last_remote_hash.lock().unwrap() = Some(fnv1a_hash(&clip.content));
    }

    fn process_local_text(&self, text: &str) {
        let hash = fnv1a_hash(text);
        {
            let mut last_remote = self.last_remote_hash.lock().unwrap();
            if *last_remote == Some(hash) {
                *last_remote = None;
                *self.current.lock().unwrap() = Some(text.to_string());
                return;
            }
        }
        *self.current.lock().unwrap() = Some(text.to_string());

        let Some(clip) = normalize_local_text(text, &self.device_id) else { return };
        if !matches!(clip.kind, ClipKind::Text | ClipKind::Url) {
            return;
        }
        for cb in self.listeners.lock().unwrap().iter() {
            cb(clip.clone());
        }
    }
}

/// Capability an OS clipboard backend plugs into: a single text read. No
/// implementation is provided (OS clipboard access is the out-of-scope
/// `ClipboardIO` collaborator).
pub trait RawClipboardRead: Send + Sync {
    fn read_text(&self) -> Option<String>;
}

/// Polling-mode driver (spec §4.7): every `poll_interval_ms` reads through
/// `P`, hashes with FNV-1a, and on change runs the same normalize/emit path
/// as [`ManualClipboard::process_local_text`]. `poll_interval_ms == 0`
/// disables polling.
pub struct PollingDriver<P: RawClipboardRead + 'static> {
    inner: ManualClipboard,
    reader: std::sync::Arc<P>,
    poll_interval_ms: u64,
    last_hash: Mutex<Option<u64>>,
    stop_tx: tokio::sync::watch::Sender<bool>,
    stop_rx: tokio::sync::watch::Receiver<bool>,
}

impl<P: RawClipboardRead + 'static> PollingDriver<P> {
    pub fn new(device_id: impl Into<String>, reader: P, poll_interval_ms: u64) -> std::sync::Arc<Self> {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        std::sync::Arc::new(Self {
            inner: ManualClipboard::new(device_id),
            reader: std::sync::Arc::new(reader),
            poll_interval_ms,
            last_hash: Mutex::new(None),
            stop_tx,
            stop_rx,
        })
    }

    fn poll_once(&self) {
        let Some(text) = self.reader.read_text() else { return };
        let hash = fnv1a_hash(&text);
        if *self.last_hash.lock().unwrap() == Some(hash) {
            return;
        }
        *self.last_hash.lock().unwrap() = Some(hash);
        self.inner.process_local_text(&text);
    }
}

#[async_trait]
impl<P: RawClipboardRead + 'static> ClipboardIo for std::sync::Arc<PollingDriver<P>> {
    async fn start(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Ok(());
        }
        let this = self.clone();
        let mut stop_rx = self.stop_rx.clone();
        let interval = Duration::from_millis(self.poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => this.poll_once(),
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    fn on_local_clip(&self, cb: LocalClipCallback) {
        self.inner.on_local_clip(cb);
    }

    fn write_remote_clip(&self, clip: &Clip) {
        self.inner.write_remote_clip(clip);
        *self.last_hash.lock().unwrap() = Some(fnv1a_hash(&clip.content));
    }

    fn process_local_text(&self, text: &str) {
        self.inner.process_local_text(text);
    }
}
