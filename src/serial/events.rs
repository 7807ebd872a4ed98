//! Listener registry shared by every serial connection implementation.
//!
//! A connection owns one [`SerialEvents`]; callers subscribe to data, error and
//! close notifications and get back a [`Subscription`] that removes exactly
//! that listener again.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::SerialError;

pub type DataListener = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&SerialError) + Send + Sync>;
pub type CloseListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by every subscribe call
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener this subscription was created for
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct ListenerList<L> {
    entries: Mutex<Vec<(u64, L)>>,
}

impl<L: Clone> ListenerList<L> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<(u64, L)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, id: u64, listener: L) {
        self.guard().push((id, listener));
    }

    fn remove(&self, id: u64) {
        self.guard().retain(|(entry_id, _)| *entry_id != id);
    }

    fn clear(&self) {
        self.guard().clear();
    }

    fn len(&self) -> usize {
        self.guard().len()
    }

    // Listeners run outside the lock so they may unsubscribe themselves.
    fn snapshot(&self) -> Vec<L> {
        self.guard().iter().map(|(_, l)| l.clone()).collect()
    }
}

/// Data, error and close listeners of one serial connection
pub struct SerialEvents {
    next_id: AtomicU64,
    data: ListenerList<DataListener>,
    error: ListenerList<ErrorListener>,
    close: ListenerList<CloseListener>,
}

impl SerialEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            data: ListenerList::new(),
            error: ListenerList::new(),
            close: ListenerList::new(),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_data(self: &Arc<Self>, listener: DataListener) -> Subscription {
        let id = self.next_id();
        self.data.add(id, listener);
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(events) = weak.upgrade() {
                events.data.remove(id);
            }
        })
    }

    pub fn on_error(self: &Arc<Self>, listener: ErrorListener) -> Subscription {
        let id = self.next_id();
        self.error.add(id, listener);
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(events) = weak.upgrade() {
                events.error.remove(id);
            }
        })
    }

    pub fn on_close(self: &Arc<Self>, listener: CloseListener) -> Subscription {
        let id = self.next_id();
        self.close.add(id, listener);
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(events) = weak.upgrade() {
                events.close.remove(id);
            }
        })
    }

    pub fn emit_data(&self, line: &str) {
        for listener in self.data.snapshot() {
            listener(line);
        }
    }

    pub fn emit_error(&self, error: &SerialError) {
        for listener in self.error.snapshot() {
            listener(error);
        }
    }

    pub fn emit_close(&self) {
        for listener in self.close.snapshot() {
            listener();
        }
    }

    /// Drop every registered listener
    pub fn clear(&self) {
        self.data.clear();
        self.error.clear();
        self.close.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.data.len() + self.error.len() + self.close.len()
    }
}

/// Longest run of bytes held while waiting for a `\n`
pub const MAX_PENDING_BYTES: usize = 4096;

/// Accumulates raw chunks and yields complete `\n`-terminated lines with any
/// trailing `\r` removed. A run of [`MAX_PENDING_BYTES`] or more without a
/// delimiter is flushed as one line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        if self.partial.len() >= MAX_PENDING_BYTES {
            log::warn!(
                "No line delimiter in {} bytes of serial input, flushing them as one line",
                self.partial.len()
            );
            let raw = std::mem::take(&mut self.partial);
            lines.push(decode_line(&raw));
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

/// Decode one delimited line, dropping the `\n` and a trailing `\r`
pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
