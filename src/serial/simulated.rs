//! In-memory serial source used by tests and bench setups without hardware.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::events::LineSplitter;
use super::interface::{SerialConnection, SerialOpener};
use super::{Result, SerialConnectionConfig, SerialError, SerialEvents};

#[derive(Default)]
struct SimState {
    open_failure: Mutex<Option<String>>,
    active: Mutex<Option<Arc<SerialEvents>>>,
    splitter: Mutex<LineSplitter>,
    last_config: Mutex<Option<SerialConnectionConfig>>,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable serial device; clones share the same device
#[derive(Clone, Default)]
pub struct SimulatedSerial {
    state: Arc<SimState>,
}

impl SimulatedSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following open fail with `reason` until cleared with `None`
    pub fn set_open_failure(&self, reason: Option<&str>) {
        *guard(&self.state.open_failure) = reason.map(str::to_string);
    }

    fn active(&self) -> Option<Arc<SerialEvents>> {
        guard(&self.state.active).clone()
    }

    /// Deliver one complete line. Returns false when no connection is open.
    pub fn push_line(&self, line: &str) -> bool {
        match self.active() {
            Some(events) => {
                events.emit_data(line);
                true
            }
            None => false,
        }
    }

    /// Feed raw bytes through the same line splitting a physical port uses
    pub fn push_raw(&self, chunk: &[u8]) -> usize {
        let Some(events) = self.active() else {
            return 0;
        };
        let lines = guard(&self.state.splitter).push(chunk);
        for line in &lines {
            events.emit_data(line);
        }
        lines.len()
    }

    /// Report a driver error followed by a device-side close
    pub fn raise_error(&self, message: &str) {
        let taken = guard(&self.state.active).take();
        if let Some(events) = taken {
            events.emit_error(&SerialError::IoError(message.to_string()));
            events.emit_close();
        }
    }

    /// Simulate the device going away (cable pulled)
    pub fn disconnect(&self) {
        let taken = guard(&self.state.active).take();
        if let Some(events) = taken {
            events.emit_close();
        }
    }

    pub fn is_open(&self) -> bool {
        guard(&self.state.active).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.state.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<SerialConnectionConfig> {
        guard(&self.state.last_config).clone()
    }
}

#[async_trait::async_trait]
impl SerialOpener for SimulatedSerial {
    async fn open(&self, config: &SerialConnectionConfig) -> Result<Box<dyn SerialConnection>> {
        self.state.open_calls.fetch_add(1, Ordering::SeqCst);
        *guard(&self.state.last_config) = Some(config.clone());

        if let Some(reason) = guard(&self.state.open_failure).clone() {
            return Err(SerialError::ConnectionFailed(reason));
        }

        let events = SerialEvents::new();
        *guard(&self.state.active) = Some(events.clone());
        *guard(&self.state.splitter) = LineSplitter::new();
        log::debug!("Simulated serial opened as {}", config);

        Ok(Box::new(SimulatedConnection {
            events,
            state: self.state.clone(),
        }))
    }
}

struct SimulatedConnection {
    events: Arc<SerialEvents>,
    state: Arc<SimState>,
}

#[async_trait::async_trait]
impl SerialConnection for SimulatedConnection {
    fn events(&self) -> &Arc<SerialEvents> {
        &self.events
    }

    async fn close(&mut self) -> Result<()> {
        self.events.clear();
        let mut active = guard(&self.state.active);
        if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &self.events)) {
            *active = None;
        }
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
