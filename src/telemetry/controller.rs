use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::fields::{self, HISTORY_LIMIT};
use super::models::{DeviceStatePatch, Field, LinkPhase, SerialDeviceState, TelemetrySnapshot};
use super::publisher::SnapshotPublisher;
use super::throttle::{BroadcastGate, DEFAULT_THROTTLE_MS};
use super::{Result, TelemetryError};
use crate::serial::{
    SerialConnection, SerialConnectionConfig, SerialError, SerialOpener, Subscription,
};

/// Tunables for ingestion and snapshot broadcasting
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub throttle: Duration,
    pub history_limit: usize,
    /// Emit the latest state once the gate reopens after dropped attempts
    pub trailing_flush: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(DEFAULT_THROTTLE_MS),
            history_limit: HISTORY_LIMIT,
            trailing_flush: false,
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LiveLink {
    generation: u64,
    connection: Box<dyn SerialConnection>,
    subscriptions: Vec<Subscription>,
}

struct Shared {
    state: StdMutex<SerialDeviceState>,
    phase: StdMutex<LinkPhase>,
    gate: StdMutex<BroadcastGate>,
    // at most one live handle; also serializes open and close
    link: Mutex<Option<LiveLink>>,
    opener: Arc<dyn SerialOpener>,
    publisher: Arc<dyn SnapshotPublisher>,
    settings: TelemetrySettings,
    generation: AtomicU64,
    disposed: AtomicBool,
}

/// Owns the telemetry device: configuration, the live serial link, field
/// state and throttled snapshot publishing.
pub struct TelemetryController {
    shared: Arc<Shared>,
}

impl TelemetryController {
    pub fn new(
        opener: Arc<dyn SerialOpener>,
        publisher: Arc<dyn SnapshotPublisher>,
        config: SerialConnectionConfig,
        settings: TelemetrySettings,
    ) -> Self {
        let gate = BroadcastGate::new(settings.throttle);
        Self {
            shared: Arc::new(Shared {
                state: StdMutex::new(SerialDeviceState::new(config)),
                phase: StdMutex::new(LinkPhase::Closed),
                gate: StdMutex::new(gate),
                link: Mutex::new(None),
                opener,
                publisher,
                settings,
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn device_state(&self) -> SerialDeviceState {
        lock(&self.shared.state).clone()
    }

    pub fn phase(&self) -> LinkPhase {
        *lock(&self.shared.phase)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.state).is_open
    }

    /// Merge a partial configuration. Applies on the next open.
    pub fn update_device_state(&self, patch: DeviceStatePatch) -> Result<SerialDeviceState> {
        let mut state = lock(&self.shared.state);
        state.apply_patch(patch)?;
        if state.is_open {
            log::info!("Serial settings updated; they apply on the next open");
        }
        Ok(state.clone())
    }

    /// Name the field at `index`, growing the field list if needed.
    /// Indices past `fields::MAX_FIELD_INDEX` are rejected.
    pub fn set_field_key(&self, index: usize, key: Option<String>) -> Result<Vec<Field>> {
        let (fields, snapshot) = {
            let mut state = lock(&self.shared.state);
            fields::set_field_key(&mut state.current_fields, index, key)?;
            (state.current_fields.clone(), state.is_open.then(|| state.snapshot()))
        };
        if let Some(snapshot) = snapshot {
            self.shared.spawn_publish(snapshot);
        }
        Ok(fields)
    }

    /// Open the configured port. A no-op success while already open.
    pub async fn open_current_serial(&self) -> Result<()> {
        let mut link = self.shared.link.lock().await;
        Shared::open_locked(&self.shared, &mut link).await
    }

    /// Close the live port; a no-op when nothing is open
    pub async fn close_current_serial(&self) {
        let mut link = self.shared.link.lock().await;
        self.shared.close_locked(&mut link, None).await;
    }

    /// Close if open, otherwise open. Returns whether the port is now open.
    pub async fn try_toggle_open(&self) -> Result<bool> {
        let mut link = self.shared.link.lock().await;
        if link.is_some() {
            self.shared.close_locked(&mut link, None).await;
            Ok(false)
        } else {
            Shared::open_locked(&self.shared, &mut link).await?;
            Ok(true)
        }
    }

    /// `try_toggle_open` reduced to success/failure
    pub async fn toggle_open(&self) -> bool {
        match self.try_toggle_open().await {
            Ok(_) => true,
            Err(e) => {
                log::error!("Toggling serial device failed: {}", e);
                false
            }
        }
    }

    /// Close the link and refuse further opens
    pub async fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.close_current_serial().await;
        log::debug!("Telemetry controller disposed");
    }
}

impl Shared {
    async fn open_locked(this: &Arc<Self>, link: &mut Option<LiveLink>) -> Result<()> {
        if this.disposed.load(Ordering::SeqCst) {
            return Err(TelemetryError::Disposed);
        }
        if link.is_some() {
            return Ok(());
        }

        let config = lock(&this.state).config.clone();
        *lock(&this.phase) = LinkPhase::Opening;
        log::info!("Opening serial device {}", config);

        let mut connection = match this.opener.open(&config).await {
            Ok(connection) => connection,
            Err(e) => {
                *lock(&this.phase) = LinkPhase::Closed;
                log::error!("Failed to open {}: {}", config.path, e);
                return Err(e.into());
            }
        };

        // disposed while the open was in flight
        if this.disposed.load(Ordering::SeqCst) {
            if let Err(e) = connection.close().await {
                log::warn!("Closing abandoned serial handle failed: {}", e);
            }
            *lock(&this.phase) = LinkPhase::Closed;
            return Err(TelemetryError::Disposed);
        }

        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = {
            let mut state = lock(&this.state);
            state.reset_runtime();
            state.is_open = true;
            state.snapshot()
        };
        *lock(&this.phase) = LinkPhase::Open;

        let subscriptions = Self::attach(this, connection.as_ref(), generation);
        *link = Some(LiveLink {
            generation,
            connection,
            subscriptions,
        });

        log::info!("Serial device {} open", config.path);
        this.spawn_publish(snapshot);
        Ok(())
    }

    fn attach(
        this: &Arc<Self>,
        connection: &dyn SerialConnection,
        generation: u64,
    ) -> Vec<Subscription> {
        let weak: Weak<Self> = Arc::downgrade(this);

        let data_weak = weak.clone();
        let on_data = connection.on_data(Arc::new(move |line: &str| {
            if let Some(shared) = data_weak.upgrade() {
                shared.ingest_line(generation, line);
            }
        }));

        let error_weak = weak.clone();
        let on_error = connection.on_error(Arc::new(move |err: &SerialError| {
            log::warn!("Serial device error: {}", err);
            if let Some(shared) = error_weak.upgrade() {
                shared.schedule_teardown(generation);
            }
        }));

        let on_close = connection.on_close(Arc::new(move || {
            log::info!("Serial device closed by the driver");
            if let Some(shared) = weak.upgrade() {
                shared.schedule_teardown(generation);
            }
        }));

        vec![on_data, on_error, on_close]
    }

    fn schedule_teardown(self: &Arc<Self>, generation: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            let mut link = shared.link.lock().await;
            shared.close_locked(&mut link, Some(generation)).await;
        });
    }

    /// Tear the link down. With `expected` set, only the link of that
    /// generation is closed so stale driver events cannot kill a newer link.
    async fn close_locked(&self, link: &mut Option<LiveLink>, expected: Option<u64>) {
        let matches = match (link.as_ref(), expected) {
            (None, _) => false,
            (Some(live), Some(generation)) => live.generation == generation,
            (Some(_), None) => true,
        };
        if !matches {
            return;
        }
        let Some(mut live) = link.take() else {
            return;
        };

        for subscription in live.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        if let Err(e) = live.connection.close().await {
            log::warn!("Error while closing serial device: {}", e);
        }

        let snapshot = {
            let mut state = lock(&self.state);
            state.reset_runtime();
            state.snapshot()
        };
        *lock(&self.phase) = LinkPhase::Closed;
        log::info!("Serial device closed");

        self.spawn_publish(snapshot);
    }

    fn ingest_line(self: &Arc<Self>, generation: u64, line: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let snapshot = {
            let mut state = lock(&self.state);
            if !state.is_open {
                return;
            }
            state.ingest_line(line, self.settings.history_limit);
            state.snapshot()
        };
        self.broadcast_snapshot(snapshot);
    }

    /// Rate-gated broadcast; attempts inside the window are dropped
    fn broadcast_snapshot(self: &Arc<Self>, snapshot: TelemetrySnapshot) {
        let now = Instant::now();
        let mut gate = lock(&self.gate);
        if gate.try_pass(now) {
            drop(gate);
            self.spawn_publish(snapshot);
        } else if self.settings.trailing_flush && gate.arm_trailing() {
            let delay = gate.remaining(now);
            drop(gate);
            self.schedule_trailing_flush(delay);
        }
    }

    fn schedule_trailing_flush(self: &Arc<Self>, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut gate = lock(&shared.gate);
                // a regular pass already carried newer state
                if !gate.trailing_armed() {
                    return;
                }
                gate.force(Instant::now());
            }
            let snapshot = lock(&shared.state).snapshot();
            shared.spawn_publish(snapshot);
        });
    }

    fn spawn_publish(&self, snapshot: TelemetrySnapshot) {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            match publisher.publish(&snapshot).await {
                Ok(reached) => log::trace!("Snapshot delivered to {} channel(s)", reached),
                Err(e) => log::warn!("Snapshot broadcast failed: {}", e),
            }
        });
    }
}
