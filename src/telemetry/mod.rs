pub mod controller;
pub mod fields;
pub mod models;
pub mod publisher;
pub mod throttle;

pub use controller::{TelemetryController, TelemetrySettings};
pub use models::*;
pub use publisher::{EphemeralSocketPublisher, HubPublisher, SnapshotPublisher};
pub use throttle::BroadcastGate;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid device configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Controller has been disposed")]
    Disposed,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Relay error: {0}")]
    Relay(#[from] crate::hub::HubError),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
