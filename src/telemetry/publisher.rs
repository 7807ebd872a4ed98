use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::models::TelemetrySnapshot;
use super::Result;
use crate::hub::{Channel, ChannelRegistry, Frame, HubError, OVERLAY_PATH};

/// Channels telemetry snapshots are delivered to
pub const TELEMETRY_CHANNELS: [Channel; 4] = [1, 2, 3, 4];

/// Delivers encoded snapshots to overlay consumers
#[async_trait::async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// Returns how many channels accepted the snapshot
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<usize>;
}

/// Publishes straight into a colocated hub's registry
pub struct HubPublisher {
    registry: Arc<ChannelRegistry>,
    channels: Vec<Channel>,
}

impl HubPublisher {
    pub fn new(registry: Arc<ChannelRegistry>, channels: Vec<Channel>) -> Self {
        Self { registry, channels }
    }
}

#[async_trait::async_trait]
impl SnapshotPublisher for HubPublisher {
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<usize> {
        let json = snapshot.to_json()?;
        let mut reached = 0;
        for channel in &self.channels {
            if self.registry.publish(*channel, Frame::Text(json.clone())).await > 0 {
                reached += 1;
            }
        }
        Ok(reached)
    }
}

/// Opens one short-lived hub connection per channel, sends, and closes it.
/// For hubs running in another process.
pub struct EphemeralSocketPublisher {
    base_url: String,
    channels: Vec<Channel>,
    connect_timeout: Duration,
}

impl EphemeralSocketPublisher {
    /// `authority` is `host:port` of the hub
    pub fn new(authority: &str, channels: Vec<Channel>, connect_timeout: Duration) -> Self {
        Self {
            base_url: format!("ws://{}{}", authority, OVERLAY_PATH),
            channels,
            connect_timeout,
        }
    }

    fn url_for(&self, channel: Channel) -> String {
        format!("{}?ch={}", self.base_url, channel)
    }

    async fn notify(&self, channel: Channel, json: &str) -> std::result::Result<(), HubError> {
        let url = self.url_for(channel);
        let (mut ws, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| HubError::ConnectTimeout(url.clone()))??;

        let sent = ws.send(Message::Text(json.to_string())).await;
        // the connection is closed whether or not the send went through
        let closed = ws.close(None).await;
        sent?;
        if let Err(e) = closed {
            log::debug!("Closing notify connection to {} failed: {}", url, e);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotPublisher for EphemeralSocketPublisher {
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<usize> {
        let json = snapshot.to_json()?;
        let mut reached = 0;
        let mut last_error = None;
        for channel in &self.channels {
            match self.notify(*channel, &json).await {
                Ok(()) => reached += 1,
                Err(e) => {
                    log::debug!("Snapshot notify on channel {} failed: {}", channel, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if reached == 0 && !self.channels.is_empty() => Err(e.into()),
            _ => Ok(reached),
        }
    }
}
