//! Channel-partitioned relay.
//!
//! Every connection is bound to one numeric channel when it connects. Anything
//! a connection sends is forwarded verbatim to the other open connections on
//! the same channel and to nobody else. Payloads are never inspected.

pub mod registry;
pub mod server;

pub use registry::{Channel, ChannelRegistry, ConnectionId, PeerState, DEFAULT_CHANNEL};
pub use server::BroadcastHub;

/// Default per-connection outbound queue length
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Path consumers connect to; the channel travels in the `ch` query parameter
pub const OVERLAY_PATH: &str = "/overlay";

/// One relayed message, text or binary as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Channel from a query string such as `ch=2&x=y`; 0 when absent or invalid
pub fn parse_channel(query: Option<&str>) -> Channel {
    query
        .and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "ch")
                .map(|(_, value)| value)
        })
        .and_then(|value| value.trim().parse::<Channel>().ok())
        .unwrap_or(DEFAULT_CHANNEL)
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Hub not started")]
    NotStarted,

    #[error("Hub already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, HubError>;
