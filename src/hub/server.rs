use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use super::registry::{Channel, ChannelRegistry, DEFAULT_CHANNEL};
use super::{parse_channel, Frame, HubError, Result, OVERLAY_PATH};

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

/// WebSocket front end of the channel relay
pub struct BroadcastHub {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<ChannelRegistry>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    running: Arc<RwLock<bool>>,
}

impl BroadcastHub {
    /// Bind the listening socket. Connections are accepted after `start`.
    pub async fn bind(addr: impl ToSocketAddrs, queue_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry: ChannelRegistry::new(queue_size),
            accept_task: Mutex::new(None),
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    /// Address a consumer on `channel` connects to
    pub fn url_for(&self, channel: Channel) -> String {
        format!("ws://{}{}?ch={}", self.local_addr, OVERLAY_PATH, channel)
    }

    /// Start accepting connections. A stopped hub cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        if *self.running.read().await {
            return Err(HubError::AlreadyRunning);
        }
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(HubError::AlreadyRunning)?;

        *self.running.write().await = true;
        log::info!("Overlay hub listening on {}", self.local_addr);

        let registry = self.registry.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            remote,
                            registry.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        log::error!("Failed to accept hub connection: {}", e);
                    }
                }
            }
        });

        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Stop accepting and close every live connection
    pub async fn stop(&self) -> Result<()> {
        if !*self.running.read().await {
            return Err(HubError::NotStarted);
        }
        *self.running.write().await = false;

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        let _ = self.shutdown_tx.send(true);

        log::info!("Overlay hub stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn client_count(&self) -> usize {
        self.registry.connection_count().await
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
        let _ = self.shutdown_tx.send(true);
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    registry: Arc<ChannelRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut channel = DEFAULT_CHANNEL;
    let mut path = String::new();
    let handshake = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            channel = parse_channel(req.uri().query());
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("Hub handshake with {} failed: {}", remote, e);
            return;
        }
    };

    if path != OVERLAY_PATH {
        log::debug!("Hub peer {} connected on unexpected path {}", remote, path);
    }

    let (conn_id, mut outbound_rx) = registry.register(channel).await;
    let (mut ws_tx, mut ws_rx) = ws.split();
    registry.mark_open(conn_id).await;
    log::info!(
        "Hub connection {} from {} bound to channel {}",
        conn_id,
        remote,
        channel
    );

    loop {
        tokio::select! {
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::from(frame)).await {
                    log::debug!("Hub connection {}: send failed: {}", conn_id, e);
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        registry.relay(conn_id, Frame::Text(text)).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        registry.relay(conn_id, Frame::Binary(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Hub connection {}: receive failed: {}", conn_id, e);
                        break;
                    }
                }
            }

            _ = shutdown_rx.changed() => break,
        }
    }

    registry.mark_closed(conn_id).await;
    let _ = ws_tx.close().await;
    registry.unregister(conn_id).await;
    log::info!("Hub connection {} closed", conn_id);
}
