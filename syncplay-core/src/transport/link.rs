//! Push Channel Link
//!
//! Keeps one WebSocket to the authority open:
//! - exponential reconnect backoff, reset on every successful open
//! - ping every heartbeat interval, dead after the heartbeat timeout without a pong
//! - reachability hints tear down or retry early

use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::reconnect_delay;
use crate::config::SyncConfig;
use crate::sync::clock::current_time_ms;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Link-layer errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Invalid push channel URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Link task closed")]
    Closed,
}

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events published by the link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Raw text frame, stamped on receipt
    Frame { text: String, received_at_ms: u64 },
    /// Heartbeat round trip
    RoundTrip(Duration),
}

#[derive(Debug)]
enum LinkCommand {
    Connect,
    Disconnect,
    Send(String),
    NetworkAvailable,
    NetworkLost,
    Shutdown,
}

/// Handle to the running link task
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl LinkHandle {
    /// Ask the link to stay connected. No-op while already connecting or connected.
    pub fn connect(&self) -> Result<(), LinkError> {
        self.command_tx
            .send(LinkCommand::Connect)
            .map_err(|_| LinkError::Closed)
    }

    /// Close the socket and stop reconnecting
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(LinkCommand::Disconnect);
    }

    /// Send a text frame. Frames offered while disconnected are dropped.
    pub fn send(&self, text: impl Into<String>) -> Result<(), LinkError> {
        self.command_tx
            .send(LinkCommand::Send(text.into()))
            .map_err(|_| LinkError::Closed)
    }

    /// Host reachability hint
    pub fn network_changed(&self, available: bool) {
        let cmd = if available {
            LinkCommand::NetworkAvailable
        } else {
            LinkCommand::NetworkLost
        };
        let _ = self.command_tx.send(cmd);
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LinkCommand::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }
}

/// What the host currently wants from the link
#[derive(Debug, Default)]
struct Intent {
    wanted: bool,
    offline: bool,
    shutdown: bool,
    retry_now: bool,
}

impl Intent {
    fn active(&self) -> bool {
        self.wanted && !self.offline && !self.shutdown
    }

    /// Fold a command in. Outbound payloads are handed back to the caller.
    fn absorb(&mut self, cmd: Option<LinkCommand>) -> Option<String> {
        match cmd {
            None | Some(LinkCommand::Shutdown) => self.shutdown = true,
            Some(LinkCommand::Connect) => self.wanted = true,
            Some(LinkCommand::Disconnect) => self.wanted = false,
            Some(LinkCommand::NetworkLost) => self.offline = true,
            Some(LinkCommand::NetworkAvailable) => {
                self.offline = false;
                self.retry_now = true;
            }
            Some(LinkCommand::Send(text)) => return Some(text),
        }
        None
    }
}

/// Push channel transport - runs in a background task
pub struct TransportLink {
    url: Url,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl TransportLink {
    pub fn new(config: &SyncConfig) -> Result<Self, LinkError> {
        Ok(Self::with_url(config.socket_url()?, config))
    }

    pub fn with_url(url: Url, config: &SyncConfig) -> Self {
        Self {
            url,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Spawn the link task. It stays idle until [`LinkHandle::connect`].
    pub fn start(self) -> LinkHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(256);

        let handle = LinkHandle {
            command_tx,
            state_rx,
            events_tx: events_tx.clone(),
        };

        tokio::spawn(self.run(command_rx, state_tx, events_tx));

        handle
    }

    async fn run(
        self,
        mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
        state_tx: watch::Sender<ConnectionState>,
        events_tx: broadcast::Sender<LinkEvent>,
    ) {
        let set_state = |state: ConnectionState| {
            state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
        };

        let mut intent = Intent::default();
        let mut attempts: u32 = 0;

        loop {
            if intent.shutdown {
                break;
            }

            if !intent.active() {
                set_state(ConnectionState::Disconnected);
                attempts = 0;
                if let Some(text) = intent.absorb(command_rx.recv().await) {
                    debug!("Dropping outbound frame while disconnected ({} bytes)", text.len());
                }
                continue;
            }

            set_state(ConnectionState::Connecting);
            if let Some(socket) = self.open(&mut command_rx, &mut intent).await {
                attempts = 0;
                set_state(ConnectionState::Connected);
                info!("Push channel connected to {}", self.url.host_str().unwrap_or("authority"));
                self.serve(socket, &mut command_rx, &mut intent, &events_tx).await;
                info!("Push channel closed");
            }
            set_state(ConnectionState::Disconnected);

            if !intent.active() {
                continue;
            }

            let delay = reconnect_delay(attempts, self.backoff_base, self.backoff_max);
            attempts = attempts.saturating_add(1);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempts);

            intent.retry_now = false;
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            while intent.active() && !intent.retry_now {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = command_rx.recv() => {
                        if let Some(text) = intent.absorb(cmd) {
                            debug!("Dropping outbound frame while reconnecting ({} bytes)", text.len());
                        }
                    }
                }
            }
        }

        set_state(ConnectionState::Disconnected);
        debug!("Link task stopped");
    }

    /// Open the socket within the connect timeout. Returns None on failure or when the host gave up.
    async fn open(
        &self,
        command_rx: &mut mpsc::UnboundedReceiver<LinkCommand>,
        intent: &mut Intent,
    ) -> Option<Socket> {
        let connecting = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(Ok((socket, _))) => Some(socket),
                        Ok(Err(e)) => {
                            warn!("Push channel connect failed: {}", e);
                            None
                        }
                        Err(_) => {
                            warn!("Push channel connect timed out after {:?}", self.connect_timeout);
                            None
                        }
                    };
                }
                cmd = command_rx.recv() => {
                    if let Some(text) = intent.absorb(cmd) {
                        debug!("Dropping outbound frame while connecting ({} bytes)", text.len());
                    }
                    if !intent.active() {
                        return None;
                    }
                }
            }
        }
    }

    /// Pump an open socket until it drops or the host no longer wants it
    async fn serve(
        &self,
        socket: Socket,
        command_rx: &mut mpsc::UnboundedReceiver<LinkCommand>,
        intent: &mut Intent,
        events_tx: &broadcast::Sender<LinkEvent>,
    ) {
        let (mut sink, mut stream) = socket.split();

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        heartbeat.tick().await;

        // Pushed forward by every pong
        let deadline = tokio::time::sleep(self.heartbeat_timeout);
        tokio::pin!(deadline);
        let mut ping_sent: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events_tx.send(LinkEvent::Frame {
                            text: text.to_string(),
                            received_at_ms: current_time_ms(),
                        });
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + self.heartbeat_timeout);
                        if let Some(sent) = ping_sent.take() {
                            let _ = events_tx.send(LinkEvent::RoundTrip(sent.elapsed()));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Authority closed the push channel: {:?}", frame);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        return;
                    }
                    None => return,
                },
                _ = &mut deadline => {
                    warn!("No heartbeat ack for {:?}, dropping push channel", self.heartbeat_timeout);
                    return;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        warn!("Heartbeat send failed: {}", e);
                        return;
                    }
                    ping_sent = Some(Instant::now());
                }
                cmd = command_rx.recv() => {
                    if let Some(text) = intent.absorb(cmd) {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!("Push channel send failed: {}", e);
                            return;
                        }
                    }
                    if !intent.active() {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}
