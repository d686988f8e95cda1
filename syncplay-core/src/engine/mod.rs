//! Synchronization Engine
//!
//! [`SyncEngine`] is the handle hosts hold and pass around. It owns the
//! authority client, the push channel, the player context and the group
//! coordinator, and runs one supervisor task per group session.

mod supervisor;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authority::{AuthorityClient, AuthorityError};
use crate::config::SyncConfig;
use crate::group::GroupCoordinator;
use crate::player::{Player, PlayerContext, PlayerError};
use crate::sync::filters::RemoteExecutionGuard;
use crate::sync::{
    CommandKind, GroupErrorKind, GroupSnapshot, GroupState, OutboundIntent, Participant, PlaybackCommand,
    ProtocolError,
};
use crate::transport::{ConnectionState, LinkError, LinkHandle, TransportLink};

use supervisor::{HostRequest, Supervisor};

/// Error categories hosts can act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    Authorization,
    Protocol,
    GroupNotFound,
    AccessDenied,
    ExecutionTimeout,
    NotInGroup,
}

/// Engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Not in a group")]
    NotInGroup,

    #[error("Group error: {0:?}")]
    Group(GroupErrorKind),

    #[error("Applying {command:?} took longer than {limit:?}")]
    ExecutionTimeout { command: CommandKind, limit: Duration },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Authority(AuthorityError::GroupNotFound) => ErrorKind::GroupNotFound,
            SyncError::Authority(e) if e.is_authorization() => ErrorKind::Authorization,
            SyncError::Authority(_) | SyncError::Link(_) => ErrorKind::TransientNetwork,
            SyncError::Player(_) | SyncError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::NotInGroup => ErrorKind::NotInGroup,
            SyncError::Group(GroupErrorKind::NotInGroup) => ErrorKind::NotInGroup,
            SyncError::Group(GroupErrorKind::GroupDoesNotExist) => ErrorKind::GroupNotFound,
            SyncError::Group(_) => ErrorKind::AccessDenied,
        }
    }
}

/// Advisory events for the host. None of them block the protocol.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    GroupJoined { group_id: String },
    GroupLeft,
    MemberJoined(String),
    MemberLeft(String),
    /// Command accepted for local application. Hosts load the item on `Play`.
    Command(PlaybackCommand),
    /// The authority accepted an outbound request
    CommandSent(String),
    Error { kind: ErrorKind, message: String },
}

impl SyncEvent {
    pub(crate) fn error(err: &SyncError) -> Self {
        SyncEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Everything a session supervisor shares with the engine handle
pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    pub(crate) authority: AuthorityClient,
    pub(crate) link: LinkHandle,
    pub(crate) player: PlayerContext,
    pub(crate) group: GroupCoordinator,
    pub(crate) guard: RemoteExecutionGuard,
    pub(crate) is_buffering: Arc<watch::Sender<bool>>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

struct SessionHandle {
    requests: mpsc::UnboundedSender<HostRequest>,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle to the synchronization engine
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
    session: Arc<Mutex<Option<SessionHandle>>>,
}

impl SyncEngine {
    /// Build the engine. Must be called inside a tokio runtime.
    pub fn new(config: SyncConfig, player: Box<dyn Player>) -> Result<Self, SyncError> {
        let authority = AuthorityClient::new(&config)?;
        let link = TransportLink::new(&config)?.start();
        let player = PlayerContext::spawn(player)?;
        Ok(Self::with_parts(config, authority, link, player))
    }

    pub(crate) fn with_parts(
        config: SyncConfig,
        authority: AuthorityClient,
        link: LinkHandle,
        player: PlayerContext,
    ) -> Self {
        let group = GroupCoordinator::new(authority.clone(), &config);
        let guard = RemoteExecutionGuard::new(config.remote_guard_timeout);
        let (is_buffering, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);

        // Connection changes go out on the event stream too
        let mut state_rx = link.watch_state();
        let events_tx = events.clone();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                let _ = events_tx.send(SyncEvent::ConnectionChanged(state));
            }
        });

        Self {
            shared: Arc::new(Shared {
                config,
                authority,
                link,
                player,
                group,
                guard,
                is_buffering: Arc::new(is_buffering),
                events,
            }),
            session: Arc::new(Mutex::new(None)),
        }
    }

    // === Observables ===

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.link.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.link.watch_state()
    }

    pub fn group_state(&self) -> GroupState {
        self.shared.group.state()
    }

    pub fn watch_group_state(&self) -> watch::Receiver<GroupState> {
        self.shared.group.watch_state()
    }

    pub fn membership(&self) -> Vec<Participant> {
        self.shared.group.membership()
    }

    pub fn watch_membership(&self) -> watch::Receiver<Vec<Participant>> {
        self.shared.group.watch_membership()
    }

    pub fn group_id(&self) -> Option<String> {
        self.shared.group.group_id()
    }

    pub fn watch_group_id(&self) -> watch::Receiver<Option<String>> {
        self.shared.group.watch_group_id()
    }

    pub fn is_buffering(&self) -> bool {
        *self.shared.is_buffering.borrow()
    }

    pub fn watch_buffering(&self) -> watch::Receiver<bool> {
        self.shared.is_buffering.subscribe()
    }

    // === Group lifecycle ===

    /// Create a group and start syncing with it
    pub async fn create_group(&self, group_name: &str) -> Result<(), SyncError> {
        self.leave_group().await?;
        if let Err(e) = self.shared.group.create_group(group_name).await {
            return Err(self.report(e.into()));
        }
        self.start_session().await;
        Ok(())
    }

    /// Join a group and start syncing with it. Leaves the current group first.
    pub async fn join_group(&self, group_id: &str) -> Result<(), SyncError> {
        self.leave_group().await?;
        if let Err(e) = self.shared.group.join_group(group_id).await {
            return Err(self.report(e.into()));
        }
        self.shared.emit(SyncEvent::GroupJoined {
            group_id: group_id.to_string(),
        });
        self.start_session().await;
        Ok(())
    }

    /// Leave the current group. Best effort: local state is always cleared.
    pub async fn leave_group(&self) -> Result<(), SyncError> {
        let was_busy = self.shared.group.is_busy();
        self.stop_session().await;
        if !was_busy {
            return Ok(());
        }

        // Failures are logged by the coordinator; the group is gone locally either way
        let _ = self.shared.group.leave_group().await;
        self.shared.link.disconnect();
        self.shared.emit(SyncEvent::GroupLeft);
        info!("Left group");
        Ok(())
    }

    /// Groups visible to this client
    pub async fn list_groups(&self) -> Result<Vec<GroupSnapshot>, SyncError> {
        self.shared
            .authority
            .list_groups()
            .await
            .map_err(|e| self.report(e.into()))
    }

    async fn start_session(&self) {
        self.stop_session().await;

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        let supervisor = Supervisor::new(self.shared.clone());
        let task = tokio::spawn(supervisor.run(requests_rx, cancel_rx));

        *self.session.lock() = Some(SessionHandle {
            requests,
            cancel,
            task,
        });
    }

    async fn stop_session(&self) {
        let handle = self.session.lock().take();
        if let Some(handle) = handle {
            let _ = handle.cancel.send(());
            if let Err(e) = handle.task.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
    }

    // === Outbound intents ===

    pub async fn request_pause(&self) -> Result<(), SyncError> {
        self.send_intent(OutboundIntent::Pause).await
    }

    pub async fn request_unpause(&self) -> Result<(), SyncError> {
        self.send_intent(OutboundIntent::Unpause).await
    }

    pub async fn request_seek(&self, position_ms: u64) -> Result<(), SyncError> {
        self.send_intent(OutboundIntent::Seek { position_ms }).await
    }

    /// Replace the group's play queue
    pub async fn request_play(
        &self,
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ms: u64,
    ) -> Result<(), SyncError> {
        self.send_intent(OutboundIntent::Play {
            item_ids,
            start_index,
            start_position_ms,
        })
        .await
    }

    pub async fn request_stop(&self) -> Result<(), SyncError> {
        self.send_intent(OutboundIntent::Stop).await
    }

    async fn send_intent(&self, intent: OutboundIntent) -> Result<(), SyncError> {
        if !self.shared.group.is_active() {
            return Err(SyncError::NotInGroup);
        }
        match self.shared.authority.send_intent(&intent).await {
            Ok(()) => {
                self.shared.emit(SyncEvent::CommandSent(intent.name().to_string()));
                Ok(())
            }
            Err(e) => Err(self.report(e.into())),
        }
    }

    /// The host finished loading `item_id` and can start it on demand
    pub async fn report_buffering_complete(&self, item_id: &str) -> Result<(), SyncError> {
        let requests = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.requests.clone())
            .ok_or(SyncError::NotInGroup)?;

        let (reply, reply_rx) = oneshot::channel();
        requests
            .send(HostRequest::BufferingComplete {
                item_id: item_id.to_string(),
                reply,
            })
            .map_err(|_| SyncError::NotInGroup)?;
        reply_rx.await.map_err(|_| SyncError::NotInGroup)?
    }

    // === Local-change observer ===

    /// The user paused the local player
    pub async fn on_local_pause(&self) -> Result<(), SyncError> {
        self.local_change(OutboundIntent::Pause).await
    }

    /// The user resumed the local player
    pub async fn on_local_play(&self) -> Result<(), SyncError> {
        self.local_change(OutboundIntent::Unpause).await
    }

    /// The user seeked the local player
    pub async fn on_local_seek(&self, position_ms: u64) -> Result<(), SyncError> {
        self.local_change(OutboundIntent::Seek { position_ms }).await
    }

    async fn local_change(&self, intent: OutboundIntent) -> Result<(), SyncError> {
        if self.shared.guard.is_active() {
            debug!("Ignoring local {} while a remote command is applied", intent.name());
            return Ok(());
        }
        if !self.shared.group.is_active() {
            return Ok(());
        }
        self.send_intent(intent).await
    }

    /// Host reachability hint
    pub fn network_changed(&self, available: bool) {
        self.shared.link.network_changed(available);
    }

    /// Stop the session and the push channel
    pub async fn shutdown(&self) {
        self.stop_session().await;
        self.shared.link.shutdown();
    }

    /// Log and publish an error, handing it back to the caller
    fn report(&self, err: SyncError) -> SyncError {
        match err.kind() {
            ErrorKind::Authorization => warn!("Authority refused our credentials: {}", err),
            _ => warn!("{}", err),
        }
        self.shared.emit(SyncEvent::error(&err));
        err
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::player::mock::MockPlayer;
    use url::Url;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Engine wired to a permissive mock authority and a mock player.
    /// The push channel points at a closed port and never connects.
    pub(crate) struct Harness {
        pub(crate) engine: SyncEngine,
        pub(crate) player: MockPlayer,
        pub(crate) server: MockServer,
    }

    impl Harness {
        pub(crate) async fn start() -> Self {
            let server = MockServer::start().await;
            Self::accept_all(&server).await;
            Self::with_server(server, |_| {}, Self::closed_link())
        }

        /// Answer every group request with 204. Mocks mounted earlier win.
        pub(crate) async fn accept_all(server: &MockServer) {
            Mock::given(method("POST"))
                .and(path_regex("^/SyncPlay/"))
                .respond_with(ResponseTemplate::new(204))
                .mount(server)
                .await;
        }

        pub(crate) fn closed_link() -> Url {
            Url::parse("ws://127.0.0.1:9/socket").unwrap()
        }

        pub(crate) fn with_server(server: MockServer, tune: impl FnOnce(&mut SyncConfig), link_url: Url) -> Self {
            let mut config = SyncConfig::new(server.uri());
            tune(&mut config);
            let authority = AuthorityClient::new(&config).unwrap();
            let link = TransportLink::with_url(link_url, &config).start();
            let player = MockPlayer::default();
            let ctx = PlayerContext::spawn(Box::new(player.clone())).unwrap();

            Self {
                engine: SyncEngine::with_parts(config, authority, link, ctx),
                player,
                server,
            }
        }

        /// How many times the authority received `path`
        pub(crate) async fn hits(&self, path: &str) -> usize {
            self.paths().await.iter().filter(|p| p.as_str() == path).count()
        }

        pub(crate) fn shared(&self) -> Arc<Shared> {
            self.engine.shared.clone()
        }

        /// Paths of every request the mock authority received
        pub(crate) async fn paths(&self) -> Vec<String> {
            self.server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .map(|r| r.url.path().to_string())
                .collect()
        }
    }
}
