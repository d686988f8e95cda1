//! Session implementation for FFI

use parking_lot::RwLock;
use std::sync::{mpsc, Arc, Once};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::engine::{SyncEngine, SyncEvent};
use crate::player::Player;

use super::types::*;

static TRACING_INIT: Once = Once::new();

type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in ["syncplay_core=debug", "hyper_util=off", "reqwest=off", "hyper=off", "tungstenite=info"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode/logcat
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    engine: SyncEngine,
    callback: SharedCallback,
}

#[uniffi::export]
impl Session {
    /// Create a new session. The player is driven from a dedicated thread.
    #[uniffi::constructor]
    pub fn new(config: SessionConfig, player: Box<dyn Player>) -> Result<Arc<Self>, CoreError> {
        init_tracing();
        info!("Initializing syncplay-core session for {}", config.server_url);

        let runtime = Runtime::new().map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        let engine = {
            let _enter = runtime.enter();
            SyncEngine::new(config.into(), player)?
        };

        let session = Self {
            runtime,
            engine,
            callback: Arc::new(RwLock::new(None)),
        };
        session.start_event_forwarder();
        Ok(Arc::new(session))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    // === Groups ===

    pub fn list_groups(&self) -> Result<Vec<GroupSummary>, CoreError> {
        let groups = self.runtime.block_on(self.engine.list_groups())?;
        debug!("{} groups visible", groups.len());
        Ok(groups.iter().map(GroupSummary::from).collect())
    }

    /// Create a group; the authority confirms its id asynchronously
    pub fn create_group(&self, group_name: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.engine.create_group(&group_name))?;
        Ok(())
    }

    pub fn join_group(&self, group_id: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.engine.join_group(&group_id))?;
        Ok(())
    }

    pub fn leave_group(&self) -> Result<(), CoreError> {
        self.runtime.block_on(self.engine.leave_group())?;
        Ok(())
    }

    pub fn group_id(&self) -> Option<String> {
        self.engine.group_id()
    }

    pub fn group_state(&self) -> GroupStatus {
        self.engine.group_state().into()
    }

    pub fn members(&self) -> Vec<Participant> {
        self.engine.membership().iter().map(Participant::from).collect()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.engine.connection_state().into()
    }

    pub fn is_buffering(&self) -> bool {
        self.engine.is_buffering()
    }

    // === Requests to the group ===

    pub fn request_pause(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.request_pause())?)
    }

    pub fn request_unpause(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.request_unpause())?)
    }

    pub fn request_seek(&self, position_ms: u64) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.request_seek(position_ms))?)
    }

    pub fn request_play(&self, item_ids: Vec<String>, start_index: u32, start_position_ms: u64) -> Result<(), CoreError> {
        let start_index = usize::try_from(start_index).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        Ok(self
            .runtime
            .block_on(self.engine.request_play(item_ids, start_index, start_position_ms))?)
    }

    pub fn request_stop(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.request_stop())?)
    }

    /// The host finished loading `item_id` after a `Play` command
    pub fn report_buffering_complete(&self, item_id: String) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.report_buffering_complete(&item_id))?)
    }

    // === Local player events ===

    pub fn on_local_pause(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.on_local_pause())?)
    }

    pub fn on_local_play(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.on_local_play())?)
    }

    pub fn on_local_seek(&self, position_ms: u64) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.engine.on_local_seek(position_ms))?)
    }

    /// Network reachability changed on the device
    pub fn on_network_changed(&self, available: bool) {
        self.engine.network_changed(available);
    }

    /// Leave the group and stop all background work
    pub fn shutdown(&self) {
        if let Err(e) = self.runtime.block_on(self.engine.leave_group()) {
            warn!("Leaving group on shutdown failed: {}", e);
        }
        self.runtime.block_on(self.engine.shutdown());
        info!("Session shut down");
    }
}

impl Session {
    /// Forward engine events to the callback.
    ///
    /// Callbacks run on their own thread so hosts may call back into the
    /// session from inside them.
    fn start_event_forwarder(&self) {
        let (tx, rx) = mpsc::channel::<Delivery>();
        let callback = Arc::clone(&self.callback);
        let spawned = std::thread::Builder::new()
            .name("syncplay-callback".into())
            .spawn(move || {
                for delivery in rx {
                    let cb = callback.read().clone();
                    if let Some(cb) = cb {
                        delivery.dispatch(cb.as_ref());
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to start callback thread, events will not be delivered: {}", e);
            return;
        }

        let mut events = self.engine.subscribe();
        let mut group_state = self.engine.watch_group_state();
        let mut buffering = self.engine.watch_buffering();
        self.runtime.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => Delivery::Event(event),
                        Err(RecvError::Lagged(n)) => {
                            warn!("Callback forwarder lagged, {} events dropped", n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = group_state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        Delivery::GroupState((*group_state.borrow_and_update()).into())
                    }
                    changed = buffering.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        Delivery::Buffering(*buffering.borrow_and_update())
                    }
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            debug!("Event forwarder stopped");
        });
    }
}

enum Delivery {
    Event(SyncEvent),
    GroupState(GroupStatus),
    Buffering(bool),
}

impl Delivery {
    fn dispatch(self, cb: &dyn SessionCallback) {
        match self {
            Delivery::Event(SyncEvent::ConnectionChanged(state)) => cb.on_connection_changed(state.into()),
            Delivery::Event(SyncEvent::GroupJoined { group_id }) => cb.on_group_joined(group_id),
            Delivery::Event(SyncEvent::GroupLeft) => cb.on_group_left(),
            Delivery::Event(SyncEvent::MemberJoined(id)) => cb.on_member_joined(id),
            Delivery::Event(SyncEvent::MemberLeft(id)) => cb.on_member_left(id),
            Delivery::Event(SyncEvent::Command(command)) => cb.on_command(RemoteCommand::from(&command)),
            Delivery::Event(SyncEvent::CommandSent(name)) => cb.on_command_sent(name),
            Delivery::Event(SyncEvent::Error { kind, message }) => cb.on_error(kind.into(), message),
            Delivery::GroupState(state) => cb.on_group_state_changed(state),
            Delivery::Buffering(is_buffering) => cb.on_buffering_changed(is_buffering),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::mock::MockPlayer;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    struct RecordingCallback(Arc<Recorder>);

    impl SessionCallback for RecordingCallback {
        fn on_connection_changed(&self, status: ConnectionStatus) {
            self.0.seen.lock().push(format!("connection:{:?}", status));
        }
        fn on_group_joined(&self, group_id: String) {
            self.0.seen.lock().push(format!("joined:{}", group_id));
        }
        fn on_group_left(&self) {
            self.0.seen.lock().push("left".into());
        }
        fn on_group_state_changed(&self, state: GroupStatus) {
            self.0.seen.lock().push(format!("state:{:?}", state));
        }
        fn on_member_joined(&self, participant_id: String) {
            self.0.seen.lock().push(format!("member+:{}", participant_id));
        }
        fn on_member_left(&self, participant_id: String) {
            self.0.seen.lock().push(format!("member-:{}", participant_id));
        }
        fn on_command(&self, command: RemoteCommand) {
            self.0.seen.lock().push(format!("command:{:?}", command));
        }
        fn on_command_sent(&self, name: String) {
            self.0.seen.lock().push(format!("sent:{}", name));
        }
        fn on_buffering_changed(&self, is_buffering: bool) {
            self.0.seen.lock().push(format!("buffering:{}", is_buffering));
        }
        fn on_error(&self, category: ErrorCategory, _message: String) {
            self.0.seen.lock().push(format!("error:{:?}", category));
        }
    }

    fn wait_for(recorder: &Recorder, entry: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if recorder.seen.lock().iter().any(|e| e == entry) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_session_join_and_request_reach_callback() {
        let helper = Runtime::new().unwrap();
        let server = helper.block_on(async {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(204))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/SyncPlay/List"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                    { "GroupId": "G1", "GroupName": "Movie night", "State": "Paused", "Participants": ["alice"] }
                ])))
                .mount(&server)
                .await;
            server
        });

        let session = Session::new(
            SessionConfig {
                server_url: server.uri(),
                access_token: None,
                device_id: None,
                device_name: "test".into(),
                client_name: "tests".into(),
                client_version: "0.0.0".into(),
            },
            Box::new(MockPlayer::default()),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        session.set_callback(Box::new(RecordingCallback(recorder.clone())));

        let groups = session.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_name, "Movie night");
        assert_eq!(groups[0].state, GroupStatus::Paused);

        assert!(matches!(session.request_pause(), Err(CoreError::NotInGroup)));

        session.join_group("G1".into()).unwrap();
        assert!(wait_for(&recorder, "joined:G1"));
        assert_eq!(session.group_id().as_deref(), Some("G1"));

        session.request_pause().unwrap();
        assert!(wait_for(&recorder, "sent:Pause"));

        session.shutdown();
        assert!(wait_for(&recorder, "left"));
        assert_eq!(session.group_id(), None);
    }
}
