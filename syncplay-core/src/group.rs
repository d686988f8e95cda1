//! Group membership and lifecycle
//!
//! Single writer for the group state, membership and group id. Readers
//! go through the `watch` receivers.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::authority::{AuthorityClient, AuthorityError};
use crate::config::SyncConfig;
use crate::sync::{Group, GroupSession, GroupSnapshot, GroupState, Participant, Playlist};

/// Group state change caused by one authority message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: GroupState,
    pub current: GroupState,
}

impl StateTransition {
    /// True when `state` was entered by this transition
    pub fn entered(&self, state: GroupState) -> bool {
        self.previous != state && self.current == state
    }
}

/// Result of a fallback poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Push channel is healthy or the group id is not known yet
    Skipped,
    Updated(StateTransition),
    /// The authority no longer lists our group
    Missing,
}

pub struct GroupCoordinator {
    authority: AuthorityClient,
    join_attempts: u32,
    join_backoff_step: Duration,
    group: Mutex<Group>,
    state_tx: watch::Sender<GroupState>,
    membership_tx: watch::Sender<Vec<Participant>>,
    group_id_tx: watch::Sender<Option<String>>,
}

impl GroupCoordinator {
    pub fn new(authority: AuthorityClient, config: &SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(GroupState::Idle);
        let (membership_tx, _) = watch::channel(Vec::new());
        let (group_id_tx, _) = watch::channel(None);
        Self {
            authority,
            join_attempts: config.join_attempts.max(1),
            join_backoff_step: config.join_backoff_step,
            group: Mutex::new(Group::None),
            state_tx,
            membership_tx,
            group_id_tx,
        }
    }

    // === Observables ===

    pub fn watch_state(&self) -> watch::Receiver<GroupState> {
        self.state_tx.subscribe()
    }

    pub fn watch_membership(&self) -> watch::Receiver<Vec<Participant>> {
        self.membership_tx.subscribe()
    }

    pub fn watch_group_id(&self) -> watch::Receiver<Option<String>> {
        self.group_id_tx.subscribe()
    }

    pub fn state(&self) -> GroupState {
        *self.state_tx.borrow()
    }

    pub fn group_id(&self) -> Option<String> {
        self.group_id_tx.borrow().clone()
    }

    pub fn membership(&self) -> Vec<Participant> {
        self.membership_tx.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.group.lock().is_active()
    }

    pub fn is_busy(&self) -> bool {
        self.group.lock().is_busy()
    }

    // === Lifecycle ===

    /// Join `group_id`, retrying with a linear backoff.
    ///
    /// A missing group is terminal. Authorization failures are logged on
    /// their own but still consume the attempt budget.
    pub async fn join_group(&self, group_id: &str) -> Result<(), AuthorityError> {
        *self.group.lock() = Group::Joining {
            group_id: Some(group_id.to_string()),
        };

        let mut attempt: u32 = 1;
        loop {
            match self.authority.join_group(group_id).await {
                Ok(()) => {
                    info!("Joined group {}", group_id);
                    self.activate(GroupSession::new(Some(group_id.to_string()), String::new()));
                    return Ok(());
                }
                Err(e) => {
                    if e.is_authorization() {
                        warn!(
                            "Join {} not authorized (attempt {}/{}): {}",
                            group_id, attempt, self.join_attempts, e
                        );
                    } else {
                        warn!(
                            "Join {} failed (attempt {}/{}): {}",
                            group_id, attempt, self.join_attempts, e
                        );
                    }

                    let terminal = matches!(e, AuthorityError::GroupNotFound);
                    if terminal || attempt >= self.join_attempts {
                        self.clear();
                        return Err(e);
                    }

                    tokio::time::sleep(self.join_backoff_step * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Create a group. Its id arrives later with the join notification.
    pub async fn create_group(&self, group_name: &str) -> Result<(), AuthorityError> {
        *self.group.lock() = Group::Joining { group_id: None };

        match self.authority.create_group(group_name).await {
            Ok(()) => {
                info!("Created group \"{}\"", group_name);
                self.activate(GroupSession::new(None, group_name.to_string()));
                Ok(())
            }
            Err(e) => {
                warn!("Create group failed: {}", e);
                self.clear();
                Err(e)
            }
        }
    }

    /// Leave the group. Local state is cleared whatever the authority says.
    pub async fn leave_group(&self) -> Result<(), AuthorityError> {
        let result = self.authority.leave_group().await;
        if let Err(e) = &result {
            warn!("Leave request failed, clearing local group state anyway: {}", e);
        }
        self.clear();
        result
    }

    fn activate(&self, session: GroupSession) {
        self.group_id_tx.send_replace(session.group_id.clone());
        self.state_tx.send_replace(session.state);
        self.membership_tx.send_replace(session.participant_list());
        *self.group.lock() = Group::Active(session);
    }

    /// Back to Idle with no members and no id
    pub fn clear(&self) {
        *self.group.lock() = Group::None;
        self.state_tx.send_replace(GroupState::Idle);
        self.membership_tx.send_replace(Vec::new());
        self.group_id_tx.send_replace(None);
    }

    // === Authority updates ===

    /// Join notification or polled snapshot: replaces membership wholesale
    pub fn apply_snapshot(&self, snapshot: &GroupSnapshot) -> Option<StateTransition> {
        let mut group = self.group.lock();
        let session = group.session_mut()?;

        if session.group_id.as_deref() != Some(snapshot.group_id.as_str()) {
            debug!("Group id confirmed: {}", snapshot.group_id);
            session.group_id = Some(snapshot.group_id.clone());
            self.group_id_tx.send_replace(session.group_id.clone());
        }
        if !snapshot.group_name.is_empty() {
            session.group_name = snapshot.group_name.clone();
        }
        session.replace_participants(snapshot.participants.clone());
        session.touch();
        self.membership_tx.send_replace(session.participant_list());

        Some(self.set_state(session, snapshot.state))
    }

    pub fn apply_state(&self, state: GroupState) -> Option<StateTransition> {
        let mut group = self.group.lock();
        let session = group.session_mut()?;
        session.touch();
        Some(self.set_state(session, state))
    }

    fn set_state(&self, session: &mut GroupSession, state: GroupState) -> StateTransition {
        let previous = session.state;
        session.state = state;
        if previous != state {
            info!("Group state {} -> {}", previous, state);
            self.state_tx.send_replace(state);
        }
        StateTransition {
            previous,
            current: state,
        }
    }

    /// Returns true if the member was new
    pub fn member_joined(&self, participant_id: &str) -> bool {
        let mut group = self.group.lock();
        let Some(session) = group.session_mut() else {
            return false;
        };
        session.touch();
        let added = session.add_participant(Participant::named(participant_id));
        if added {
            self.membership_tx.send_replace(session.participant_list());
        }
        added
    }

    /// Returns true if the member was known
    pub fn member_left(&self, participant_id: &str) -> bool {
        let mut group = self.group.lock();
        let Some(session) = group.session_mut() else {
            return false;
        };
        session.touch();
        let removed = session.remove_participant(participant_id).is_some();
        if removed {
            self.membership_tx.send_replace(session.participant_list());
        }
        removed
    }

    /// Any protocol message for the group counts as liveness
    pub fn touch(&self) {
        if let Some(session) = self.group.lock().session_mut() {
            session.touch();
        }
    }

    /// Cache a new playlist. Returns the previous one.
    pub fn set_playlist(&self, playlist: Playlist) -> Option<Playlist> {
        let mut group = self.group.lock();
        let session = group.session_mut()?;
        session.touch();
        session.playlist.replace(playlist)
    }

    pub fn playlist(&self) -> Option<Playlist> {
        self.group.lock().session().and_then(|s| s.playlist.clone())
    }

    /// Fallback poll of group snapshots, skipped while the push channel is lively
    pub async fn poll(&self, quiet_window: Duration) -> Result<PollOutcome, AuthorityError> {
        let group_id = {
            let group = self.group.lock();
            match group.session() {
                Some(session) if session.is_quiet(quiet_window) => session.group_id.clone(),
                _ => None,
            }
        };
        let Some(group_id) = group_id else {
            return Ok(PollOutcome::Skipped);
        };

        debug!("Polling group snapshots for {}", group_id);
        let groups = self.authority.list_groups().await?;
        match groups.iter().find(|g| g.group_id == group_id) {
            Some(snapshot) => Ok(self
                .apply_snapshot(snapshot)
                .map_or(PollOutcome::Skipped, PollOutcome::Updated)),
            None => Ok(PollOutcome::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn coordinator(server: &MockServer) -> GroupCoordinator {
        let mut config = SyncConfig::new(server.uri());
        config.join_backoff_step = Duration::from_millis(10);
        let authority = AuthorityClient::new(&config).unwrap();
        GroupCoordinator::new(authority, &config)
    }

    fn snapshot(state: GroupState, members: &[&str]) -> GroupSnapshot {
        GroupSnapshot {
            group_id: "G1".into(),
            group_name: "Movie night".into(),
            state,
            participants: members.iter().map(|m| Participant::named(*m)).collect(),
        }
    }

    #[tokio::test]
    async fn test_join_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let group = coordinator(&server);
        group.join_group("G1").await.unwrap();
        assert!(group.is_active());
        assert_eq!(group.group_id().as_deref(), Some("G1"));
    }

    #[tokio::test]
    async fn test_join_unauthorized_uses_whole_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(401))
            .expect(3)
            .mount(&server)
            .await;

        let group = coordinator(&server);
        let err = group.join_group("G1").await.unwrap_err();
        assert!(err.is_authorization());
        assert!(!group.is_busy());
        assert_eq!(group.group_id(), None);
    }

    #[tokio::test]
    async fn test_join_missing_group_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let group = coordinator(&server);
        let err = group.join_group("G1").await.unwrap_err();
        assert!(matches!(err, AuthorityError::GroupNotFound));
        assert_eq!(group.state(), GroupState::Idle);
    }

    #[tokio::test]
    async fn test_leave_clears_even_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Leave"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let group = coordinator(&server);
        group.join_group("G1").await.unwrap();
        group.apply_snapshot(&snapshot(GroupState::Playing, &["alice"]));

        assert!(group.leave_group().await.is_err());
        assert!(!group.is_busy());
        assert_eq!(group.state(), GroupState::Idle);
        assert!(group.membership().is_empty());
        assert_eq!(group.group_id(), None);
    }

    #[tokio::test]
    async fn test_snapshot_transitions_and_membership() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/New"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let group = coordinator(&server);
        let mut state_rx = group.watch_state();
        group.create_group("Movie night").await.unwrap();
        // Id unknown until the authority confirms
        assert_eq!(group.group_id(), None);

        let t = group.apply_snapshot(&snapshot(GroupState::Waiting, &["bob", "alice"])).unwrap();
        assert!(t.entered(GroupState::Waiting));
        assert_eq!(group.group_id().as_deref(), Some("G1"));
        assert_eq!(group.membership()[0].participant_id, "alice");

        let t = group.apply_state(GroupState::Playing).unwrap();
        assert!(t.entered(GroupState::Playing));
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), GroupState::Playing);

        // Same state again is not an entry
        let t = group.apply_state(GroupState::Playing).unwrap();
        assert!(!t.entered(GroupState::Playing));

        assert!(group.member_joined("carol"));
        assert!(!group.member_joined("carol"));
        assert!(group.member_left("bob"));
        assert_eq!(group.membership().len(), 2);
    }

    #[tokio::test]
    async fn test_updates_ignored_outside_group() {
        let server = MockServer::start().await;
        let group = coordinator(&server);
        assert_eq!(group.apply_state(GroupState::Playing), None);
        assert!(!group.member_joined("alice"));
        assert_eq!(group.state(), GroupState::Idle);
    }

    #[tokio::test]
    async fn test_poll_skips_when_lively_and_detects_missing_group() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/SyncPlay/List"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "GroupId": "G2", "GroupName": "Other", "State": "Idle", "Participants": [] }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let group = coordinator(&server);
        group.join_group("G1").await.unwrap();

        // A message just arrived
        assert_eq!(group.poll(Duration::from_secs(5)).await.unwrap(), PollOutcome::Skipped);
        // Zero window means always quiet
        assert_eq!(group.poll(Duration::ZERO).await.unwrap(), PollOutcome::Missing);
    }

    #[tokio::test]
    async fn test_poll_applies_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SyncPlay/Join"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/SyncPlay/List"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "GroupId": "G1", "GroupName": "Movie night", "State": "Paused", "Participants": ["alice"] }
            ])))
            .mount(&server)
            .await;

        let group = coordinator(&server);
        group.join_group("G1").await.unwrap();
        let outcome = group.poll(Duration::ZERO).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Updated(StateTransition {
                previous: GroupState::Idle,
                current: GroupState::Paused,
            })
        );
        assert_eq!(group.membership().len(), 1);
    }
}
