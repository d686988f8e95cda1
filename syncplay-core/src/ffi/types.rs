//! FFI types exposed via uniffi

use crate::config::SyncConfig;
use crate::engine::{ErrorKind, SyncError};
use crate::sync::{
    GroupSnapshot, GroupState, Participant as InternalParticipant, PlaybackCommand,
};
use crate::transport::ConnectionState;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authorization failed: {0}")]
    Unauthorized(String),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not in a group")]
    NotInGroup,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Player error: {0}")]
    PlayerError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<SyncError> for CoreError {
    fn from(e: SyncError) -> Self {
        match e.kind() {
            ErrorKind::TransientNetwork => CoreError::NetworkError(e.to_string()),
            ErrorKind::Authorization => CoreError::Unauthorized(e.to_string()),
            ErrorKind::GroupNotFound => CoreError::GroupNotFound,
            ErrorKind::AccessDenied => CoreError::AccessDenied(e.to_string()),
            ErrorKind::NotInGroup => CoreError::NotInGroup,
            ErrorKind::Protocol => CoreError::ProtocolError(e.to_string()),
            ErrorKind::ExecutionTimeout => CoreError::PlayerError(e.to_string()),
        }
    }
}

/// Connection settings supplied by the host app
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionConfig {
    pub server_url: String,
    pub access_token: Option<String>,
    /// Generated when absent
    pub device_id: Option<String>,
    pub device_name: String,
    pub client_name: String,
    pub client_version: String,
}

impl From<SessionConfig> for SyncConfig {
    fn from(c: SessionConfig) -> Self {
        let mut config = SyncConfig::new(c.server_url).with_client(c.client_name, c.client_version);
        let device_id = c.device_id.unwrap_or_else(|| config.device_id.clone());
        config = config.with_device(device_id, c.device_name);
        match c.access_token {
            Some(token) => config.with_token(token),
            None => config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(s: ConnectionState) -> Self {
        match s {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum GroupStatus {
    Idle,
    Waiting,
    Paused,
    Playing,
}

impl From<GroupState> for GroupStatus {
    fn from(s: GroupState) -> Self {
        match s {
            GroupState::Idle => GroupStatus::Idle,
            GroupState::Waiting => GroupStatus::Waiting,
            GroupState::Paused => GroupStatus::Paused,
            GroupState::Playing => GroupStatus::Playing,
        }
    }
}

/// Participant exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Participant {
    pub participant_id: String,
    pub ready: bool,
    pub buffering: bool,
    pub latency_ms: Option<u64>,
}

impl From<&InternalParticipant> for Participant {
    fn from(p: &InternalParticipant) -> Self {
        Self {
            participant_id: p.participant_id.clone(),
            ready: p.ready,
            buffering: p.buffering,
            latency_ms: p.latency_ms,
        }
    }
}

/// A group as listed by the authority
#[derive(Debug, Clone, uniffi::Record)]
pub struct GroupSummary {
    pub group_id: String,
    pub group_name: String,
    pub state: GroupStatus,
    pub participants: Vec<Participant>,
}

impl From<&GroupSnapshot> for GroupSummary {
    fn from(g: &GroupSnapshot) -> Self {
        Self {
            group_id: g.group_id.clone(),
            group_name: g.group_name.clone(),
            state: g.state.into(),
            participants: g.participants.iter().map(Participant::from).collect(),
        }
    }
}

/// Command the engine is applying; hosts load the item on `Play`
#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum RemoteCommand {
    Pause { position_ms: u64 },
    Unpause { position_ms: u64 },
    Seek { position_ms: u64 },
    SetRate { rate: f64 },
    Play {
        item_ids: Vec<String>,
        start_index: u32,
        start_position_ms: u64,
    },
    Buffering { item_id: String },
    Stop,
}

impl From<&PlaybackCommand> for RemoteCommand {
    fn from(c: &PlaybackCommand) -> Self {
        match c {
            PlaybackCommand::Pause { position_ms } => RemoteCommand::Pause { position_ms: *position_ms },
            PlaybackCommand::Unpause { position_ms } => RemoteCommand::Unpause { position_ms: *position_ms },
            PlaybackCommand::Seek { position_ms } => RemoteCommand::Seek { position_ms: *position_ms },
            PlaybackCommand::SetRate { rate } => RemoteCommand::SetRate { rate: *rate },
            PlaybackCommand::Play {
                item_ids,
                start_index,
                start_position_ms,
            } => RemoteCommand::Play {
                item_ids: item_ids.clone(),
                start_index: u32::try_from(*start_index).unwrap_or(u32::MAX),
                start_position_ms: *start_position_ms,
            },
            PlaybackCommand::Buffering { item_id } => RemoteCommand::Buffering { item_id: item_id.clone() },
            PlaybackCommand::Stop => RemoteCommand::Stop,
        }
    }
}

/// Error categories passed to [`SessionCallback::on_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum ErrorCategory {
    TransientNetwork,
    Authorization,
    Protocol,
    GroupNotFound,
    AccessDenied,
    ExecutionTimeout,
    NotInGroup,
}

impl From<ErrorKind> for ErrorCategory {
    fn from(k: ErrorKind) -> Self {
        match k {
            ErrorKind::TransientNetwork => ErrorCategory::TransientNetwork,
            ErrorKind::Authorization => ErrorCategory::Authorization,
            ErrorKind::Protocol => ErrorCategory::Protocol,
            ErrorKind::GroupNotFound => ErrorCategory::GroupNotFound,
            ErrorKind::AccessDenied => ErrorCategory::AccessDenied,
            ErrorKind::ExecutionTimeout => ErrorCategory::ExecutionTimeout,
            ErrorKind::NotInGroup => ErrorCategory::NotInGroup,
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_connection_changed(&self, status: ConnectionStatus);
    fn on_group_joined(&self, group_id: String);
    fn on_group_left(&self);
    fn on_group_state_changed(&self, state: GroupStatus);
    fn on_member_joined(&self, participant_id: String);
    fn on_member_left(&self, participant_id: String);
    fn on_command(&self, command: RemoteCommand);
    /// The authority accepted one of our requests
    fn on_command_sent(&self, name: String);
    fn on_buffering_changed(&self, is_buffering: bool);
    fn on_error(&self, category: ErrorCategory, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_conversion() {
        let config: SyncConfig = SessionConfig {
            server_url: "https://media.example.org/".into(),
            access_token: Some("t0k".into()),
            device_id: Some("dev-1".into()),
            device_name: "Living room".into(),
            client_name: "Player".into(),
            client_version: "2.1".into(),
        }
        .into();

        assert_eq!(config.rest_base(), "https://media.example.org");
        assert_eq!(config.access_token.as_deref(), Some("t0k"));
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.device_name, "Living room");
        assert_eq!(config.client_name, "Player");
    }

    #[test]
    fn test_missing_device_id_is_generated() {
        let config: SyncConfig = SessionConfig {
            server_url: "http://localhost:8096".into(),
            access_token: None,
            device_id: None,
            device_name: "Phone".into(),
            client_name: "Player".into(),
            client_version: "1.0".into(),
        }
        .into();
        assert!(!config.device_id.is_empty());
        assert_eq!(config.access_token, None);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CoreError::from(SyncError::NotInGroup), CoreError::NotInGroup));
        assert!(matches!(
            CoreError::from(SyncError::Group(crate::sync::GroupErrorKind::GroupDoesNotExist)),
            CoreError::GroupNotFound
        ));
        assert!(matches!(
            CoreError::from(SyncError::Group(crate::sync::GroupErrorKind::LibraryAccessDenied)),
            CoreError::AccessDenied(_)
        ));
    }

    #[test]
    fn test_play_command_conversion() {
        let cmd = PlaybackCommand::Play {
            item_ids: vec!["A".into(), "B".into()],
            start_index: 1,
            start_position_ms: 2500,
        };
        assert_eq!(
            RemoteCommand::from(&cmd),
            RemoteCommand::Play {
                item_ids: vec!["A".into(), "B".into()],
                start_index: 1,
                start_position_ms: 2500,
            }
        );
    }
}
