//! Sync Protocol Messages
//!
//! Inbound push-channel envelopes are decoded into [`InboundMessage`];
//! host and engine intents are encoded into authority requests.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::clock::{ms_to_ticks, ticks_to_ms};
use super::state::{GroupSnapshot, GroupState, Participant, Playlist, PlaylistEntry};
use crate::authority::types::{
    BufferingRequest, NewQueueRequest, PingRequest, ReadyRequest, SeekRequest,
};

/// Errors decoding an inbound envelope
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

impl ProtocolError {
    /// Unknown types are expected from newer authorities and are not worth a warning
    pub fn is_forward_compatible(&self) -> bool {
        matches!(self, ProtocolError::UnknownType(_))
    }
}

/// Playback instruction from the authority
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    Pause { position_ms: u64 },
    Unpause { position_ms: u64 },
    Seek { position_ms: u64 },
    SetRate { rate: f64 },
    Play {
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ms: u64,
    },
    Buffering { item_id: String },
    Stop,
}

/// Discriminant of [`PlaybackCommand`], used as the dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Pause,
    Unpause,
    Seek,
    SetRate,
    Play,
    Buffering,
    Stop,
}

impl PlaybackCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            PlaybackCommand::Pause { .. } => CommandKind::Pause,
            PlaybackCommand::Unpause { .. } => CommandKind::Unpause,
            PlaybackCommand::Seek { .. } => CommandKind::Seek,
            PlaybackCommand::SetRate { .. } => CommandKind::SetRate,
            PlaybackCommand::Play { .. } => CommandKind::Play,
            PlaybackCommand::Buffering { .. } => CommandKind::Buffering,
            PlaybackCommand::Stop => CommandKind::Stop,
        }
    }

    /// Target position for transport commands
    pub fn position_ms(&self) -> Option<u64> {
        match self {
            PlaybackCommand::Pause { position_ms }
            | PlaybackCommand::Unpause { position_ms }
            | PlaybackCommand::Seek { position_ms } => Some(*position_ms),
            PlaybackCommand::Play { start_position_ms, .. } => Some(*start_position_ms),
            _ => None,
        }
    }

    /// Item a Play command starts with
    pub fn leading_item(&self) -> Option<&str> {
        match self {
            PlaybackCommand::Play { item_ids, start_index, .. } => {
                item_ids.get(*start_index).map(String::as_str)
            }
            PlaybackCommand::Buffering { item_id } => Some(item_id),
            _ => None,
        }
    }
}

/// A command together with its local receipt time
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    pub command: PlaybackCommand,
    pub received_at_ms: u64,
}

impl ReceivedCommand {
    pub fn new(command: PlaybackCommand, received_at_ms: u64) -> Self {
        Self { command, received_at_ms }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.received_at_ms)
    }
}

/// Why the play queue changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueReason {
    NewPlaylist,
    SetCurrentItem,
    NextItem,
    PreviousItem,
    /// Queue edits, repeat/shuffle changes and anything newer
    Other(String),
}

impl QueueReason {
    fn from_wire(value: &str) -> Self {
        match value {
            "NewPlaylist" => QueueReason::NewPlaylist,
            "SetCurrentItem" => QueueReason::SetCurrentItem,
            "NextItem" => QueueReason::NextItem,
            "PreviousItem" => QueueReason::PreviousItem,
            other => QueueReason::Other(other.to_string()),
        }
    }

    /// Reasons that always (re)start playback of the selected item
    pub fn starts_playback(&self) -> bool {
        !matches!(self, QueueReason::Other(_))
    }
}

/// Play queue update from the authority
#[derive(Debug, Clone, PartialEq)]
pub struct PlayQueueUpdate {
    pub reason: QueueReason,
    pub playlist: Playlist,
    pub is_playing: bool,
}

/// Group-level failures reported by the authority. All are terminal for the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupErrorKind {
    NotInGroup,
    GroupDoesNotExist,
    LibraryAccessDenied,
    JoinGroupDenied,
    CreateGroupDenied,
}

impl GroupErrorKind {
    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "NotInGroup" => Some(GroupErrorKind::NotInGroup),
            "GroupDoesNotExist" => Some(GroupErrorKind::GroupDoesNotExist),
            "LibraryAccessDenied" => Some(GroupErrorKind::LibraryAccessDenied),
            "JoinGroupDenied" => Some(GroupErrorKind::JoinGroupDenied),
            "CreateGroupDenied" => Some(GroupErrorKind::CreateGroupDenied),
            _ => None,
        }
    }

    /// Access problems rather than a missing group
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            GroupErrorKind::LibraryAccessDenied
                | GroupErrorKind::JoinGroupDenied
                | GroupErrorKind::CreateGroupDenied
        )
    }
}

/// Decoded push-channel message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    KeepAlive,
    GroupJoined(GroupSnapshot),
    GroupLeft,
    Snapshot(GroupSnapshot),
    StateUpdate {
        state: GroupState,
        reason: Option<String>,
        position_ms: Option<u64>,
    },
    MemberJoined(String),
    MemberLeft(String),
    Command(PlaybackCommand),
    PlayQueue(PlayQueueUpdate),
    GroupError(GroupErrorKind),
}

// === Wire shapes ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEnvelope {
    message_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandWire {
    command: String,
    #[serde(default)]
    position_ticks: Option<i64>,
    #[serde(default)]
    playback_rate: Option<f64>,
    #[serde(default)]
    item_ids: Vec<String>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    start_index: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlaylistEntryWire {
    Full {
        #[serde(rename = "ItemId")]
        item_id: String,
        #[serde(rename = "PlaylistItemId", default)]
        playlist_item_id: Option<String>,
    },
    Bare(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlayQueueWire {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    playlist: Vec<PlaylistEntryWire>,
    #[serde(default, alias = "PlayingItemIndex")]
    playing_item_position: i64,
    #[serde(default)]
    start_position_ticks: i64,
    #[serde(default)]
    is_playing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParticipantWire {
    Name(String),
    Detailed {
        #[serde(rename = "ParticipantId", alias = "UserName")]
        participant_id: String,
        #[serde(rename = "IsReady", default)]
        ready: bool,
        #[serde(rename = "IsBuffering", default)]
        buffering: bool,
        #[serde(rename = "Latency", alias = "Ping", default)]
        latency_ms: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GroupInfoWire {
    group_id: String,
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    participants: Vec<ParticipantWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateUpdateWire {
    state: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    position_ticks: Option<i64>,
}

// === Decoding ===

/// Decode a raw push-channel frame
pub fn decode(text: &str) -> Result<InboundMessage, ProtocolError> {
    let envelope: RawEnvelope = serde_json::from_str(text)?;

    match envelope.message_type.as_str() {
        "KeepAlive" | "ForceKeepAlive" => Ok(InboundMessage::KeepAlive),
        "GroupJoined" => Ok(InboundMessage::GroupJoined(decode_group_info(envelope.data)?)),
        "GroupLeft" => Ok(InboundMessage::GroupLeft),
        "Command" | "SyncPlayCommand" => Ok(InboundMessage::Command(decode_command(envelope.data)?)),
        "PlayQueueUpdate" => Ok(InboundMessage::PlayQueue(decode_play_queue(envelope.data)?)),
        "GroupUpdate" | "SyncPlayGroupUpdate" => decode_group_update(envelope.data),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Group updates either carry a `Type` with nested `Data`, or (leniently)
/// a flat command / play queue / snapshot payload.
fn decode_group_update(data: Value) -> Result<InboundMessage, ProtocolError> {
    let update_type = data.get("Type").and_then(Value::as_str).map(str::to_string);

    let Some(update_type) = update_type else {
        if data.get("Command").is_some() {
            return Ok(InboundMessage::Command(decode_command(data)?));
        }
        if data.get("Playlist").is_some() {
            return Ok(InboundMessage::PlayQueue(decode_play_queue(data)?));
        }
        if data.get("GroupId").is_some() && data.get("State").is_some() {
            return Ok(InboundMessage::Snapshot(decode_group_info(data)?));
        }
        return Err(ProtocolError::MissingField("Type"));
    };

    let inner = data.get("Data").cloned().unwrap_or(Value::Null);

    if let Some(kind) = GroupErrorKind::from_wire(&update_type) {
        return Ok(InboundMessage::GroupError(kind));
    }

    match update_type.as_str() {
        "PlayQueue" => Ok(InboundMessage::PlayQueue(decode_play_queue(inner)?)),
        "StateUpdate" => {
            let wire: StateUpdateWire = serde_json::from_value(inner)?;
            let state = GroupState::from_wire(&wire.state).ok_or(ProtocolError::InvalidField("State"))?;
            Ok(InboundMessage::StateUpdate {
                state,
                reason: wire.reason,
                position_ms: wire.position_ticks.map(ticks_to_ms),
            })
        }
        "UserJoined" => Ok(InboundMessage::MemberJoined(string_payload(inner)?)),
        "UserLeft" => Ok(InboundMessage::MemberLeft(string_payload(inner)?)),
        "GroupJoined" => Ok(InboundMessage::GroupJoined(decode_group_info(inner)?)),
        "GroupLeft" => Ok(InboundMessage::GroupLeft),
        "GroupUpdate" | "GroupSnapshot" => Ok(InboundMessage::Snapshot(decode_group_info(inner)?)),
        "Command" => Ok(InboundMessage::Command(decode_command(inner)?)),
        other => Err(ProtocolError::UnknownType(format!("GroupUpdate/{}", other))),
    }
}

fn string_payload(value: Value) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ProtocolError::InvalidField("Data")),
    }
}

fn decode_command(data: Value) -> Result<PlaybackCommand, ProtocolError> {
    let wire: CommandWire = serde_json::from_value(data)?;
    let position = wire
        .position_ticks
        .map(ticks_to_ms)
        .ok_or(ProtocolError::MissingField("PositionTicks"));

    let command = match wire.command.to_ascii_lowercase().as_str() {
        "pause" => PlaybackCommand::Pause { position_ms: position? },
        "unpause" => PlaybackCommand::Unpause { position_ms: position? },
        "seek" => PlaybackCommand::Seek { position_ms: position? },
        "setrate" | "setplaybackrate" => PlaybackCommand::SetRate {
            rate: wire.playback_rate.ok_or(ProtocolError::MissingField("PlaybackRate"))?,
        },
        "play" => {
            if wire.item_ids.is_empty() {
                return Err(ProtocolError::MissingField("ItemIds"));
            }
            let start_index = usize::try_from(wire.start_index.unwrap_or(0))
                .map_err(|_| ProtocolError::InvalidField("StartIndex"))?;
            if start_index >= wire.item_ids.len() {
                return Err(ProtocolError::InvalidField("StartIndex"));
            }
            PlaybackCommand::Play {
                item_ids: wire.item_ids,
                start_index,
                start_position_ms: position.unwrap_or(0),
            }
        }
        "buffering" => PlaybackCommand::Buffering {
            item_id: wire
                .item_id
                .or_else(|| wire.item_ids.into_iter().next())
                .ok_or(ProtocolError::MissingField("ItemId"))?,
        },
        "stop" => PlaybackCommand::Stop,
        _ => return Err(ProtocolError::UnknownCommand(wire.command)),
    };
    Ok(command)
}

fn decode_play_queue(data: Value) -> Result<PlayQueueUpdate, ProtocolError> {
    let wire: PlayQueueWire = serde_json::from_value(data)?;

    let entries = wire
        .playlist
        .into_iter()
        .map(|entry| match entry {
            PlaylistEntryWire::Full { item_id, playlist_item_id } => PlaylistEntry {
                playlist_item_id: playlist_item_id.unwrap_or_else(|| item_id.clone()),
                item_id,
            },
            PlaylistEntryWire::Bare(item_id) => PlaylistEntry {
                playlist_item_id: item_id.clone(),
                item_id,
            },
        })
        .collect::<Vec<_>>();

    // A negative or out-of-range index means "nothing selected"; clamp to the head
    let playing_index = usize::try_from(wire.playing_item_position)
        .ok()
        .filter(|i| *i < entries.len())
        .unwrap_or(0);

    Ok(PlayQueueUpdate {
        reason: QueueReason::from_wire(&wire.reason),
        playlist: Playlist {
            entries,
            playing_index,
            start_position_ms: ticks_to_ms(wire.start_position_ticks),
        },
        is_playing: wire.is_playing,
    })
}

pub(crate) fn decode_group_info(data: Value) -> Result<GroupSnapshot, ProtocolError> {
    let wire: GroupInfoWire = serde_json::from_value(data)?;
    Ok(snapshot_from_wire(wire))
}

pub(crate) fn snapshot_from_wire(wire: GroupInfoWire) -> GroupSnapshot {
    let participants = wire
        .participants
        .into_iter()
        .map(|p| match p {
            ParticipantWire::Name(name) => Participant::named(name),
            ParticipantWire::Detailed { participant_id, ready, buffering, latency_ms } => Participant {
                participant_id,
                ready,
                buffering,
                latency_ms,
            },
        })
        .collect();

    GroupSnapshot {
        group_id: wire.group_id,
        group_name: wire.group_name,
        // Authorities that omit the state are treated as idle
        state: GroupState::from_wire(&wire.state).unwrap_or_default(),
        participants,
    }
}

/// Decide whether a play queue update should (re)start playback.
///
/// Starting reasons always produce a Play; other reasons only when the
/// selected item differs from the previously cached queue.
pub fn play_for_queue_update(update: &PlayQueueUpdate, previous: Option<&Playlist>) -> Option<PlaybackCommand> {
    let current = update.playlist.current()?;

    let changed_item = previous
        .and_then(|p| p.current())
        .map(|prev| prev.item_id != current.item_id)
        .unwrap_or(true);

    if !update.reason.starts_playback() && !changed_item {
        return None;
    }

    Some(PlaybackCommand::Play {
        item_ids: update.playlist.item_ids(),
        start_index: update.playlist.playing_index,
        start_position_ms: update.playlist.start_position_ms,
    })
}

// === Encoding ===

/// Request from this client to the authority
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundIntent {
    Pause,
    Unpause,
    Seek { position_ms: u64 },
    Play {
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ms: u64,
    },
    Stop,
    Ready {
        position_ms: u64,
        is_playing: bool,
        playlist_item_id: Option<String>,
    },
    Buffering {
        position_ms: u64,
        is_playing: bool,
        playlist_item_id: Option<String>,
    },
    Ping { latency_ms: u64 },
}

impl OutboundIntent {
    /// Short name for logs and acknowledgments
    pub fn name(&self) -> &'static str {
        match self {
            OutboundIntent::Pause => "Pause",
            OutboundIntent::Unpause => "Unpause",
            OutboundIntent::Seek { .. } => "Seek",
            OutboundIntent::Play { .. } => "SetNewQueue",
            OutboundIntent::Stop => "Stop",
            OutboundIntent::Ready { .. } => "Ready",
            OutboundIntent::Buffering { .. } => "Buffering",
            OutboundIntent::Ping { .. } => "Ping",
        }
    }
}

/// Encoded authority request
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub path: &'static str,
    pub body: Option<Value>,
}

/// Encode an intent as an authority request. `when` stamps ready/buffering reports.
pub fn encode(intent: &OutboundIntent, when: DateTime<Utc>) -> Result<OutboundRequest, serde_json::Error> {
    let (path, body) = match intent {
        OutboundIntent::Pause => ("/SyncPlay/Pause", None),
        OutboundIntent::Unpause => ("/SyncPlay/Unpause", None),
        OutboundIntent::Stop => ("/SyncPlay/Stop", None),
        OutboundIntent::Seek { position_ms } => (
            "/SyncPlay/Seek",
            Some(serde_json::to_value(SeekRequest {
                position_ticks: ms_to_ticks(*position_ms),
            })?),
        ),
        OutboundIntent::Play { item_ids, start_index, start_position_ms } => (
            "/SyncPlay/SetNewQueue",
            Some(serde_json::to_value(NewQueueRequest {
                playing_queue: item_ids.clone(),
                playing_item_position: *start_index as i64,
                start_position_ticks: ms_to_ticks(*start_position_ms),
            })?),
        ),
        OutboundIntent::Ready { position_ms, is_playing, playlist_item_id } => (
            "/SyncPlay/Ready",
            Some(serde_json::to_value(ReadyRequest {
                when,
                position_ticks: ms_to_ticks(*position_ms),
                is_playing: *is_playing,
                playlist_item_id: playlist_item_id.clone(),
            })?),
        ),
        OutboundIntent::Buffering { position_ms, is_playing, playlist_item_id } => (
            "/SyncPlay/Buffering",
            Some(serde_json::to_value(BufferingRequest {
                when,
                position_ticks: ms_to_ticks(*position_ms),
                is_playing: *is_playing,
                playlist_item_id: playlist_item_id.clone(),
            })?),
        ),
        OutboundIntent::Ping { latency_ms } => (
            "/SyncPlay/Ping",
            Some(serde_json::to_value(PingRequest { ping: *latency_ms as i64 })?),
        ),
    };
    Ok(OutboundRequest { path, body })
}
