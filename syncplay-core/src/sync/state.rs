//! Group State Management

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Authority-side state of the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupState {
    /// Not in a group, or the group has nothing loaded
    #[default]
    Idle,
    /// The authority is waiting for members to finish buffering
    Waiting,
    /// Playback is paused group-wide
    Paused,
    /// Playback is running group-wide
    Playing,
}

impl GroupState {
    /// Parse the authority's state name (case-insensitive)
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "idle" => Some(GroupState::Idle),
            "waiting" => Some(GroupState::Waiting),
            "paused" => Some(GroupState::Paused),
            "playing" => Some(GroupState::Playing),
            _ => None,
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::Idle => "Idle",
            GroupState::Waiting => "Waiting",
            GroupState::Paused => "Paused",
            GroupState::Playing => "Playing",
        };
        f.write_str(name)
    }
}

/// Member of a group, for UI reporting only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub participant_id: String,
    pub ready: bool,
    pub buffering: bool,
    /// Latency the authority measured for this member, if reported
    pub latency_ms: Option<u64>,
}

impl Participant {
    pub fn named(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            ready: false,
            buffering: false,
            latency_ms: None,
        }
    }
}

/// One entry of the authority's play queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// Media item id (what the player loads)
    pub item_id: String,
    /// Queue-slot id (what ready reports must carry)
    pub playlist_item_id: String,
}

/// Cached play queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub entries: Vec<PlaylistEntry>,
    pub playing_index: usize,
    pub start_position_ms: u64,
}

impl Playlist {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Media item ids in queue order
    pub fn item_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.item_id.clone()).collect()
    }

    /// Entry currently selected by the authority
    pub fn current(&self) -> Option<&PlaylistEntry> {
        self.entries.get(self.playing_index)
    }

    /// Map a media item id to its queue-slot id
    pub fn playlist_item_id(&self, item_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.item_id == item_id)
            .map(|e| e.playlist_item_id.as_str())
    }
}

/// Group snapshot as reported by the authority (join notification or poll)
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub group_name: String,
    pub state: GroupState,
    pub participants: Vec<Participant>,
}

/// State of the group we are in
#[derive(Debug, Clone)]
pub struct GroupSession {
    /// Unknown until the authority confirms a freshly created group
    pub group_id: Option<String>,
    pub group_name: String,
    pub state: GroupState,
    pub participants: HashMap<String, Participant>,
    pub playlist: Option<Playlist>,
    /// When we last received any protocol message for this group
    pub last_message: Instant,
}

impl GroupSession {
    pub fn new(group_id: Option<String>, group_name: String) -> Self {
        Self {
            group_id,
            group_name,
            state: GroupState::Idle,
            participants: HashMap::new(),
            playlist: None,
            last_message: Instant::now(),
        }
    }

    /// Participants sorted by id (case-insensitive)
    pub fn participant_list(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| {
            a.participant_id
                .to_lowercase()
                .cmp(&b.participant_id.to_lowercase())
        });
        list
    }

    /// Replace membership wholesale
    pub fn replace_participants(&mut self, participants: Vec<Participant>) {
        self.participants = participants
            .into_iter()
            .map(|p| (p.participant_id.clone(), p))
            .collect();
    }

    /// Add a participant. Returns false if already known.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        self.participants
            .insert(participant.participant_id.clone(), participant)
            .is_none()
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        self.participants.remove(participant_id)
    }

    pub fn touch(&mut self) {
        self.last_message = Instant::now();
    }

    /// True when no protocol message arrived within `window`
    pub fn is_quiet(&self, window: Duration) -> bool {
        self.last_message.elapsed() >= window
    }
}

/// Represents the group we're in (or not)
#[derive(Debug, Default)]
pub enum Group {
    /// Not in any group
    #[default]
    None,
    /// Join or create request in flight
    Joining { group_id: Option<String> },
    /// In an active group
    Active(GroupSession),
}

impl Group {
    pub fn is_active(&self) -> bool {
        matches!(self, Group::Active(_))
    }

    /// Creating, joining or active
    pub fn is_busy(&self) -> bool {
        !matches!(self, Group::None)
    }

    pub fn session(&self) -> Option<&GroupSession> {
        match self {
            Group::Active(session) => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut GroupSession> {
        match self {
            Group::Active(session) => Some(session),
            _ => None,
        }
    }
}
