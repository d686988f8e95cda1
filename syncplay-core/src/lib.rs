//! SyncPlay Core Library
//!
//! Client-side engine for group playback synchronization: it keeps a local
//! media player in step with a group whose shared state is owned by a
//! remote authority.

pub mod authority;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod ffi;
pub mod group;
pub mod latency;
pub mod player;
pub mod position;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::SyncConfig;
pub use engine::{ErrorKind, SyncEngine, SyncError, SyncEvent};
pub use player::Player;
pub use sync::{GroupSnapshot, GroupState, Participant, PlaybackCommand};
pub use transport::ConnectionState;

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
