//! Sync Protocol
//!
//! Wire format, typed commands, group state and the inbound filters.

pub mod clock;
pub mod filters;
mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
