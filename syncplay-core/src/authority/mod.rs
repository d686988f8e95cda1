//! Authority API Client
//!
//! REST side of the group authority: group lifecycle and playback requests.

mod client;
pub mod types;

pub use client::{AuthorityClient, AuthorityError};
