//! Push channel transport

mod backoff;
mod link;

pub use backoff::reconnect_delay;
pub use link::{ConnectionState, LinkError, LinkEvent, LinkHandle, TransportLink};
