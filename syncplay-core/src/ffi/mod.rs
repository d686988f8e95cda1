//! FFI bindings for native host apps
//!
//! This module provides the interface exposed via uniffi to Swift/Kotlin.

mod session;
mod types;

pub use session::*;
pub use types::*;
