//! Shared types for Tilebind
//!
//! Plain data exchanged between the transport adapters, the binding core
//! and whatever renders tiles.

mod messages;
mod types;

pub use messages::*;
pub use types::*;
