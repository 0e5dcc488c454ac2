//! Remote video track to tile binding
//!
//! When a remote participant's track shows up on an established transport
//! session this crate:
//! - routes audio to the audio sink and drops our own echoed video
//! - creates a tile for every remote video track, replacing any tile the
//!   attendee already had
//! - waits (with full-jitter backoff) for the track to report its size
//! - resolves the attendee's external user id, directly or via presence
//! - releases every listener, subscription and timer exactly once when the
//!   track ends or the session is torn down

pub mod backoff;
pub mod capability;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod observer;
pub mod presence;
pub mod router;
pub mod tile;

pub use backoff::{Backoff, BackoffFactory, ConstantBackoff, FullJitterBackoff};
pub use capability::{CapabilityBackoffResolver, CapabilityResolution};
pub use cleanup::{ListenerRegistry, TrackLifecycleCleanup};
pub use config::{BackoffConfig, BindingConfig};
pub use coordinator::{PendingBinding, TileBindingCoordinator, TileState};
pub use error::{BindingError, Result};
pub use observer::{RemovableObserver, RemoteVideoObserver, SessionContext};
pub use presence::{PresenceAwaitingBinder, PresenceOutcome, PresenceWait};
pub use router::TrackEventRouter;
pub use tile::InMemoryTileRegistry;
