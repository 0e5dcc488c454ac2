use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session-local participant identifier, as assigned by the stream index
pub type AttendeeId = String;

/// Identifier of a media track as reported by the transport
pub type TrackId = String;

/// Server-assigned numeric identifier of a video stream
pub type StreamId = u32;

/// Identifier of a rendering tile
pub type TileId = u64;

/// Handle returned when registering a track, stream or session listener
pub type ListenerId = Uuid;

/// Handle returned when subscribing to the presence feed
pub type SubscriptionId = Uuid;

/// Media kind of a track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// How the session negotiates media sections.
///
/// The signal that ends a remote track differs between the two: unified plan
/// removes the track from its stream, plan-b ends the track itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationMode {
    #[default]
    UnifiedPlan,
    PlanB,
}

/// Point-in-time read of a track's reported dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CapabilitySnapshot {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl CapabilitySnapshot {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }

    /// Both dimensions, if both have been reported
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.dimensions().is_some()
    }
}

/// A rendering placeholder for one remote video track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tile {
    pub id: TileId,
    pub bound_attendee_id: Option<AttendeeId>,
    pub external_user_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub stream_id: Option<StreamId>,
    pub paused: bool,
}

impl Tile {
    /// A freshly created tile with nothing bound to it
    pub fn new(id: TileId) -> Self {
        Self {
            id,
            bound_attendee_id: None,
            external_user_id: None,
            width: 0,
            height: 0,
            stream_id: None,
            paused: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_attendee_id.is_some()
    }

    pub fn apply(&mut self, binding: TileBinding) {
        self.bound_attendee_id = Some(binding.attendee_id);
        self.external_user_id = Some(binding.external_user_id);
        self.width = binding.width;
        self.height = binding.height;
        self.stream_id = binding.stream_id;
    }
}

/// Everything needed to bind a tile to a remote attendee's video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TileBinding {
    pub attendee_id: AttendeeId,
    pub external_user_id: String,
    pub width: u32,
    pub height: u32,
    pub stream_id: Option<StreamId>,
}
