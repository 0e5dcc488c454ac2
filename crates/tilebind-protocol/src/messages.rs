use serde::{Deserialize, Serialize};

use crate::types::{AttendeeId, TrackId};

/// State transitions a track or stream can signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackEvent {
    /// The track stopped producing media for good
    Ended,
    Mute,
    Unmute,
    IsolationChange,
    Overconstrained,
    /// A track was removed from its stream (stream-level signal)
    RemoveTrack,
}

impl TrackEvent {
    /// Transitions worth logging while a remote video track is alive
    pub const DIAGNOSTIC: [TrackEvent; 5] = [
        TrackEvent::Ended,
        TrackEvent::Mute,
        TrackEvent::Unmute,
        TrackEvent::IsolationChange,
        TrackEvent::Overconstrained,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackEvent::Ended => "ended",
            TrackEvent::Mute => "mute",
            TrackEvent::Unmute => "unmute",
            TrackEvent::IsolationChange => "isolationchange",
            TrackEvent::Overconstrained => "overconstrained",
            TrackEvent::RemoveTrack => "removetrack",
        }
    }
}

impl std::fmt::Display for TrackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal delivered to track and stream listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackSignal {
    pub event: TrackEvent,
    /// Track the signal is about. For stream-level signals this is the
    /// track that was added or removed.
    pub track_id: TrackId,
}

/// Attendee presence update delivered by the presence feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub attendee_id: AttendeeId,
    pub present: bool,
    pub external_user_id: Option<String>,
}

impl PresenceEvent {
    /// True when this event announces `attendee_id` as present with a known
    /// external identity
    pub fn resolves(&self, attendee_id: &str) -> Option<&str> {
        if self.attendee_id == attendee_id && self.present {
            self.external_user_id.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_event_matching() {
        let event = PresenceEvent {
            attendee_id: "a1".to_string(),
            present: true,
            external_user_id: Some("u-42".to_string()),
        };
        assert_eq!(event.resolves("a1"), Some("u-42"));
        assert_eq!(event.resolves("a2"), None);

        let left = PresenceEvent {
            present: false,
            ..event.clone()
        };
        assert_eq!(left.resolves("a1"), None);

        let anonymous = PresenceEvent {
            external_user_id: None,
            ..event
        };
        assert_eq!(anonymous.resolves("a1"), None);
    }

    #[test]
    fn test_presence_event_wire_format() {
        let json = r#"{"attendee_id":"a1","present":true,"external_user_id":"ext-7"}"#;
        let event: PresenceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.resolves("a1"), Some("ext-7"));
    }

    #[test]
    fn test_track_event_names() {
        assert_eq!(TrackEvent::RemoveTrack.to_string(), "removetrack");
        let json = serde_json::to_string(&TrackEvent::IsolationChange).unwrap();
        assert_eq!(json, "\"isolation_change\"");
    }
}
