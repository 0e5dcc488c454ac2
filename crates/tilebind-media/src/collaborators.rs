//! Contracts for the services the binding core talks to
//!
//! None of these are implemented here beyond the in-memory versions in
//! [`crate::memory`]; the transport, directory and presence services belong
//! to the host application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use tilebind_protocol::{
    AttendeeId, CapabilitySnapshot, ListenerId, NegotiationMode, PresenceEvent, StreamId,
    SubscriptionId, Tile, TileBinding, TileId, TrackEvent, TrackId, TrackKind, TrackSignal,
};

/// Callback attached to a track or stream event
pub type TrackListener = Arc<dyn Fn(&TrackSignal) + Send + Sync>;

/// Callback invoked by the transport for every newly added remote track
pub type TrackAddedHandler = Arc<dyn Fn(Arc<dyn MediaTrack>, Arc<dyn MediaStream>) + Send + Sync>;

/// Callback invoked by the presence feed for every presence event
pub type PresenceHandler = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

/// A remote (or local) media track
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> TrackId;
    fn kind(&self) -> TrackKind;
    /// Live, negotiated view of the track. `None` when the platform does
    /// not expose one.
    fn settings(&self) -> Option<CapabilitySnapshot>;
    /// Static view of what the track can produce
    fn capabilities(&self) -> CapabilitySnapshot;
    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// A group of tracks delivered together by the transport
pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>>;
    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// The established transport session
pub trait TransportSession: Send + Sync {
    fn add_track_listener(&self, handler: TrackAddedHandler) -> ListenerId;
    fn remove_track_listener(&self, id: ListenerId) -> bool;
    /// True when `track` is our own outgoing video echoed back
    fn is_local_video(&self, track: &dyn MediaTrack) -> bool;
    fn negotiation_mode(&self) -> NegotiationMode;
}

pub trait StreamIndex: Send + Sync {
    fn attendee_id_for_track(&self, track_id: &str) -> Option<AttendeeId>;
    fn stream_id_for_track(&self, track_id: &str) -> Option<StreamId>;
}

pub trait IdentityDirectory: Send + Sync {
    /// `None` means the external id is not known yet
    fn external_user_id_from_attendee_id(&self, attendee_id: &str) -> Option<String>;
}

/// Source of attendee presence updates.
///
/// Implementations must not hold internal locks while invoking handlers: a
/// handler may unsubscribe itself from inside the callback.
pub trait PresenceFeed: Send + Sync {
    fn subscribe(&self, handler: PresenceHandler) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

pub trait TileRegistry: Send + Sync {
    fn add_tile(&self) -> TileId;
    /// Returns false if the tile no longer exists
    fn bind_video_stream(&self, tile_id: TileId, binding: TileBinding) -> bool;
    fn remove_tile(&self, tile_id: TileId) -> bool;
    fn remove_tiles_by_attendee_id(&self, attendee_id: &str) -> Vec<TileId>;
    fn tile(&self, tile_id: TileId) -> Option<Tile>;
}

pub trait AudioSink: Send + Sync {
    fn bind_audio_stream(&self, stream: Arc<dyn MediaStream>);
}

pub trait PausedStreamTracker: Send + Sync {
    fn remove(&self, stream_id: StreamId);
}

/// Listeners keyed by handle, each attached to one event.
///
/// `emit` copies the matching listeners out before calling them, so a
/// listener may add or remove listeners (itself included) while it runs.
/// A listener removed partway through an `emit` is not called by it.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<HashMap<ListenerId, (TrackEvent, TrackListener)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: TrackEvent, listener: TrackListener) -> ListenerId {
        let id = Uuid::new_v4();
        self.lock().insert(id, (event, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Deliver `signal` to every listener registered for its event.
    /// Returns how many listeners were called.
    pub fn emit(&self, signal: &TrackSignal) -> usize {
        let matching: Vec<(ListenerId, TrackListener)> = self
            .lock()
            .iter()
            .filter(|(_, (event, _))| *event == signal.event)
            .map(|(id, (_, listener))| (*id, listener.clone()))
            .collect();

        let mut called = 0;
        for (id, listener) in &matching {
            if !self.lock().contains_key(id) {
                continue;
            }
            listener(signal);
            called += 1;
        }
        called
    }

    pub fn count(&self, event: TrackEvent) -> usize {
        self.lock().values().filter(|(e, _)| *e == event).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ListenerId, (TrackEvent, TrackListener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn signal(event: TrackEvent) -> TrackSignal {
        TrackSignal {
            event,
            track_id: "t1".to_string(),
        }
    }

    #[test]
    fn test_emit_only_matching_event() {
        let set = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        set.add(
            TrackEvent::Mute,
            Arc::new(move |_: &TrackSignal| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(set.emit(&signal(TrackEvent::Unmute)), 0);
        assert_eq!(set.emit(&signal(TrackEvent::Mute)), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let set = Arc::new(ListenerSet::new());
        let own_id = Arc::new(Mutex::new(None));

        let set_ref = set.clone();
        let id_ref = own_id.clone();
        let id = set.add(
            TrackEvent::Ended,
            Arc::new(move |_: &TrackSignal| {
                if let Some(id) = *id_ref.lock().unwrap() {
                    set_ref.remove(id);
                }
            }),
        );
        *own_id.lock().unwrap() = Some(id);

        assert_eq!(set.emit(&signal(TrackEvent::Ended)), 1);
        assert!(set.is_empty());
        assert_eq!(set.emit(&signal(TrackEvent::Ended)), 0);
    }

    #[test]
    fn test_listener_removed_mid_emit_is_skipped() {
        let set = Arc::new(ListenerSet::new());
        let ids: Arc<Mutex<Vec<ListenerId>>> = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        // Whichever runs first removes every listener, the other one included
        for _ in 0..2 {
            let set_ref = set.clone();
            let ids_ref = ids.clone();
            let counter = calls.clone();
            let id = set.add(
                TrackEvent::Ended,
                Arc::new(move |_: &TrackSignal| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    for id in ids_ref.lock().unwrap().iter() {
                        set_ref.remove(*id);
                    }
                }),
            );
            ids.lock().unwrap().push(id);
        }

        assert_eq!(set.emit(&signal(TrackEvent::Ended)), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
