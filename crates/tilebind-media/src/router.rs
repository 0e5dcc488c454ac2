//! Classifying tracks added by the transport session

use std::sync::{Arc, Mutex};

use tilebind_protocol::{ListenerId, TrackKind};

use crate::collaborators::{AudioSink, MediaStream, MediaTrack, TrackAddedHandler, TransportSession};
use crate::coordinator::TileBindingCoordinator;

/// Sends audio to the audio sink, drops our own echoed video and hands
/// every other video track to the [`TileBindingCoordinator`]
pub struct TrackEventRouter {
    session: Arc<dyn TransportSession>,
    audio_sink: Arc<dyn AudioSink>,
    coordinator: Arc<TileBindingCoordinator>,
    listener: Mutex<Option<ListenerId>>,
}

impl TrackEventRouter {
    pub fn new(
        session: Arc<dyn TransportSession>,
        audio_sink: Arc<dyn AudioSink>,
        coordinator: Arc<TileBindingCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            audio_sink,
            coordinator,
            listener: Mutex::new(None),
        })
    }

    /// Register the track-added listener. Only one is ever registered;
    /// calling again while subscribed does nothing.
    pub fn subscribe(self: &Arc<Self>) {
        let mut listener = self.lock_listener();
        if listener.is_some() {
            tracing::debug!("Track router already subscribed");
            return;
        }

        let router = Arc::downgrade(self);
        let handler: TrackAddedHandler =
            Arc::new(move |track: Arc<dyn MediaTrack>, stream: Arc<dyn MediaStream>| {
                if let Some(router) = router.upgrade() {
                    router.on_track_added(track, stream);
                }
            });
        *listener = Some(self.session.add_track_listener(handler));
        tracing::debug!("Track router subscribed to transport session");
    }

    /// Remove the track-added listener, if any. Safe to call repeatedly or
    /// without ever subscribing.
    pub fn unsubscribe(&self) {
        let Some(id) = self.lock_listener().take() else {
            return;
        };
        self.session.remove_track_listener(id);
        tracing::debug!("Track router unsubscribed from transport session");
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock_listener().is_some()
    }

    pub fn on_track_added(&self, track: Arc<dyn MediaTrack>, stream: Arc<dyn MediaStream>) {
        match track.kind() {
            TrackKind::Audio => {
                tracing::debug!("Audio track {} added, binding stream {}", track.id(), stream.id());
                self.audio_sink.bind_audio_stream(stream);
            }
            TrackKind::Video if self.session.is_local_video(track.as_ref()) => {
                tracing::debug!("Ignoring local video track {} echoed back", track.id());
            }
            TrackKind::Video => {
                self.coordinator.on_remote_video_track_added(track, stream);
            }
        }
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<ListenerId>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::TrackLifecycleCleanup;
    use crate::config::BindingConfig;
    use crate::memory::{SimulatedSession, SimulatedStream, SimulatedTrack};
    use tilebind_protocol::{CapabilitySnapshot, NegotiationMode};

    fn router(session: &SimulatedSession) -> Arc<TrackEventRouter> {
        let config = BindingConfig::default();
        let coordinator = TileBindingCoordinator::new(
            &session.context(),
            &config,
            Arc::new(config.backoff.clone()),
            Arc::new(TrackLifecycleCleanup::new()),
        );
        TrackEventRouter::new(session.transport.clone(), session.audio.clone(), coordinator)
    }

    #[tokio::test]
    async fn test_audio_goes_to_audio_sink() {
        let session = SimulatedSession::new(NegotiationMode::UnifiedPlan);
        let router = router(&session);
        router.subscribe();

        let audio = SimulatedTrack::audio("mic");
        let stream = SimulatedStream::new("stream-a1", vec![audio.clone()]);
        session.stream_index.insert("mic", "a1", Some(1));
        session.transport.add_track(audio, stream);

        assert_eq!(session.audio.bound_streams(), vec!["stream-a1".to_string()]);
        assert!(session.tiles.is_empty());
    }

    #[tokio::test]
    async fn test_local_video_echo_is_ignored() {
        let session = SimulatedSession::new(NegotiationMode::UnifiedPlan);
        let router = router(&session);
        router.subscribe();

        session.transport.set_local_video("camera");
        let (track, stream) = session.remote_video("camera", "self", Some(1));
        track.set_settings(CapabilitySnapshot::new(640, 480));
        session.transport.add_track(track, stream);

        assert!(session.tiles.is_empty());
        assert!(session.audio.bound_streams().is_empty());
    }

    #[tokio::test]
    async fn test_remote_video_creates_tile() {
        let session = SimulatedSession::new(NegotiationMode::UnifiedPlan);
        let router = router(&session);
        router.subscribe();

        let (track, stream) = session.remote_video("t1", "a1", Some(1));
        track.set_settings(CapabilitySnapshot::new(640, 480));
        session.identity.insert("a1", "u-1");
        session.transport.add_track(track, stream);

        assert_eq!(session.tiles.tiles_for_attendee("a1").len(), 1);
    }

    #[tokio::test]
    async fn test_single_listener_and_idempotent_unsubscribe() {
        let session = SimulatedSession::new(NegotiationMode::UnifiedPlan);
        let router = router(&session);

        // Never subscribed
        router.unsubscribe();
        assert_eq!(session.transport.listener_count(), 0);

        router.subscribe();
        router.subscribe();
        assert_eq!(session.transport.listener_count(), 1);
        assert!(router.is_subscribed());

        router.unsubscribe();
        router.unsubscribe();
        assert_eq!(session.transport.listener_count(), 0);
        assert!(!router.is_subscribed());
    }
}
