//! Binding remote video tracks to tiles
//!
//! For every remote video track the coordinator creates a tile, waits for
//! the track's dimensions, resolves the owning attendee's external user id
//! (directly or through the presence feed) and binds the tile. Everything
//! it registers along the way lands in the track's [`ListenerRegistry`] and
//! is released exactly once when the track ends, is removed, is superseded
//! by a newer track for the same attendee, or the session tears down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilebind_protocol::{
    AttendeeId, NegotiationMode, StreamId, TileBinding, TileId, TrackEvent, TrackId, TrackSignal,
};

use crate::backoff::BackoffFactory;
use crate::capability::{CapabilityBackoffResolver, CapabilityResolution};
use crate::cleanup::{ListenerRegistry, TrackLifecycleCleanup};
use crate::collaborators::{
    IdentityDirectory, MediaStream, MediaTrack, PausedStreamTracker, StreamIndex, TileRegistry,
    TrackListener, TransportSession,
};
use crate::config::BindingConfig;
use crate::error::BindingError;
use crate::observer::SessionContext;
use crate::presence::PresenceAwaitingBinder;

/// A tile waiting for its track's dimensions and attendee identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBinding {
    pub track_id: TrackId,
    pub tile_id: TileId,
    pub attendee_id: AttendeeId,
    pub stream_id: Option<StreamId>,
}

/// What the coordinator remembers about a live remote video track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileState {
    pub tile_id: TileId,
    pub attendee_id: AttendeeId,
    pub stream_id: Option<StreamId>,
}

pub struct TileBindingCoordinator {
    session: Arc<dyn TransportSession>,
    stream_index: Arc<dyn StreamIndex>,
    identity: Arc<dyn IdentityDirectory>,
    tiles: Arc<dyn TileRegistry>,
    paused_streams: Arc<dyn PausedStreamTracker>,
    resolver: CapabilityBackoffResolver,
    binder: PresenceAwaitingBinder,
    cleanup: Arc<TrackLifecycleCleanup>,
    presence_timeout: Duration,
    tracks: Mutex<HashMap<TrackId, TileState>>,
}

impl TileBindingCoordinator {
    pub fn new(
        context: &SessionContext,
        config: &BindingConfig,
        backoff: Arc<dyn BackoffFactory>,
        cleanup: Arc<TrackLifecycleCleanup>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session: context.session.clone(),
            stream_index: context.stream_index.clone(),
            identity: context.identity.clone(),
            tiles: context.tiles.clone(),
            paused_streams: context.paused_streams.clone(),
            resolver: CapabilityBackoffResolver::new(backoff),
            binder: PresenceAwaitingBinder::new(context.presence.clone(), context.tiles.clone()),
            cleanup,
            presence_timeout: config.presence_timeout(),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    /// Create and bind a tile for a newly added remote video track.
    ///
    /// Must be called from within a tokio runtime: dimension retries and
    /// presence timeouts run as tasks.
    pub fn on_remote_video_track_added(
        self: &Arc<Self>,
        track: Arc<dyn MediaTrack>,
        stream: Arc<dyn MediaStream>,
    ) {
        let track_id = track.id();
        let Some(attendee_id) = self.stream_index.attendee_id_for_track(&track_id) else {
            tracing::warn!("{}, ignoring it", BindingError::UnknownAttendee { track_id });
            return;
        };

        if self.cleanup.is_released() {
            tracing::debug!("Session torn down, ignoring remote video track {}", track_id);
            return;
        }

        self.remove_existing_tiles(&track_id, &attendee_id);

        let tile_id = self.tiles.add_tile();
        let stream_id = self.stream_index.stream_id_for_track(&track_id);
        if stream_id.is_none() {
            tracing::warn!(
                "No stream id for track {} (attendee {}), binding without one",
                track_id,
                attendee_id
            );
        }
        tracing::info!(
            "Created tile {} for attendee {} (track {}, stream {:?})",
            tile_id,
            attendee_id,
            track_id,
            stream_id
        );

        let registry = self.cleanup.open_track(&track_id);
        self.lock_tracks().insert(
            track_id.clone(),
            TileState {
                tile_id,
                attendee_id: attendee_id.clone(),
                stream_id,
            },
        );

        self.attach_diagnostics(&registry, stream.as_ref());

        let pending = PendingBinding {
            track_id: track_id.clone(),
            tile_id,
            attendee_id,
            stream_id,
        };
        match self.resolver.try_resolve_now(track.as_ref()) {
            Some((width, height)) => self.bind_or_await(&registry, pending, width, height),
            None => self.resolve_in_background(&registry, track.clone(), pending),
        }

        self.attach_removal_trigger(&registry, &track, &stream);
    }

    /// Tear down everything held for `track_id` and remove its tile.
    ///
    /// Returns false when the track was already removed, so repeated end
    /// signals are harmless.
    pub fn remove_remote_video_track(&self, track_id: &str) -> bool {
        let Some(state) = self.lock_tracks().remove(track_id) else {
            tracing::debug!("Remote video track {} already removed", track_id);
            return false;
        };

        let released = self.cleanup.release_track(track_id);
        tracing::debug!("Released {} listeners for track {}", released, track_id);

        self.drop_paused_stream(track_id, state.stream_id);
        self.tiles.remove_tile(state.tile_id);
        tracing::info!(
            "Removed remote video track {} and tile {} (attendee {})",
            track_id,
            state.tile_id,
            state.attendee_id
        );
        true
    }

    /// Forget every track. Listener release is the caller's job, through the
    /// shared [`TrackLifecycleCleanup`].
    pub(crate) fn clear(&self) {
        self.lock_tracks().clear();
    }

    pub fn tile_for_track(&self, track_id: &str) -> Option<TileId> {
        self.lock_tracks().get(track_id).map(|state| state.tile_id)
    }

    pub fn tile_state(&self, track_id: &str) -> Option<TileState> {
        self.lock_tracks().get(track_id).cloned()
    }

    pub fn tracked_tracks(&self) -> Vec<TrackId> {
        self.lock_tracks().keys().cloned().collect()
    }

    /// Drop tiles an attendee already has, and abandon whatever the tracks
    /// behind them were still waiting for. A delayed removal for an earlier
    /// track must not leave two tiles for one attendee.
    fn remove_existing_tiles(&self, track_id: &str, attendee_id: &str) {
        let mut removed = self.tiles.remove_tiles_by_attendee_id(attendee_id);

        let superseded: Vec<(TrackId, TileState)> = {
            let mut tracks = self.lock_tracks();
            let ids: Vec<TrackId> = tracks
                .iter()
                .filter(|(id, state)| id.as_str() == track_id || state.attendee_id == attendee_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tracks.remove(&id).map(|state| (id, state)))
                .collect()
        };

        // Releasing the old registry also drops its end trigger, so the
        // paused stream has to go here
        for (old_track_id, state) in superseded {
            self.cleanup.release_track(&old_track_id);
            self.drop_paused_stream(&old_track_id, state.stream_id);
            if !removed.contains(&state.tile_id) && self.tiles.remove_tile(state.tile_id) {
                removed.push(state.tile_id);
            }
            tracing::debug!(
                "Abandoned binding of track {} superseded by track {}",
                old_track_id,
                track_id
            );
        }

        if !removed.is_empty() {
            tracing::info!(
                "Removed {} existing tile(s) for attendee {} before binding track {}",
                removed.len(),
                attendee_id,
                track_id
            );
        }
    }

    fn drop_paused_stream(&self, track_id: &str, stream_id: Option<StreamId>) {
        match stream_id {
            Some(stream_id) => self.paused_streams.remove(stream_id),
            None => tracing::warn!(
                "Track {} ended without a stream id, nothing to drop from paused streams",
                track_id
            ),
        }
    }

    fn attach_diagnostics(&self, registry: &ListenerRegistry, stream: &dyn MediaStream) {
        let Some(video) = stream.video_tracks().into_iter().next() else {
            tracing::debug!(
                "Stream {} has no video tracks, skipping state listeners",
                stream.id()
            );
            return;
        };

        for event in TrackEvent::DIAGNOSTIC {
            let listener: TrackListener = Arc::new(|signal: &TrackSignal| {
                tracing::debug!("Remote video track {} {}", signal.track_id, signal.event);
            });
            let id = video.add_listener(event, listener);
            let video = video.clone();
            registry.register(format!("{} listener", event), move || {
                video.remove_listener(id);
            });
        }
    }

    /// Removal runs at most once per track: the first end signal takes the
    /// track out of the map, later ones find nothing.
    fn attach_removal_trigger(
        self: &Arc<Self>,
        registry: &ListenerRegistry,
        track: &Arc<dyn MediaTrack>,
        stream: &Arc<dyn MediaStream>,
    ) {
        let coordinator = Arc::downgrade(self);
        let own_track_id = track.id();
        let trigger: TrackListener = Arc::new(move |signal: &TrackSignal| {
            if signal.track_id != own_track_id {
                return;
            }
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.remove_remote_video_track(&own_track_id);
            }
        });

        match self.session.negotiation_mode() {
            NegotiationMode::UnifiedPlan => {
                let id = stream.add_listener(TrackEvent::RemoveTrack, trigger);
                let stream = stream.clone();
                registry.register("removetrack trigger", move || {
                    stream.remove_listener(id);
                });
            }
            NegotiationMode::PlanB => {
                let id = track.add_listener(TrackEvent::Ended, trigger);
                let track = track.clone();
                registry.register("ended trigger", move || {
                    track.remove_listener(id);
                });
            }
        }
    }

    fn resolve_in_background(
        self: &Arc<Self>,
        registry: &Arc<ListenerRegistry>,
        track: Arc<dyn MediaTrack>,
        pending: PendingBinding,
    ) {
        let coordinator = Arc::downgrade(self);
        let resolver = self.resolver.clone();
        let task_registry = registry.clone();

        let task = tokio::spawn(async move {
            let resolution = resolver.retry(track.as_ref()).await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };

            match resolution {
                CapabilityResolution::Ready {
                    width,
                    height,
                    retries,
                } => {
                    tracing::debug!(
                        "Track {} reported {}x{} after {} retries",
                        pending.track_id,
                        width,
                        height,
                        retries
                    );
                    coordinator.bind_or_await(&task_registry, pending, width, height);
                }
                CapabilityResolution::Exhausted { attempts } => {
                    tracing::warn!(
                        "{}, tile {} left unbound",
                        BindingError::CapabilityExhausted {
                            track_id: pending.track_id.clone(),
                            attempts,
                        },
                        pending.tile_id
                    );
                }
            }
        });

        registry.register("capability backoff", move || task.abort());
    }

    fn bind_or_await(
        &self,
        registry: &ListenerRegistry,
        pending: PendingBinding,
        width: u32,
        height: u32,
    ) {
        if registry.is_released() {
            tracing::debug!(
                "Track {} went away before tile {} could be bound",
                pending.track_id,
                pending.tile_id
            );
            return;
        }

        match self
            .identity
            .external_user_id_from_attendee_id(&pending.attendee_id)
        {
            Some(external_user_id) => {
                self.tiles.bind_video_stream(
                    pending.tile_id,
                    TileBinding {
                        attendee_id: pending.attendee_id.clone(),
                        external_user_id: external_user_id.clone(),
                        width,
                        height,
                        stream_id: pending.stream_id,
                    },
                );
                tracing::info!(
                    "Bound tile {} to attendee {} ({}) at {}x{}",
                    pending.tile_id,
                    pending.attendee_id,
                    external_user_id,
                    width,
                    height
                );
            }
            None => {
                let wait =
                    self.binder
                        .await_external_id(pending, width, height, self.presence_timeout);
                registry.register("presence subscription", move || {
                    wait.cancel();
                });
            }
        }
    }

    fn lock_tracks(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, TileState>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
