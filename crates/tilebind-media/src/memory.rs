//! In-memory collaborators
//!
//! Self-contained implementations of every collaborator contract. The
//! simulator binary replays sessions against them, and the tests use them
//! to drive the binding protocol under virtual time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use tilebind_protocol::{
    AttendeeId, CapabilitySnapshot, ListenerId, NegotiationMode, PresenceEvent, StreamId,
    SubscriptionId, TrackEvent, TrackId, TrackKind, TrackSignal,
};

use crate::collaborators::{
    AudioSink, IdentityDirectory, ListenerSet, MediaStream, MediaTrack, PausedStreamTracker,
    PresenceFeed, PresenceHandler, StreamIndex, TrackAddedHandler, TrackListener,
    TransportSession,
};
use crate::observer::SessionContext;
use crate::tile::InMemoryTileRegistry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct TrackView {
    /// `None` simulates a platform without a live settings view
    settings: Option<CapabilitySnapshot>,
    capabilities: CapabilitySnapshot,
    /// Dimensions that appear in `settings` once `hidden_reads` reaches 0
    reveal: Option<(CapabilitySnapshot, usize)>,
}

/// A media track whose dimensions and events are driven by the caller
pub struct SimulatedTrack {
    id: TrackId,
    kind: TrackKind,
    view: Mutex<TrackView>,
    settings_reads: AtomicUsize,
    listeners: ListenerSet,
}

impl SimulatedTrack {
    pub fn new(id: impl Into<TrackId>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            view: Mutex::new(TrackView {
                settings: Some(CapabilitySnapshot::default()),
                ..Default::default()
            }),
            settings_reads: AtomicUsize::new(0),
            listeners: ListenerSet::new(),
        })
    }

    pub fn video(id: impl Into<TrackId>) -> Arc<Self> {
        Self::new(id, TrackKind::Video)
    }

    pub fn audio(id: impl Into<TrackId>) -> Arc<Self> {
        Self::new(id, TrackKind::Audio)
    }

    pub fn set_settings(&self, snapshot: CapabilitySnapshot) {
        lock(&self.view).settings = Some(snapshot);
    }

    pub fn set_capabilities(&self, snapshot: CapabilitySnapshot) {
        lock(&self.view).capabilities = snapshot;
    }

    /// Drop the live settings view entirely
    pub fn clear_settings_view(&self) {
        lock(&self.view).settings = None;
    }

    /// Report empty settings for the next `hidden_reads` reads, then
    /// `snapshot` from then on
    pub fn reveal_dimensions_after(&self, snapshot: CapabilitySnapshot, hidden_reads: usize) {
        let mut view = lock(&self.view);
        view.settings = Some(CapabilitySnapshot::default());
        view.reveal = Some((snapshot, hidden_reads));
    }

    pub fn settings_reads(&self) -> usize {
        self.settings_reads.load(Ordering::SeqCst)
    }

    /// Fire `event` at this track's listeners
    pub fn emit(&self, event: TrackEvent) -> usize {
        self.listeners.emit(&TrackSignal {
            event,
            track_id: self.id.clone(),
        })
    }

    pub fn end(&self) -> usize {
        self.emit(TrackEvent::Ended)
    }

    pub fn listener_count(&self, event: TrackEvent) -> usize {
        self.listeners.count(event)
    }

    pub fn total_listeners(&self) -> usize {
        self.listeners.len()
    }
}

impl MediaTrack for SimulatedTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn settings(&self) -> Option<CapabilitySnapshot> {
        self.settings_reads.fetch_add(1, Ordering::SeqCst);
        let mut view = lock(&self.view);
        if let Some((snapshot, hidden_reads)) = view.reveal.take() {
            if hidden_reads == 0 {
                view.settings = Some(snapshot);
            } else {
                view.reveal = Some((snapshot, hidden_reads - 1));
            }
        }
        view.settings
    }

    fn capabilities(&self) -> CapabilitySnapshot {
        lock(&self.view).capabilities
    }

    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId {
        self.listeners.add(event, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// A stream of simulated tracks
pub struct SimulatedStream {
    id: String,
    tracks: Mutex<Vec<Arc<SimulatedTrack>>>,
    listeners: ListenerSet,
}

impl SimulatedStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<SimulatedTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: Mutex::new(tracks),
            listeners: ListenerSet::new(),
        })
    }

    /// Take a track out of the stream and signal `RemoveTrack`
    pub fn remove_track(&self, track_id: &str) -> bool {
        let removed = {
            let mut tracks = lock(&self.tracks);
            let before = tracks.len();
            tracks.retain(|track| track.id != track_id);
            before != tracks.len()
        };
        if removed {
            self.listeners.emit(&TrackSignal {
                event: TrackEvent::RemoveTrack,
                track_id: track_id.to_string(),
            });
        }
        removed
    }

    pub fn listener_count(&self, event: TrackEvent) -> usize {
        self.listeners.count(event)
    }
}

impl MediaStream for SimulatedStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        lock(&self.tracks)
            .iter()
            .filter(|track| track.kind == TrackKind::Video)
            .map(|track| track.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId {
        self.listeners.add(event, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// A transport session that delivers whatever tracks the caller adds
pub struct SimulatedTransport {
    mode: NegotiationMode,
    local_video: Mutex<Option<TrackId>>,
    handlers: Mutex<HashMap<ListenerId, TrackAddedHandler>>,
}

impl SimulatedTransport {
    pub fn new(mode: NegotiationMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            local_video: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Mark `track_id` as our own outgoing video
    pub fn set_local_video(&self, track_id: impl Into<TrackId>) {
        *lock(&self.local_video) = Some(track_id.into());
    }

    /// Deliver a track-added event to every listener
    pub fn add_track(&self, track: Arc<SimulatedTrack>, stream: Arc<SimulatedStream>) -> usize {
        let track: Arc<dyn MediaTrack> = track;
        let stream: Arc<dyn MediaStream> = stream;
        let handlers: Vec<TrackAddedHandler> = lock(&self.handlers).values().cloned().collect();
        for handler in &handlers {
            handler(track.clone(), stream.clone());
        }
        handlers.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

impl TransportSession for SimulatedTransport {
    fn add_track_listener(&self, handler: TrackAddedHandler) -> ListenerId {
        let id = Uuid::new_v4();
        lock(&self.handlers).insert(id, handler);
        id
    }

    fn remove_track_listener(&self, id: ListenerId) -> bool {
        lock(&self.handlers).remove(&id).is_some()
    }

    fn is_local_video(&self, track: &dyn MediaTrack) -> bool {
        lock(&self.local_video).as_deref() == Some(track.id().as_str())
    }

    fn negotiation_mode(&self) -> NegotiationMode {
        self.mode
    }
}

/// Track to attendee and stream id lookups from a fixed table
#[derive(Default)]
pub struct StaticStreamIndex {
    entries: Mutex<HashMap<TrackId, (AttendeeId, Option<StreamId>)>>,
}

impl StaticStreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        track_id: impl Into<TrackId>,
        attendee_id: impl Into<AttendeeId>,
        stream_id: Option<StreamId>,
    ) {
        lock(&self.entries).insert(track_id.into(), (attendee_id.into(), stream_id));
    }
}

impl StreamIndex for StaticStreamIndex {
    fn attendee_id_for_track(&self, track_id: &str) -> Option<AttendeeId> {
        lock(&self.entries)
            .get(track_id)
            .map(|(attendee_id, _)| attendee_id.clone())
    }

    fn stream_id_for_track(&self, track_id: &str) -> Option<StreamId> {
        lock(&self.entries)
            .get(track_id)
            .and_then(|(_, stream_id)| *stream_id)
    }
}

#[derive(Default)]
pub struct InMemoryIdentityDirectory {
    external_ids: Mutex<HashMap<AttendeeId, String>>,
}

impl InMemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attendee_id: impl Into<AttendeeId>, external_user_id: impl Into<String>) {
        lock(&self.external_ids).insert(attendee_id.into(), external_user_id.into());
    }
}

impl IdentityDirectory for InMemoryIdentityDirectory {
    fn external_user_id_from_attendee_id(&self, attendee_id: &str) -> Option<String> {
        lock(&self.external_ids).get(attendee_id).cloned()
    }
}

/// Presence feed that delivers events synchronously on `publish`
#[derive(Default)]
pub struct InMemoryPresenceFeed {
    handlers: Mutex<HashMap<SubscriptionId, PresenceHandler>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl InMemoryPresenceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every current subscriber
    pub fn publish(&self, event: &PresenceEvent) -> usize {
        let handlers: Vec<PresenceHandler> = lock(&self.handlers).values().cloned().collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Successful unsubscribes so far
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

impl PresenceFeed for InMemoryPresenceFeed {
    fn subscribe(&self, handler: PresenceHandler) -> SubscriptionId {
        let id = Uuid::new_v4();
        lock(&self.handlers).insert(id, handler);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = lock(&self.handlers).remove(&id).is_some();
        if removed {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::warn!("Presence subscription {} removed twice", id);
        }
        removed
    }
}

/// Audio sink that records which streams it was handed
#[derive(Default)]
pub struct RecordingAudioSink {
    streams: Mutex<Vec<String>>,
}

impl RecordingAudioSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound_streams(&self) -> Vec<String> {
        lock(&self.streams).clone()
    }
}

impl AudioSink for RecordingAudioSink {
    fn bind_audio_stream(&self, stream: Arc<dyn MediaStream>) {
        lock(&self.streams).push(stream.id());
    }
}

#[derive(Default)]
pub struct InMemoryPausedStreams {
    paused: Mutex<HashSet<StreamId>>,
    removals: Mutex<Vec<StreamId>>,
}

impl InMemoryPausedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self, stream_id: StreamId) {
        lock(&self.paused).insert(stream_id);
    }

    pub fn is_paused(&self, stream_id: StreamId) -> bool {
        lock(&self.paused).contains(&stream_id)
    }

    /// Every `remove` call in order, including ids that were not paused
    pub fn removals(&self) -> Vec<StreamId> {
        lock(&self.removals).clone()
    }
}

impl PausedStreamTracker for InMemoryPausedStreams {
    fn remove(&self, stream_id: StreamId) {
        lock(&self.paused).remove(&stream_id);
        lock(&self.removals).push(stream_id);
    }
}

/// One of each in-memory collaborator, wired as a session
#[derive(Clone)]
pub struct SimulatedSession {
    pub transport: Arc<SimulatedTransport>,
    pub stream_index: Arc<StaticStreamIndex>,
    pub identity: Arc<InMemoryIdentityDirectory>,
    pub presence: Arc<InMemoryPresenceFeed>,
    pub tiles: Arc<InMemoryTileRegistry>,
    pub audio: Arc<RecordingAudioSink>,
    pub paused_streams: Arc<InMemoryPausedStreams>,
}

impl SimulatedSession {
    pub fn new(mode: NegotiationMode) -> Self {
        Self {
            transport: SimulatedTransport::new(mode),
            stream_index: Arc::new(StaticStreamIndex::new()),
            identity: Arc::new(InMemoryIdentityDirectory::new()),
            presence: Arc::new(InMemoryPresenceFeed::new()),
            tiles: Arc::new(InMemoryTileRegistry::new()),
            audio: Arc::new(RecordingAudioSink::new()),
            paused_streams: Arc::new(InMemoryPausedStreams::new()),
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session: self.transport.clone(),
            stream_index: self.stream_index.clone(),
            identity: self.identity.clone(),
            presence: self.presence.clone(),
            tiles: self.tiles.clone(),
            audio_sink: self.audio.clone(),
            paused_streams: self.paused_streams.clone(),
        }
    }

    /// A remote video track alone in its own stream, registered with the
    /// stream index
    pub fn remote_video(
        &self,
        track_id: &str,
        attendee_id: &str,
        stream_id: Option<StreamId>,
    ) -> (Arc<SimulatedTrack>, Arc<SimulatedStream>) {
        let track = SimulatedTrack::video(track_id);
        let stream = SimulatedStream::new(format!("stream-{attendee_id}"), vec![track.clone()]);
        self.stream_index.insert(track_id, attendee_id, stream_id);
        (track, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_revealed_after_hidden_reads() {
        let track = SimulatedTrack::video("t1");
        track.reveal_dimensions_after(CapabilitySnapshot::new(1280, 720), 2);

        assert!(!track.settings().unwrap().is_complete());
        assert!(!track.settings().unwrap().is_complete());
        assert_eq!(track.settings().unwrap().dimensions(), Some((1280, 720)));
        assert_eq!(track.settings().unwrap().dimensions(), Some((1280, 720)));
        assert_eq!(track.settings_reads(), 4);
    }

    #[test]
    fn test_stream_remove_track_signals_listeners() {
        let video = SimulatedTrack::video("t1");
        let stream = SimulatedStream::new("s1", vec![video]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        stream.add_listener(
            TrackEvent::RemoveTrack,
            Arc::new(move |signal: &TrackSignal| {
                sink.lock().unwrap().push(signal.track_id.clone());
            }),
        );

        assert!(stream.remove_track("t1"));
        assert!(!stream.remove_track("t1"));
        assert_eq!(*seen.lock().unwrap(), vec!["t1".to_string()]);
        assert!(stream.video_tracks().is_empty());
    }

    #[test]
    fn test_presence_feed_counts_unsubscribes() {
        let feed = InMemoryPresenceFeed::new();
        let id = feed.subscribe(Arc::new(|_: &PresenceEvent| {}));
        assert_eq!(feed.subscriber_count(), 1);
        assert!(feed.unsubscribe(id));
        assert!(!feed.unsubscribe(id));
        assert_eq!(feed.unsubscribe_count(), 1);
    }
}
