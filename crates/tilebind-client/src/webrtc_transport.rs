//! webrtc-rs transport adapter
//!
//! Turns `RTCPeerConnection::on_track` into the transport-session contract
//! the binding core listens to. Remote tracks are grouped into streams by
//! their msid stream id, which has the form `stream-{attendee_id}` or
//! `stream-{attendee_id}-{webcam|screen}`. The RTP SSRC doubles as the
//! stream id handed to the tile registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use tilebind_media::BindingError;
use tilebind_media::collaborators::{
    ListenerSet, MediaStream, MediaTrack, StreamIndex, TrackAddedHandler, TrackListener,
    TransportSession,
};
use tilebind_protocol::{
    AttendeeId, CapabilitySnapshot, ListenerId, NegotiationMode, StreamId, TrackEvent, TrackId,
    TrackKind, TrackSignal,
};

/// Packets buffered per track for slow decoders
const PACKET_BUFFER: usize = 256;

/// Consecutive failed reads after which a track is treated as gone
const MAX_READ_ERRORS: u32 = 500;

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Attendee id carried in a remote stream id
pub fn parse_attendee_id(stream_id: &str) -> Option<&str> {
    let stripped = stream_id.strip_prefix("stream-")?;
    let attendee_id = match stripped.rsplit_once('-') {
        Some((attendee_id, "webcam" | "screen")) => attendee_id,
        _ => stripped,
    };
    (!attendee_id.is_empty()).then_some(attendee_id)
}

pub fn track_kind(codec_type: RTPCodecType) -> Option<TrackKind> {
    match codec_type {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// A remote webrtc-rs track as seen by the binding core
pub struct WebRtcTrack {
    id: TrackId,
    kind: TrackKind,
    stream_id: String,
    ssrc: u32,
    /// Size of the last decoded frame, empty until a decoder reports one
    settings: Mutex<CapabilitySnapshot>,
    listeners: ListenerSet,
    packets: broadcast::Sender<Packet>,
}

impl WebRtcTrack {
    pub fn new(id: impl Into<TrackId>, kind: TrackKind, stream_id: impl Into<String>, ssrc: u32) -> Arc<Self> {
        let (packets, _) = broadcast::channel(PACKET_BUFFER);
        Arc::new(Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            ssrc,
            settings: Mutex::new(CapabilitySnapshot::default()),
            listeners: ListenerSet::new(),
            packets,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Record the size of a decoded frame
    pub fn report_dimensions(&self, width: u32, height: u32) {
        let mut settings = lock(&self.settings);
        if settings.dimensions() != Some((width, height)) {
            tracing::debug!("Track {} decoding at {}x{}", self.id, width, height);
            *settings = CapabilitySnapshot::new(width, height);
        }
    }

    /// RTP packets read from the remote track
    pub fn subscribe_packets(&self) -> broadcast::Receiver<Packet> {
        self.packets.subscribe()
    }

    fn emit(&self, event: TrackEvent) -> usize {
        self.listeners.emit(&TrackSignal {
            event,
            track_id: self.id.clone(),
        })
    }
}

impl MediaTrack for WebRtcTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn settings(&self) -> Option<CapabilitySnapshot> {
        Some(*lock(&self.settings))
    }

    /// Remote tracks advertise no constraints of their own
    fn capabilities(&self) -> CapabilitySnapshot {
        CapabilitySnapshot::default()
    }

    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId {
        self.listeners.add(event, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// Remote tracks sharing one msid stream id
pub struct WebRtcStream {
    id: String,
    tracks: Mutex<Vec<Arc<WebRtcTrack>>>,
    listeners: ListenerSet,
}

impl WebRtcStream {
    fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
        })
    }

    fn push(&self, track: Arc<WebRtcTrack>) {
        let mut tracks = lock(&self.tracks);
        tracks.retain(|t| t.id != track.id);
        tracks.push(track);
    }

    /// Drop a track and signal `RemoveTrack`. Returns how many tracks are
    /// left.
    fn remove_track(&self, track_id: &str) -> usize {
        let (removed, left) = {
            let mut tracks = lock(&self.tracks);
            let before = tracks.len();
            tracks.retain(|t| t.id != track_id);
            (before != tracks.len(), tracks.len())
        };
        if removed {
            self.listeners.emit(&TrackSignal {
                event: TrackEvent::RemoveTrack,
                track_id: track_id.to_string(),
            });
        }
        left
    }
}

impl MediaStream for WebRtcStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        lock(&self.tracks)
            .iter()
            .filter(|t| t.kind == TrackKind::Video)
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    fn add_listener(&self, event: TrackEvent, listener: TrackListener) -> ListenerId {
        self.listeners.add(event, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// Transport session over a webrtc-rs peer connection.
///
/// Also answers stream index lookups for the tracks it delivered.
pub struct WebRtcTransport {
    local_video_track_id: Option<TrackId>,
    handlers: Mutex<HashMap<ListenerId, TrackAddedHandler>>,
    streams: Mutex<HashMap<String, Arc<WebRtcStream>>>,
    tracks: Mutex<HashMap<TrackId, Arc<WebRtcTrack>>>,
}

impl WebRtcTransport {
    pub fn new(local_video_track_id: Option<TrackId>) -> Arc<Self> {
        Arc::new(Self {
            local_video_track_id,
            handlers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    /// Start delivering the peer connection's remote tracks
    pub fn attach(
        peer_connection: &Arc<RTCPeerConnection>,
        local_video_track_id: Option<TrackId>,
    ) -> Result<Arc<Self>> {
        if peer_connection.connection_state() == RTCPeerConnectionState::Closed {
            return Err(BindingError::NotConnected.into());
        }

        let transport = Self::new(local_video_track_id);
        let weak = Arc::downgrade(&transport);

        tracing::info!("Registering on_track callback for remote tracks");
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracing::info!(
                "on_track fired: track {}, stream {}, kind {:?}",
                track.id(),
                track.stream_id(),
                track.kind()
            );
            let transport = weak.clone();
            Box::pin(async move {
                handle_remote_track(transport, track).await;
            })
        }));

        Ok(transport)
    }

    pub fn track(&self, track_id: &str) -> Option<Arc<WebRtcTrack>> {
        lock(&self.tracks).get(track_id).cloned()
    }

    /// Register a remote track and tell every track-added listener
    pub fn deliver(&self, track: Arc<WebRtcTrack>) -> usize {
        let stream = {
            let mut streams = lock(&self.streams);
            streams
                .entry(track.stream_id.clone())
                .or_insert_with(|| WebRtcStream::new(track.stream_id.clone()))
                .clone()
        };
        stream.push(track.clone());
        lock(&self.tracks).insert(track.id.clone(), track.clone());

        let handlers: Vec<TrackAddedHandler> = lock(&self.handlers).values().cloned().collect();
        let media_track: Arc<dyn MediaTrack> = track;
        let media_stream: Arc<dyn MediaStream> = stream;
        for handler in &handlers {
            handler(media_track.clone(), media_stream.clone());
        }
        handlers.len()
    }

    /// Signal the end of a remote track and forget it
    pub fn close_track(&self, track_id: &str) {
        let Some(track) = lock(&self.tracks).remove(track_id) else {
            return;
        };

        track.emit(TrackEvent::Ended);

        let stream = lock(&self.streams).get(&track.stream_id).cloned();
        if let Some(stream) = stream {
            if stream.remove_track(track_id) == 0 {
                lock(&self.streams).remove(&track.stream_id);
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

impl TransportSession for WebRtcTransport {
    fn add_track_listener(&self, handler: TrackAddedHandler) -> ListenerId {
        let id = Uuid::new_v4();
        lock(&self.handlers).insert(id, handler);
        id
    }

    fn remove_track_listener(&self, id: ListenerId) -> bool {
        lock(&self.handlers).remove(&id).is_some()
    }

    fn is_local_video(&self, track: &dyn MediaTrack) -> bool {
        self.local_video_track_id.as_deref() == Some(track.id().as_str())
    }

    fn negotiation_mode(&self) -> NegotiationMode {
        NegotiationMode::UnifiedPlan
    }
}

impl StreamIndex for WebRtcTransport {
    fn attendee_id_for_track(&self, track_id: &str) -> Option<AttendeeId> {
        let track = self.track(track_id)?;
        parse_attendee_id(&track.stream_id).map(str::to_string)
    }

    fn stream_id_for_track(&self, track_id: &str) -> Option<StreamId> {
        self.track(track_id).map(|track| track.ssrc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadErrorAction {
    /// The remote track is closed
    Closed,
    /// Too many failed reads in a row
    GiveUp,
    /// Try again after [`READ_ERROR_BACKOFF`], logging only when `log` is set
    Retry { log: bool },
}

/// Consecutive RTP read failures for one track
#[derive(Debug, Default)]
struct ReadErrors {
    consecutive: u32,
}

impl ReadErrors {
    fn on_packet(&mut self) {
        self.consecutive = 0;
    }

    fn on_error(&mut self, error_msg: &str) -> ReadErrorAction {
        if error_msg.contains("closed") || error_msg.contains("RTPReceiver must not be nil") {
            return ReadErrorAction::Closed;
        }
        self.consecutive += 1;
        if self.consecutive >= MAX_READ_ERRORS {
            return ReadErrorAction::GiveUp;
        }
        ReadErrorAction::Retry {
            log: self.consecutive % 100 == 1,
        }
    }
}

/// Deliver one remote track, pump its RTP until it closes, then signal the
/// end
async fn handle_remote_track(transport: Weak<WebRtcTransport>, remote: Arc<TrackRemote>) {
    let Some(kind) = track_kind(remote.kind()) else {
        tracing::warn!("Remote track {} has no media kind, ignoring it", remote.id());
        return;
    };

    let track = WebRtcTrack::new(remote.id(), kind, remote.stream_id(), remote.ssrc());
    let track_id = track.id.clone();
    let packets = track.packets.clone();

    match transport.upgrade() {
        Some(transport) => {
            let listeners = transport.deliver(track);
            tracing::debug!("Delivered remote {} track {} to {} listeners", kind, track_id, listeners);
        }
        None => return,
    }

    tracing::info!("Starting RTP read loop for remote {} track {}", kind, track_id);
    let mut packet_count = 0u64;
    let mut errors = ReadErrors::default();
    loop {
        match remote.read_rtp().await {
            Ok((packet, _attributes)) => {
                errors.on_packet();
                packet_count += 1;
                if packet_count % 500 == 1 {
                    tracing::debug!(
                        "Received RTP packet {} for track {}, payload size: {}",
                        packet_count,
                        track_id,
                        packet.payload.len()
                    );
                }
                // No receivers is fine, nobody is decoding yet
                let _ = packets.send(packet);
            }
            Err(e) => match errors.on_error(&e.to_string()) {
                ReadErrorAction::Closed => {
                    tracing::info!("Remote {} track {} closed", kind, track_id);
                    break;
                }
                ReadErrorAction::GiveUp => {
                    tracing::warn!(
                        "Giving up on remote track {} after {} failed reads: {}",
                        track_id,
                        MAX_READ_ERRORS,
                        e
                    );
                    break;
                }
                ReadErrorAction::Retry { log } => {
                    if log {
                        tracing::warn!("Error reading RTP from remote track {}: {}", track_id, e);
                    }
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            },
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.close_track(&track_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilebind_media::memory::{
        InMemoryIdentityDirectory, InMemoryPausedStreams, InMemoryPresenceFeed,
        RecordingAudioSink,
    };
    use tilebind_media::observer::SessionContext;
    use tilebind_media::{BindingConfig, InMemoryTileRegistry, RemoteVideoObserver};

    #[test]
    fn test_parse_attendee_id() {
        assert_eq!(parse_attendee_id("stream-a1"), Some("a1"));
        assert_eq!(parse_attendee_id("stream-a1-webcam"), Some("a1"));
        assert_eq!(parse_attendee_id("stream-a1-screen"), Some("a1"));
        assert_eq!(parse_attendee_id("stream-a-b-c"), Some("a-b-c"));
        assert_eq!(parse_attendee_id("stream-"), None);
        assert_eq!(parse_attendee_id("audio-a1"), None);
    }

    #[test]
    fn test_close_errors_end_the_read_loop() {
        let mut errors = ReadErrors::default();
        assert_eq!(errors.on_error("track closed"), ReadErrorAction::Closed);
        assert_eq!(
            errors.on_error("RTPReceiver must not be nil"),
            ReadErrorAction::Closed
        );
        assert_eq!(errors.consecutive, 0);
    }

    #[test]
    fn test_persistent_read_errors_are_throttled_then_abandoned() {
        let mut errors = ReadErrors::default();
        let mut logged = 0;
        for _ in 1..MAX_READ_ERRORS {
            match errors.on_error("srtp decrypt failed") {
                ReadErrorAction::Retry { log } => logged += usize::from(log),
                other => panic!("gave up early: {other:?}"),
            }
        }
        assert_eq!(logged, 5);
        assert_eq!(errors.on_error("srtp decrypt failed"), ReadErrorAction::GiveUp);
    }

    #[test]
    fn test_packet_resets_error_run() {
        let mut errors = ReadErrors::default();
        for _ in 1..MAX_READ_ERRORS {
            errors.on_error("srtp decrypt failed");
        }
        errors.on_packet();
        assert_eq!(
            errors.on_error("srtp decrypt failed"),
            ReadErrorAction::Retry { log: true }
        );
    }

    #[test]
    fn test_track_kind_from_codec_type() {
        assert_eq!(track_kind(RTPCodecType::Audio), Some(TrackKind::Audio));
        assert_eq!(track_kind(RTPCodecType::Video), Some(TrackKind::Video));
        assert_eq!(track_kind(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn test_reported_dimensions_feed_settings() {
        let track = WebRtcTrack::new("t1", TrackKind::Video, "stream-a1", 42);
        assert_eq!(track.settings().unwrap().dimensions(), None);

        track.report_dimensions(1920, 1080);
        assert_eq!(track.settings().unwrap().dimensions(), Some((1920, 1080)));
    }

    #[test]
    fn test_stream_index_from_delivered_tracks() {
        let transport = WebRtcTransport::new(None);
        transport.deliver(WebRtcTrack::new("t1", TrackKind::Video, "stream-a1-webcam", 42));

        assert_eq!(transport.attendee_id_for_track("t1").as_deref(), Some("a1"));
        assert_eq!(transport.stream_id_for_track("t1"), Some(42));
        assert_eq!(transport.attendee_id_for_track("t2"), None);

        transport.close_track("t1");
        assert_eq!(transport.attendee_id_for_track("t1"), None);
        assert!(lock(&transport.streams).is_empty());
    }

    #[test]
    fn test_close_track_signals_ended_and_removetrack() {
        let transport = WebRtcTransport::new(None);
        let track = WebRtcTrack::new("t1", TrackKind::Video, "stream-a1", 1);
        transport.deliver(track.clone());
        let stream = lock(&transport.streams).get("stream-a1").cloned().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for (event, target) in [(TrackEvent::Ended, "track"), (TrackEvent::RemoveTrack, "stream")] {
            let sink = seen.clone();
            let listener: TrackListener = Arc::new(move |signal: &TrackSignal| {
                sink.lock().unwrap().push((target, signal.event));
            });
            match target {
                "track" => track.add_listener(event, listener),
                _ => stream.add_listener(event, listener),
            };
        }

        transport.close_track("t1");
        transport.close_track("t1");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("track", TrackEvent::Ended), ("stream", TrackEvent::RemoveTrack)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_binds_tile_once_frames_decode() {
        let transport = WebRtcTransport::new(Some("local-cam".to_string()));
        let identity = Arc::new(InMemoryIdentityDirectory::new());
        identity.insert("a1", "ext-1");
        let tiles = Arc::new(InMemoryTileRegistry::new());
        let paused = Arc::new(InMemoryPausedStreams::new());

        let context = SessionContext {
            session: transport.clone(),
            stream_index: transport.clone(),
            identity,
            presence: Arc::new(InMemoryPresenceFeed::new()),
            tiles: tiles.clone(),
            audio_sink: Arc::new(RecordingAudioSink::new()),
            paused_streams: paused.clone(),
        };
        let _observer = RemoteVideoObserver::install(context, &BindingConfig::default());

        let track = WebRtcTrack::new("t1", TrackKind::Video, "stream-a1", 77);
        assert_eq!(transport.deliver(track.clone()), 1);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles.unbound_tiles().len(), 1);

        track.report_dimensions(640, 480);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let bound = tiles.tiles_for_attendee("a1");
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].stream_id, Some(77));
        assert_eq!((bound[0].width, bound[0].height), (640, 480));

        transport.close_track("t1");
        assert!(tiles.is_empty());
        assert_eq!(paused.removals(), vec![77]);
    }
}
