//! Per-session entry point
//!
//! [`RemoteVideoObserver::install`] wires the router, coordinator and
//! cleanup together once a transport session is established;
//! [`RemovableObserver::teardown`] undoes all of it.

use std::sync::Arc;

use crate::backoff::BackoffFactory;
use crate::cleanup::TrackLifecycleCleanup;
use crate::collaborators::{
    AudioSink, IdentityDirectory, PausedStreamTracker, PresenceFeed, StreamIndex, TileRegistry,
    TransportSession,
};
use crate::config::BindingConfig;
use crate::coordinator::TileBindingCoordinator;
use crate::router::TrackEventRouter;

/// Something that can be detached from a session
pub trait RemovableObserver: Send + Sync {
    /// Release everything the observer registered. Idempotent.
    fn teardown(&self);
}

/// The collaborators one session provides
#[derive(Clone)]
pub struct SessionContext {
    pub session: Arc<dyn TransportSession>,
    pub stream_index: Arc<dyn StreamIndex>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub presence: Arc<dyn PresenceFeed>,
    pub tiles: Arc<dyn TileRegistry>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub paused_streams: Arc<dyn PausedStreamTracker>,
}

pub struct RemoteVideoObserver {
    router: Arc<TrackEventRouter>,
    coordinator: Arc<TileBindingCoordinator>,
    cleanup: Arc<TrackLifecycleCleanup>,
}

impl RemoteVideoObserver {
    /// Start routing the session's tracks, with the full-jitter backoff
    /// described by `config.backoff`
    pub fn install(context: SessionContext, config: &BindingConfig) -> Arc<Self> {
        let backoff: Arc<dyn BackoffFactory> = Arc::new(config.backoff.clone());
        Self::install_with_backoff(context, config, backoff)
    }

    /// Same as [`install`](Self::install) with a substitute retry policy
    pub fn install_with_backoff(
        context: SessionContext,
        config: &BindingConfig,
        backoff: Arc<dyn BackoffFactory>,
    ) -> Arc<Self> {
        let cleanup = Arc::new(TrackLifecycleCleanup::new());
        let coordinator = TileBindingCoordinator::new(&context, config, backoff, cleanup.clone());
        let router = TrackEventRouter::new(
            context.session.clone(),
            context.audio_sink.clone(),
            coordinator.clone(),
        );

        router.subscribe();
        let unsubscriber = router.clone();
        cleanup.set_session_listener(move || unsubscriber.unsubscribe());

        tracing::info!(
            "Remote video observer installed ({:?} negotiation)",
            context.session.negotiation_mode()
        );

        Arc::new(Self {
            router,
            coordinator,
            cleanup,
        })
    }

    pub fn coordinator(&self) -> &Arc<TileBindingCoordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<TrackEventRouter> {
        &self.router
    }

    pub fn cleanup(&self) -> &Arc<TrackLifecycleCleanup> {
        &self.cleanup
    }
}

impl RemovableObserver for RemoteVideoObserver {
    fn teardown(&self) {
        let released = self.cleanup.release();
        if released == 0 {
            return;
        }
        self.coordinator.clear();
        tracing::info!("Remote video observer torn down, released {} listeners", released);
    }
}
