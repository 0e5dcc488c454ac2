//! Waiting for a track to report its pixel dimensions
//!
//! A freshly added remote track often has no width or height yet. The
//! resolver re-reads the track on a full-jitter schedule until both are
//! present or the backoff runs out of attempts.

use std::sync::Arc;

use crate::backoff::BackoffFactory;
use crate::collaborators::MediaTrack;

/// Outcome of [`CapabilityBackoffResolver::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityResolution {
    Ready { width: u32, height: u32, retries: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Clone)]
pub struct CapabilityBackoffResolver {
    backoff: Arc<dyn BackoffFactory>,
}

impl CapabilityBackoffResolver {
    pub fn new(backoff: Arc<dyn BackoffFactory>) -> Self {
        Self { backoff }
    }

    /// Read the track's dimensions right now.
    ///
    /// The live settings view wins over the static capabilities view when
    /// the platform provides one.
    pub fn try_resolve_now(&self, track: &dyn MediaTrack) -> Option<(u32, u32)> {
        let snapshot = match track.settings() {
            Some(settings) => settings,
            None => track.capabilities(),
        };
        snapshot.dimensions()
    }

    /// Resolve the track's dimensions, retrying until they appear or the
    /// backoff is exhausted. Completes without scheduling a timer when the
    /// dimensions are already known.
    ///
    /// Dropping the future cancels any pending retry.
    pub async fn resolve(&self, track: &dyn MediaTrack) -> CapabilityResolution {
        if let Some((width, height)) = self.try_resolve_now(track) {
            return CapabilityResolution::Ready {
                width,
                height,
                retries: 0,
            };
        }
        self.retry(track).await
    }

    /// Retry loop for a track whose first read came back incomplete
    pub async fn retry(&self, track: &dyn MediaTrack) -> CapabilityResolution {
        let mut backoff = self.backoff.create();
        let track_id = track.id();

        loop {
            let Some(delay) = backoff.next_delay() else {
                return CapabilityResolution::Exhausted {
                    attempts: backoff.attempts(),
                };
            };

            tracing::debug!(
                "Dimensions of track {} unknown, retry {} in {:?}",
                track_id,
                backoff.attempts(),
                delay
            );
            tokio::time::sleep(delay).await;

            if let Some((width, height)) = self.try_resolve_now(track) {
                return CapabilityResolution::Ready {
                    width,
                    height,
                    retries: backoff.attempts(),
                };
            }
        }
    }
}
