//! Deferred identity resolution through the presence feed
//!
//! When the identity directory does not yet know an attendee's external
//! user id, the binder subscribes to the presence feed and binds the tile
//! as soon as a matching event arrives. A timeout bounds the wait; on expiry
//! the tile is left created but unbound.
//!
//! Exactly one of match, timeout and cancel settles a wait. Whichever gets
//! there first removes the presence subscription and stops the timer; the
//! others find the wait settled and do nothing.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

use tilebind_protocol::{PresenceEvent, SubscriptionId, TileBinding};

use crate::collaborators::{PresenceFeed, PresenceHandler, TileRegistry};
use crate::coordinator::PendingBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// A matching presence event arrived and the tile was bound
    Bound,
    /// The timeout fired first; the tile stays unbound
    TimedOut,
    /// The owning track or session went away first
    Cancelled,
}

#[derive(Default)]
struct WaitInner {
    outcome: Option<PresenceOutcome>,
    subscription: Option<SubscriptionId>,
    timer: Option<AbortHandle>,
}

struct WaitState {
    pending: PendingBinding,
    inner: Mutex<WaitInner>,
}

impl WaitState {
    /// Record the terminal outcome. Returns the subscription and timer to
    /// release if this call settled the wait, `None` if it was already
    /// settled.
    fn settle(&self, outcome: PresenceOutcome) -> Option<(Option<SubscriptionId>, Option<AbortHandle>)> {
        let mut inner = self.lock();
        if inner.outcome.is_some() {
            return None;
        }
        inner.outcome = Some(outcome);
        Some((inner.subscription.take(), inner.timer.take()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle on one outstanding presence wait
#[derive(Clone)]
pub struct PresenceWait {
    state: Arc<WaitState>,
    feed: Weak<dyn PresenceFeed>,
}

impl PresenceWait {
    /// Abandon the wait: unsubscribe and stop the timer. Returns false if
    /// the wait had already settled.
    pub fn cancel(&self) -> bool {
        let Some((subscription, timer)) = self.state.settle(PresenceOutcome::Cancelled) else {
            return false;
        };
        release(&self.feed, subscription);
        if let Some(timer) = timer {
            timer.abort();
        }
        tracing::debug!(
            "Presence wait for attendee {} cancelled",
            self.state.pending.attendee_id
        );
        true
    }

    pub fn outcome(&self) -> Option<PresenceOutcome> {
        self.state.lock().outcome
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }
}

fn release(feed: &Weak<dyn PresenceFeed>, subscription: Option<SubscriptionId>) {
    if let (Some(feed), Some(id)) = (feed.upgrade(), subscription) {
        feed.unsubscribe(id);
    }
}

pub struct PresenceAwaitingBinder {
    feed: Arc<dyn PresenceFeed>,
    tiles: Arc<dyn TileRegistry>,
}

impl PresenceAwaitingBinder {
    pub fn new(feed: Arc<dyn PresenceFeed>, tiles: Arc<dyn TileRegistry>) -> Self {
        Self { feed, tiles }
    }

    /// Subscribe for the attendee's external id and bind the tile when it
    /// shows up, giving up after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn await_external_id(
        &self,
        pending: PendingBinding,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> PresenceWait {
        let state = Arc::new(WaitState {
            pending,
            inner: Mutex::new(WaitInner::default()),
        });
        let feed = Arc::downgrade(&self.feed);

        let handler: PresenceHandler = {
            let state = state.clone();
            let feed = feed.clone();
            let tiles = self.tiles.clone();
            Arc::new(move |event: &PresenceEvent| {
                let Some(external_user_id) = event.resolves(&state.pending.attendee_id) else {
                    return;
                };
                let Some((subscription, timer)) = state.settle(PresenceOutcome::Bound) else {
                    return;
                };

                let pending = &state.pending;
                let bound = tiles.bind_video_stream(
                    pending.tile_id,
                    TileBinding {
                        attendee_id: pending.attendee_id.clone(),
                        external_user_id: external_user_id.to_string(),
                        width,
                        height,
                        stream_id: pending.stream_id,
                    },
                );
                if bound {
                    tracing::info!(
                        "Bound tile {} to attendee {} ({}) after presence update",
                        pending.tile_id,
                        pending.attendee_id,
                        external_user_id
                    );
                } else {
                    tracing::debug!(
                        "Tile {} disappeared before attendee {} was resolved",
                        pending.tile_id,
                        pending.attendee_id
                    );
                }

                release(&feed, subscription);
                if let Some(timer) = timer {
                    timer.abort();
                }
            })
        };

        let subscription = self.feed.subscribe(handler);
        let settled_during_subscribe = {
            let mut inner = state.lock();
            if inner.outcome.is_none() {
                inner.subscription = Some(subscription);
                false
            } else {
                true
            }
        };
        if settled_during_subscribe {
            self.feed.unsubscribe(subscription);
            return PresenceWait { state, feed };
        }

        tracing::debug!(
            "Waiting up to {:?} for external id of attendee {}",
            timeout,
            state.pending.attendee_id
        );

        let timer = {
            let state = state.clone();
            let feed = feed.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // Our own abort handle comes back here; dropping it is enough
                if let Some((subscription, _timer)) = state.settle(PresenceOutcome::TimedOut) {
                    release(&feed, subscription);
                    tracing::warn!(
                        "No external id for attendee {} within {:?}, tile {} left unbound",
                        state.pending.attendee_id,
                        timeout,
                        state.pending.tile_id
                    );
                }
            })
        };

        {
            let mut inner = state.lock();
            if inner.outcome.is_none() {
                inner.timer = Some(timer.abort_handle());
            } else {
                timer.abort();
            }
        }

        PresenceWait { state, feed }
    }
}
