//! Release bookkeeping for everything registered on behalf of a track
//!
//! Every listener, presence subscription and timer created while binding a
//! track is recorded as a release callback in that track's
//! [`ListenerRegistry`]. [`TrackLifecycleCleanup`] owns the registries for
//! the whole session plus the session-level track-added listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tilebind_protocol::TrackId;

/// A one-shot release callback
pub type Disposer = Box<dyn FnOnce() + Send>;

struct RegistryEntry {
    label: String,
    dispose: Disposer,
}

#[derive(Default)]
struct RegistryInner {
    released: bool,
    entries: Vec<RegistryEntry>,
}

/// Release callbacks for one track
pub struct ListenerRegistry {
    track_id: TrackId,
    inner: Mutex<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new(track_id: impl Into<TrackId>) -> Self {
        Self {
            track_id: track_id.into(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Record a release callback.
    ///
    /// If the registry was already released the callback runs right away and
    /// `false` is returned.
    pub fn register(&self, label: impl Into<String>, dispose: impl FnOnce() + Send + 'static) -> bool {
        let label = label.into();
        {
            let mut inner = self.lock();
            if !inner.released {
                inner.entries.push(RegistryEntry {
                    label,
                    dispose: Box::new(dispose),
                });
                return true;
            }
        }

        tracing::debug!(
            "Track {} already released, disposing {} immediately",
            self.track_id,
            label
        );
        dispose();
        false
    }

    /// Run every pending release callback. Later calls do nothing.
    ///
    /// Returns the number of callbacks run.
    pub fn release(&self) -> usize {
        let entries = {
            let mut inner = self.lock();
            if inner.released {
                return 0;
            }
            inner.released = true;
            std::mem::take(&mut inner.entries)
        };

        let count = entries.len();
        for entry in entries {
            tracing::debug!("Releasing {} for track {}", entry.label, self.track_id);
            (entry.dispose)();
        }
        count
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Number of callbacks still waiting to be released
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct CleanupInner {
    released: bool,
    session_listener: Option<Disposer>,
    tracks: HashMap<TrackId, Arc<ListenerRegistry>>,
}

/// Session-wide release point: the track-added listener plus one
/// [`ListenerRegistry`] per live track
#[derive(Default)]
pub struct TrackLifecycleCleanup {
    inner: Mutex<CleanupInner>,
}

impl TrackLifecycleCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how to remove the session's track-added listener
    pub fn set_session_listener(&self, dispose: impl FnOnce() + Send + 'static) {
        let previous = {
            let mut inner = self.lock();
            if inner.released {
                drop(inner);
                dispose();
                return;
            }
            inner.session_listener.replace(Box::new(dispose))
        };
        if let Some(previous) = previous {
            previous();
        }
    }

    /// Open a fresh registry for `track_id`.
    ///
    /// A registry still open under the same id is released first. After the
    /// session has been released the returned registry is already released.
    pub fn open_track(&self, track_id: &str) -> Arc<ListenerRegistry> {
        let registry = Arc::new(ListenerRegistry::new(track_id));
        let (stale, session_released) = {
            let mut inner = self.lock();
            if inner.released {
                (None, true)
            } else {
                (inner.tracks.insert(track_id.to_string(), registry.clone()), false)
            }
        };

        if let Some(stale) = stale {
            tracing::debug!("Replacing open registry for track {}", track_id);
            stale.release();
        }
        if session_released {
            registry.release();
        }
        registry
    }

    pub fn registry(&self, track_id: &str) -> Option<Arc<ListenerRegistry>> {
        self.lock().tracks.get(track_id).cloned()
    }

    /// Release and forget one track's registry. Returns the number of
    /// callbacks run, 0 if the track had nothing open.
    pub fn release_track(&self, track_id: &str) -> usize {
        let registry = self.lock().tracks.remove(track_id);
        registry.map(|r| r.release()).unwrap_or(0)
    }

    /// Release the session listener and every track registry. Idempotent.
    pub fn release(&self) -> usize {
        let (session_listener, tracks) = {
            let mut inner = self.lock();
            if inner.released {
                return 0;
            }
            inner.released = true;
            (
                inner.session_listener.take(),
                std::mem::take(&mut inner.tracks),
            )
        };

        let mut count = 0;
        if let Some(dispose) = session_listener {
            dispose();
            count += 1;
        }
        for registry in tracks.into_values() {
            count += registry.release();
        }

        tracing::debug!("Track lifecycle cleanup released {} callbacks", count);
        count
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn registry_len(&self, track_id: &str) -> usize {
        self.registry(track_id).map(|r| r.len()).unwrap_or(0)
    }

    pub fn open_tracks(&self) -> Vec<TrackId> {
        self.lock().tracks.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CleanupInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = count.clone();
        let make = move || {
            let c = shared.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (count, make)
    }

    #[test]
    fn test_release_runs_each_callback_once() {
        let (count, make) = counter();
        let registry = ListenerRegistry::new("t1");
        registry.register("mute", make());
        registry.register("ended", make());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.release(), 2);
        assert_eq!(registry.release(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
        assert!(registry.is_released());
    }

    #[test]
    fn test_register_after_release_disposes_immediately() {
        let (count, make) = counter();
        let registry = ListenerRegistry::new("t1");
        registry.release();

        assert!(!registry.register("presence", make()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_track_forgets_registry() {
        let (count, make) = counter();
        let cleanup = TrackLifecycleCleanup::new();
        cleanup.open_track("t1").register("ended", make());
        cleanup.open_track("t2").register("ended", make());

        assert_eq!(cleanup.release_track("t1"), 1);
        assert_eq!(cleanup.release_track("t1"), 0);
        assert_eq!(cleanup.open_tracks(), vec!["t2".to_string()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reopening_a_track_releases_the_stale_registry() {
        let (count, make) = counter();
        let cleanup = TrackLifecycleCleanup::new();
        let first = cleanup.open_track("t1");
        first.register("backoff", make());

        let second = cleanup.open_track("t1");
        assert!(first.is_released());
        assert!(!second.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_release_is_idempotent() {
        let (count, make) = counter();
        let cleanup = TrackLifecycleCleanup::new();
        cleanup.set_session_listener(make());
        cleanup.open_track("t1").register("mute", make());
        cleanup.open_track("t2").register("presence", make());

        assert_eq!(cleanup.release(), 3);
        assert_eq!(cleanup.release(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Anything opened afterwards is born released
        let late = cleanup.open_track("t3");
        assert!(late.is_released());
        late.register("ended", make());
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
