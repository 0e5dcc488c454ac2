//! In-memory tile registry
//!
//! Owns tile state for one session. Tiles are created unbound, bound once
//! the attendee's dimensions and external id are known, and removed when
//! their track goes away or a newer tile supersedes them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tilebind_protocol::{Tile, TileBinding, TileId};

use crate::collaborators::TileRegistry;

#[derive(Default)]
struct RegistryInner {
    next_id: TileId,
    tiles: BTreeMap<TileId, Tile>,
}

#[derive(Default)]
pub struct InMemoryTileRegistry {
    inner: Mutex<RegistryInner>,
}

impl InMemoryTileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live tiles, ordered by creation
    pub fn tiles(&self) -> Vec<Tile> {
        self.lock().tiles.values().cloned().collect()
    }

    /// Tiles created but never bound
    pub fn unbound_tiles(&self) -> Vec<Tile> {
        self.lock()
            .tiles
            .values()
            .filter(|tile| !tile.is_bound())
            .cloned()
            .collect()
    }

    pub fn tiles_for_attendee(&self, attendee_id: &str) -> Vec<Tile> {
        self.lock()
            .tiles
            .values()
            .filter(|tile| tile.bound_attendee_id.as_deref() == Some(attendee_id))
            .cloned()
            .collect()
    }

    pub fn set_paused(&self, tile_id: TileId, paused: bool) -> bool {
        match self.lock().tiles.get_mut(&tile_id) {
            Some(tile) => {
                tile.paused = paused;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TileRegistry for InMemoryTileRegistry {
    fn add_tile(&self) -> TileId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.tiles.insert(id, Tile::new(id));
        tracing::debug!("Created tile {}", id);
        id
    }

    fn bind_video_stream(&self, tile_id: TileId, binding: TileBinding) -> bool {
        match self.lock().tiles.get_mut(&tile_id) {
            Some(tile) => {
                tile.apply(binding);
                true
            }
            None => false,
        }
    }

    fn remove_tile(&self, tile_id: TileId) -> bool {
        let removed = self.lock().tiles.remove(&tile_id).is_some();
        if removed {
            tracing::debug!("Removed tile {}", tile_id);
        }
        removed
    }

    fn remove_tiles_by_attendee_id(&self, attendee_id: &str) -> Vec<TileId> {
        let mut inner = self.lock();
        let doomed: Vec<TileId> = inner
            .tiles
            .values()
            .filter(|tile| tile.bound_attendee_id.as_deref() == Some(attendee_id))
            .map(|tile| tile.id)
            .collect();
        for id in &doomed {
            inner.tiles.remove(id);
        }
        doomed
    }

    fn tile(&self, tile_id: TileId) -> Option<Tile> {
        self.lock().tiles.get(&tile_id).cloned()
    }
}
