use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitflags::bitflags;
use itertools::Itertools;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::cache::{CacheError, ContextId};
use crate::loading::{AsyncLoader, LoadError, LoadState, Loadable};
use crate::settings::StreamingSettings;
use crate::world::coordinates::{TILE_COUNT, TileCoord};
use crate::world::streamed_tile::{StreamedTile, TileCache, TileState, tile_key};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TileFlags: u32 {
        /// Modified since the last successful save.
        const CHANGED = 0x1;
        /// Out of range, but kept resident until it has been saved.
        const EVICTION_DEFERRED = 0x2;
    }
}

#[derive(Error, Debug)]
pub enum TileIndexError {
    #[error("{0} is outside of the 64x64 tile grid")]
    InvalidCoordinate(TileCoord),

    #[error("Map {map} has no tile at {coord}")]
    NoSuchTile { map: String, coord: TileCoord },

    #[error("Tile {0} is not loaded")]
    NotLoaded(TileCoord),

    #[error("Map {map} has {} tiles with unsaved changes", .tiles.len())]
    UnsavedChanges { map: String, tiles: Vec<TileCoord> },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

pub(crate) struct TileGridEntry {
    pub flags: TileFlags,
    pub tile: Option<Arc<StreamedTile>>,
    pub on_disc: bool,
    pub last_proximity: Instant,
}

impl TileGridEntry {
    fn is_dirty(&self) -> bool {
        self.flags.contains(TileFlags::CHANGED)
    }
}

pub(crate) struct TileGrid {
    pub entries: Vec<TileGridEntry>,
    /// Every tile with [`TileFlags::CHANGED`], waiting to be drained by the save path.
    pub changed: BTreeSet<TileCoord>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnloadReport {
    pub evicted: Vec<TileCoord>,
    /// Out of range, but dirty. These stay resident and are listed in the changed tiles.
    pub deferred: Vec<TileCoord>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TileIndexStats {
    pub on_disc: usize,
    pub resident: usize,
    pub ready: usize,
    pub pending: usize,
    pub errored: usize,
    pub changed: usize,
}

/// The streaming state of one map: which of its 64x64 tiles exist, which are resident, and which
/// carry unsaved edits.
///
/// Tiles are owned through the index's tile cache, keyed by their grid index. The grid lock is
/// never held while waiting for a worker: evictions are collected under the lock and erased from
/// the cache afterwards.
pub struct SpatialTileIndex {
    map: String,
    context: ContextId,
    settings: StreamingSettings,
    tiles: TileCache,
    pub(crate) grid: Mutex<TileGrid>,
}

impl SpatialTileIndex {
    pub fn new(
        map: &str,
        context: ContextId,
        settings: StreamingSettings,
        tiles: TileCache,
        on_disc: impl IntoIterator<Item = TileCoord>,
    ) -> Self {
        let now = Instant::now();
        let mut entries = (0..TILE_COUNT)
            .map(|_| TileGridEntry {
                flags: TileFlags::empty(),
                tile: None,
                on_disc: false,
                last_proximity: now,
            })
            .collect_vec();

        for coord in on_disc {
            if coord.is_valid() {
                entries[coord.index()].on_disc = true;
            } else {
                warn!("Ignoring tile {} of map {}, it is outside of the grid", coord, map);
            }
        }

        Self {
            map: map.to_string(),
            context,
            settings,
            tiles,
            grid: Mutex::new(TileGrid {
                entries,
                changed: BTreeSet::new(),
            }),
        }
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    pub fn loader(&self) -> &Arc<AsyncLoader> {
        self.tiles.loader()
    }

    pub(crate) fn check(coord: TileCoord) -> Result<usize, TileIndexError> {
        if coord.is_valid() {
            Ok(coord.index())
        } else {
            Err(TileIndexError::InvalidCoordinate(coord))
        }
    }

    fn lock_grid(&self) -> std::sync::MutexGuard<'_, TileGrid> {
        self.grid.lock().expect("Tile Grid Lock")
    }

    /// Whether the map has data for `coord`, either saved on disc or resident.
    pub fn has_tile(&self, coord: TileCoord) -> Result<bool, TileIndexError> {
        let index = Self::check(coord)?;
        let grid = self.lock_grid();
        let entry = &grid.entries[index];
        Ok(entry.on_disc || entry.tile.is_some())
    }

    pub fn is_on_disc(&self, coord: TileCoord) -> Result<bool, TileIndexError> {
        let index = Self::check(coord)?;
        Ok(self.lock_grid().entries[index].on_disc)
    }

    /// The resident tile at `coord`, in whatever state it currently is.
    pub fn tile(&self, coord: TileCoord) -> Result<Option<Arc<StreamedTile>>, TileIndexError> {
        let index = Self::check(coord)?;
        Ok(self.lock_grid().entries[index].tile.clone())
    }

    /// Resident, and the tile and all of its children are ready.
    pub fn is_tile_loaded(&self, coord: TileCoord) -> Result<bool, TileIndexError> {
        Ok(self
            .tile(coord)?
            .is_some_and(|tile| tile.state() == TileState::Ready))
    }

    /// Makes the tile at `coord` resident, without waiting for it to load.
    pub fn load_tile(&self, coord: TileCoord) -> Result<Arc<StreamedTile>, TileIndexError> {
        let index = Self::check(coord)?;
        let mut grid = self.lock_grid();
        let entry = &mut grid.entries[index];
        entry.last_proximity = Instant::now();
        if let Some(tile) = &entry.tile {
            return Ok(tile.clone());
        }

        if !entry.on_disc {
            return Err(TileIndexError::NoSuchTile {
                map: self.map.clone(),
                coord,
            });
        }

        let tile = self.tiles.emplace(&tile_key(self.context, coord))?;
        entry.tile = Some(tile.clone());
        Ok(tile)
    }

    /// Requests every existing tile within the load radius of `center` and refreshes their
    /// proximity. Returns the tiles that were newly requested.
    pub fn enter_tile(&self, center: TileCoord) -> Result<Vec<TileCoord>, TileIndexError> {
        profiling::scope!("SpatialTileIndex::enter_tile");
        Self::check(center)?;

        let now = Instant::now();
        let mut requested = Vec::new();
        let mut grid = self.lock_grid();
        for coord in center.neighbourhood(self.settings.load_radius) {
            let entry = &mut grid.entries[coord.index()];
            entry.last_proximity = now;
            if entry.tile.is_some() || !entry.on_disc {
                continue;
            }

            entry.tile = Some(self.tiles.emplace(&tile_key(self.context, coord))?);
            requested.push(coord);
        }

        if !requested.is_empty() {
            trace!(
                "Entering {} of {} requested {} tiles",
                center,
                self.map,
                requested.len()
            );
        }
        Ok(requested)
    }

    /// Evicts every resident tile farther than the unload radius from `center` that has not been
    /// near the camera for the unload interval. Dirty tiles are never evicted, they are kept
    /// resident and stay in the changed tiles until saved.
    pub fn unload_tiles(&self, center: TileCoord) -> Result<UnloadReport, TileIndexError> {
        profiling::scope!("SpatialTileIndex::unload_tiles");
        Self::check(center)?;

        let now = Instant::now();
        let mut report = UnloadReport::default();
        let mut evicted = Vec::new();
        {
            let mut grid = self.lock_grid();
            let TileGrid { entries, changed } = &mut *grid;
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.tile.is_none() {
                    continue;
                }

                let coord = TileCoord::from_index(index);
                let out_of_range = coord.chebyshev_distance(center) > self.settings.unload_radius;
                let expired = now.duration_since(entry.last_proximity) >= self.settings.unload_interval;
                if !out_of_range || !expired {
                    continue;
                }

                if entry.is_dirty() {
                    if !entry.flags.contains(TileFlags::EVICTION_DEFERRED) {
                        info!(
                            "Tile {} of {} has unsaved changes, keeping it until it is saved",
                            coord, self.map
                        );
                        entry.flags.insert(TileFlags::EVICTION_DEFERRED);
                    }
                    changed.insert(coord);
                    report.deferred.push(coord);
                    continue;
                }

                if let Some(tile) = entry.tile.take() {
                    evicted.push(tile);
                    report.evicted.push(coord);
                }
            }
        }

        self.release_tiles(evicted);
        Ok(report)
    }

    /// Evicts every clean tile. Returns the dirty tiles, which stay resident.
    pub fn unload_all(&self) -> Vec<TileCoord> {
        let mut kept = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut grid = self.lock_grid();
            let TileGrid { entries, changed } = &mut *grid;
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.tile.is_none() {
                    continue;
                }

                let coord = TileCoord::from_index(index);
                if entry.is_dirty() {
                    entry.flags.insert(TileFlags::EVICTION_DEFERRED);
                    changed.insert(coord);
                    kept.push(coord);
                } else if let Some(tile) = entry.tile.take() {
                    evicted.push(tile);
                }
            }
        }

        self.release_tiles(evicted);
        kept
    }

    /// Gives the index's references back to the tile cache. Blocks while a worker still loads one
    /// of them, so this must run without the grid lock.
    fn release_tiles(&self, tiles: Vec<Arc<StreamedTile>>) {
        for tile in tiles {
            let coord = tile.coord();
            let key = tile.key().clone();
            drop(tile);
            match self.tiles.erase(&key) {
                Ok(_) => debug!("Evicted tile {} of {}", coord, self.map),
                Err(err) => warn!("Evicting tile {} of {} failed: {}", coord, self.map, err),
            }
        }
    }

    /// Flags a resident tile as modified by an edit made outside of the index.
    pub fn mark_changed(&self, coord: TileCoord) -> Result<(), TileIndexError> {
        let index = Self::check(coord)?;
        let mut grid = self.lock_grid();
        if grid.entries[index].tile.is_none() {
            return Err(TileIndexError::NotLoaded(coord));
        }

        grid.entries[index].flags.insert(TileFlags::CHANGED);
        grid.changed.insert(coord);
        Ok(())
    }

    /// Paints an additional texture onto a loaded tile and marks it changed.
    pub fn add_texture(&self, coord: TileCoord, path: &str) -> Result<(), TileIndexError> {
        let index = Self::check(coord)?;
        let mut grid = self.lock_grid();
        let tile = grid.entries[index]
            .tile
            .clone()
            .filter(|tile| tile.status().state() == LoadState::Ready)
            .ok_or(TileIndexError::NotLoaded(coord))?;

        // The grid lock keeps the tile from being evicted (and released) while it takes the
        // reference.
        tile.add_texture(path)?;
        grid.entries[index].flags.insert(TileFlags::CHANGED);
        grid.changed.insert(coord);
        Ok(())
    }

    pub fn is_changed(&self, coord: TileCoord) -> Result<bool, TileIndexError> {
        let index = Self::check(coord)?;
        Ok(self.lock_grid().entries[index].is_dirty())
    }

    /// The tiles waiting to be saved, in grid order.
    pub fn changed_tiles(&self) -> Vec<TileCoord> {
        self.lock_grid().changed.iter().copied().collect_vec()
    }

    /// Called by the save path after `coord` was persisted. The tile is on disc from now on and
    /// becomes evictable again.
    pub fn mark_saved(&self, coord: TileCoord) -> Result<(), TileIndexError> {
        let index = Self::check(coord)?;
        let mut grid = self.lock_grid();
        let entry = &mut grid.entries[index];
        entry.on_disc = true;
        entry
            .flags
            .remove(TileFlags::CHANGED | TileFlags::EVICTION_DEFERRED);
        grid.changed.remove(&coord);
        Ok(())
    }

    pub fn stats(&self) -> TileIndexStats {
        let mut stats = TileIndexStats::default();
        let tiles = {
            let grid = self.lock_grid();
            stats.changed = grid.changed.len();
            stats.on_disc = grid.entries.iter().filter(|entry| entry.on_disc).count();
            grid.entries
                .iter()
                .filter_map(|entry| entry.tile.clone())
                .collect_vec()
        };

        // Tile states look into the child caches, which must not happen under the grid lock.
        stats.resident = tiles.len();
        for tile in tiles {
            match tile.state() {
                TileState::Ready => stats.ready += 1,
                TileState::Errored => stats.errored += 1,
                _ => stats.pending += 1,
            }
        }
        stats
    }
}

impl Drop for SpatialTileIndex {
    fn drop(&mut self) {
        let grid = self.grid.get_mut().expect("Tile Grid Lock");
        if !grid.changed.is_empty() {
            warn!(
                "Closing map {} discards unsaved changes of {} tiles",
                self.map,
                grid.changed.len()
            );
        }

        let tiles = grid
            .entries
            .iter_mut()
            .filter_map(|entry| entry.tile.take())
            .collect_vec();
        self.release_tiles(tiles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::common::loader::RawAssetLoader;
    use crate::io::memory::MemoryLoader;
    use crate::world::assets::{ModelCache, ModelGenerator, TextureCache, TextureGenerator};
    use crate::world::streamed_tile::{TileGenerator, tile_path};
    use std::time::Duration;

    fn index_with(on_disc: &[TileCoord]) -> (Arc<AsyncLoader>, SpatialTileIndex) {
        index_with_settings(
            on_disc,
            StreamingSettings {
                worker_threads: 2,
                load_radius: 1,
                unload_radius: 2,
                unload_interval: Duration::ZERO,
            },
        )
    }

    fn index_with_settings(
        on_disc: &[TileCoord],
        settings: StreamingSettings,
    ) -> (Arc<AsyncLoader>, SpatialTileIndex) {
        let loader = Arc::new(AsyncLoader::start(settings.worker_threads).unwrap());
        let memory = MemoryLoader::new();
        for coord in on_disc {
            memory.insert(&tile_path("test", *coord), "texture world/grass.blp\n");
        }
        memory.insert("world/grass.blp", vec![1, 2, 3]);

        let source: Arc<dyn RawAssetLoader> = Arc::new(memory);
        let textures = Arc::new(TextureCache::new(
            "textures",
            loader.clone(),
            TextureGenerator::new(source.clone()),
        ));
        let models = Arc::new(ModelCache::new(
            "models",
            loader.clone(),
            ModelGenerator::new(source.clone(), textures.clone()),
        ));
        let tiles = TileCache::new(
            "tiles",
            loader.clone(),
            TileGenerator::new("test", source, textures, models),
        );

        let index = SpatialTileIndex::new("test", ContextId(0), settings, tiles, on_disc.iter().copied());
        (loader, index)
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let (_loader, index) = index_with(&[]);
        assert!(matches!(
            index.enter_tile(TileCoord::new(70, 70)),
            Err(TileIndexError::InvalidCoordinate(_))
        ));
        assert!(matches!(
            index.has_tile(TileCoord::new(-1, 3)),
            Err(TileIndexError::InvalidCoordinate(_))
        ));
    }

    #[test]
    fn enter_tile_is_idempotent() {
        let center = TileCoord::new(10, 10);
        let (loader, index) = index_with(&center.neighbourhood(1).collect_vec());

        let first = index.enter_tile(center).unwrap();
        assert_eq!(first.len(), 9);
        assert!(index.enter_tile(center).unwrap().is_empty());

        loader.wait_until_idle().unwrap();
        assert!(index.is_tile_loaded(center).unwrap());
        assert_eq!(index.stats().resident, 9);
    }

    #[test]
    fn tiles_that_are_not_on_disc_are_not_requested() {
        let (_loader, index) = index_with(&[TileCoord::new(0, 0)]);
        let requested = index.enter_tile(TileCoord::new(0, 0)).unwrap();
        assert_eq!(requested, vec![TileCoord::new(0, 0)]);
        assert!(!index.has_tile(TileCoord::new(1, 1)).unwrap());
        assert!(matches!(
            index.load_tile(TileCoord::new(1, 1)),
            Err(TileIndexError::NoSuchTile { .. })
        ));
    }

    #[test]
    fn unload_keeps_tiles_inside_the_radius() {
        let tiles = [TileCoord::new(5, 5), TileCoord::new(9, 5)];
        let (loader, index) = index_with(&tiles);
        index.load_tile(tiles[0]).unwrap();
        index.load_tile(tiles[1]).unwrap();
        loader.wait_until_idle().unwrap();

        let report = index.unload_tiles(TileCoord::new(7, 5)).unwrap();
        assert!(report.evicted.is_empty());

        let report = index.unload_tiles(TileCoord::new(9, 5)).unwrap();
        assert_eq!(report.evicted, vec![tiles[0]]);
        assert!(index.tile(tiles[0]).unwrap().is_none());
        assert!(index.tile(tiles[1]).unwrap().is_some());
    }

    #[test]
    fn unload_waits_for_the_unload_interval() {
        let interval = Duration::from_millis(300);
        let near = TileCoord::new(5, 5);
        let far = TileCoord::new(20, 5);
        let (loader, index) = index_with_settings(
            &[near],
            StreamingSettings {
                worker_threads: 2,
                load_radius: 1,
                unload_radius: 2,
                unload_interval: interval,
            },
        );
        index.enter_tile(near).unwrap();
        loader.wait_until_idle().unwrap();

        let report = index.unload_tiles(far).unwrap();
        assert!(report.evicted.is_empty());
        assert!(index.tile(near).unwrap().is_some());

        std::thread::sleep(interval);
        let report = index.unload_tiles(far).unwrap();
        assert_eq!(report.evicted, vec![near]);
        assert!(index.tile(near).unwrap().is_none());
    }

    #[test]
    fn huge_load_radius_requests_everything_on_disc() {
        let center = TileCoord::new(10, 10);
        let (loader, index) = index_with_settings(
            &center.neighbourhood(1).collect_vec(),
            StreamingSettings {
                worker_threads: 2,
                load_radius: u32::MAX,
                unload_radius: u32::MAX,
                unload_interval: Duration::ZERO,
            },
        );
        assert_eq!(index.enter_tile(center).unwrap().len(), 9);
        loader.wait_until_idle().unwrap();
        assert_eq!(index.stats().resident, 9);
    }

    #[test]
    fn mark_saved_clears_the_changed_flag() {
        let coord = TileCoord::new(3, 3);
        let (loader, index) = index_with(&[coord]);
        assert!(matches!(
            index.mark_changed(coord),
            Err(TileIndexError::NotLoaded(_))
        ));

        index.load_tile(coord).unwrap();
        loader.wait_until_idle().unwrap();
        index.mark_changed(coord).unwrap();
        assert!(index.is_changed(coord).unwrap());
        assert_eq!(index.changed_tiles(), vec![coord]);

        index.mark_saved(coord).unwrap();
        assert!(!index.is_changed(coord).unwrap());
        assert!(index.changed_tiles().is_empty());
    }
}
