use std::sync::Arc;

use glam::Vec2;
use log::warn;

use crate::loading::{AsyncLoader, LoadError};
use crate::world::coordinates::{TILE_COUNT, TileCoord, tile_intersects_circle, tile_intersects_rect};
use crate::world::streamed_tile::{StreamedTile, TileState};
use crate::world::tile_index::{SpatialTileIndex, TileIndexError};

/// Walks the grid in index order, yielding resident tiles accepted by the predicate. The grid lock
/// is only held to find the next candidate, so tiles may come and go while iterating.
pub struct ResidentTiles<'a, P> {
    index: &'a SpatialTileIndex,
    cursor: usize,
    predicate: P,
}

impl<'a, P> ResidentTiles<'a, P>
where
    P: FnMut(TileCoord, &StreamedTile) -> bool,
{
    fn new(index: &'a SpatialTileIndex, predicate: P) -> Self {
        Self {
            index,
            cursor: 0,
            predicate,
        }
    }

    /// Starts over at the first grid coordinate.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl<P> Iterator for ResidentTiles<'_, P>
where
    P: FnMut(TileCoord, &StreamedTile) -> bool,
{
    type Item = Arc<StreamedTile>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < TILE_COUNT {
            let candidate = {
                let grid = self.index.grid.lock().expect("Tile Grid Lock");
                let found = grid.entries[self.cursor..]
                    .iter()
                    .position(|entry| entry.tile.is_some())
                    .map(|offset| self.cursor + offset);
                found.and_then(|index| grid.entries[index].tile.clone().map(|tile| (index, tile)))
            };

            let (index, tile) = candidate?;
            self.cursor = index + 1;
            if (self.predicate)(TileCoord::from_index(index), &tile) {
                return Some(tile);
            }
        }
        None
    }
}

/// Walks the tiles of the map accepted by the predicate, making each one resident and blocking
/// until it and its children finished loading before yielding it. For tooling that needs tile
/// contents synchronously.
pub struct LoadingTiles<'a, P> {
    index: &'a SpatialTileIndex,
    cursor: usize,
    predicate: P,
}

impl<'a, P> LoadingTiles<'a, P>
where
    P: FnMut(TileCoord) -> bool,
{
    fn new(index: &'a SpatialTileIndex, predicate: P) -> Self {
        Self {
            index,
            cursor: 0,
            predicate,
        }
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl<P> Iterator for LoadingTiles<'_, P>
where
    P: FnMut(TileCoord) -> bool,
{
    type Item = Result<Arc<StreamedTile>, TileIndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor < TILE_COUNT && AsyncLoader::is_loader_thread() {
            self.cursor = TILE_COUNT;
            return Some(Err(LoadError::WouldDeadlock {
                identity: format!("tiles of {}", self.index.map()),
            }
            .into()));
        }

        while self.cursor < TILE_COUNT {
            let coord = TileCoord::from_index(self.cursor);
            self.cursor += 1;

            match self.index.has_tile(coord) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => return Some(Err(err)),
            }
            if !(self.predicate)(coord) {
                continue;
            }

            let result = self.index.load_tile(coord).and_then(|tile| {
                if tile.wait_for_children()? == TileState::Errored {
                    warn!("Tile {} of {} failed to load", coord, self.index.map());
                }
                Ok(tile)
            });
            return Some(result);
        }
        None
    }
}

impl SpatialTileIndex {
    pub fn resident_tiles(&self) -> ResidentTiles<'_, impl FnMut(TileCoord, &StreamedTile) -> bool> {
        ResidentTiles::new(self, |_: TileCoord, _: &StreamedTile| true)
    }

    pub fn resident_tiles_where<P>(&self, predicate: P) -> ResidentTiles<'_, P>
    where
        P: FnMut(TileCoord, &StreamedTile) -> bool,
    {
        ResidentTiles::new(self, predicate)
    }

    /// Resident tiles overlapping the circle around `position` (map space).
    pub fn tiles_in_range(
        &self,
        position: Vec2,
        radius: f32,
    ) -> ResidentTiles<'_, impl FnMut(TileCoord, &StreamedTile) -> bool> {
        ResidentTiles::new(self, move |coord: TileCoord, _: &StreamedTile| {
            tile_intersects_circle(coord, position, radius)
        })
    }

    /// Resident tiles overlapping the rectangle spanned by `a` and `b` (map space).
    pub fn tiles_in_rect(&self, a: Vec2, b: Vec2) -> ResidentTiles<'_, impl FnMut(TileCoord, &StreamedTile) -> bool> {
        ResidentTiles::new(self, move |coord: TileCoord, _: &StreamedTile| {
            tile_intersects_rect(coord, a, b)
        })
    }

    /// Loads every existing tile accepted by `predicate` and yields it once it is fully loaded.
    /// Must not be driven from a loader thread.
    pub fn load_tiles_blocking<P>(&self, predicate: P) -> LoadingTiles<'_, P>
    where
        P: FnMut(TileCoord) -> bool,
    {
        LoadingTiles::new(self, predicate)
    }
}
