//! The world side of streaming: tile coordinates, the tiles and the assets they reference, and the
//! spatial index that pages tiles in and out around a moving camera.

pub mod assets;
pub mod coordinates;
pub(crate) mod dependencies;
pub mod map_manager;
pub mod streamed_tile;
pub mod tile_index;
pub mod tile_iter;

pub use coordinates::{GRID_SIZE, TILE_COUNT, TILE_SIZE, TileCoord, world_to_tile};
pub use map_manager::MapManager;
pub use streamed_tile::{StreamedTile, TileState};
pub use tile_index::{SpatialTileIndex, TileFlags, TileIndexError, TileIndexStats, UnloadReport};
