//! The save gate: drains the changed tiles of a map into a [`TileSaver`], but only while no object
//! that is required for saving has failed to load.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use thiserror::Error;

use crate::loading::LoadError;
use crate::world::coordinates::TileCoord;
use crate::world::streamed_tile::{StreamedTile, TileState, tile_path};
use crate::world::tile_index::{SpatialTileIndex, TileIndexError};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Persists a single tile. The format is up to the implementation.
pub trait TileSaver {
    fn save_tile(&mut self, map: &str, tile: &StreamedTile) -> Result<(), BoxedError>;
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Refusing to save: {0}")]
    CriticalFailures(#[source] LoadError),

    #[error(transparent)]
    Index(#[from] TileIndexError),
}

#[derive(Debug, Default)]
pub struct SaveReport {
    pub saved: Vec<TileCoord>,
    /// Tiles that could not be saved and are still marked as changed.
    pub failed: Vec<(TileCoord, String)>,
}

/// Hands every changed tile of `index` to `saver` and marks the saved ones as such.
///
/// Nothing is written while the loader's important-failure signal is raised: a tile referencing
/// data that failed to load would be saved without it. Call
/// [`crate::loading::AsyncLoader::acknowledge_important_failures`] to save anyway.
pub fn save_changed_tiles(index: &SpatialTileIndex, saver: &mut dyn TileSaver) -> Result<SaveReport, SaveError> {
    if let Err(err) = index.loader().check_important_failures() {
        error!("Not saving map {}: {}", index.map(), err);
        return Err(SaveError::CriticalFailures(err));
    }

    let mut report = SaveReport::default();
    for coord in index.changed_tiles() {
        let Some(tile) = index.tile(coord)? else {
            warn!("Changed tile {} of {} is not resident anymore", coord, index.map());
            continue;
        };

        if tile.wait_for_children().map_err(TileIndexError::from)? == TileState::Errored {
            report
                .failed
                .push((coord, "the tile failed to load".to_string()));
            continue;
        }

        match saver.save_tile(index.map(), &tile) {
            Ok(()) => {
                index.mark_saved(coord)?;
                report.saved.push(coord);
            }
            Err(err) => {
                error!("Saving tile {} of {} failed: {}", coord, index.map(), err);
                report.failed.push((coord, err.to_string()));
            }
        }
    }

    if !report.saved.is_empty() {
        info!("Saved {} tiles of {}", report.saved.len(), index.map());
    }
    Ok(report)
}

/// Writes tiles back into a data directory, using the same layout and manifest format they are read
/// from.
pub struct DirectoryTileSaver {
    root: PathBuf,
}

impl DirectoryTileSaver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl TileSaver for DirectoryTileSaver {
    fn save_tile(&mut self, map: &str, tile: &StreamedTile) -> Result<(), BoxedError> {
        let manifest = tile
            .manifest()
            .ok_or_else(|| format!("tile {} has no data", tile.coord()))?;

        let path = self.root.join(tile_path(map, tile.coord()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, manifest.to_bytes())?;
        Ok(())
    }
}
