use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools;
use log::{info, warn};

use crate::cache::ContextId;
use crate::io::common::loader::RawAssetLoader;
use crate::loading::AsyncLoader;
use crate::settings::StreamingSettings;
use crate::world::assets::{ModelCache, ModelGenerator, TextureCache, TextureGenerator};
use crate::world::coordinates::{TILE_COUNT, TileCoord};
use crate::world::streamed_tile::{TileCache, TileGenerator, tile_path};
use crate::world::tile_index::{SpatialTileIndex, TileIndexError};

/// Owns the asset caches shared by every map and the index of the map that is currently open.
pub struct MapManager {
    loader: Arc<AsyncLoader>,
    source: Arc<dyn RawAssetLoader>,
    settings: StreamingSettings,
    context: ContextId,
    textures: Arc<TextureCache>,
    models: Arc<ModelCache>,
    current_map: Option<SpatialTileIndex>,
}

impl MapManager {
    pub fn new(
        loader: Arc<AsyncLoader>,
        source: Arc<dyn RawAssetLoader>,
        settings: StreamingSettings,
        context: ContextId,
    ) -> Self {
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

        Self {
            loader,
            source,
            settings,
            context,
            textures,
            models,
            current_map: None,
        }
    }

    pub fn loader(&self) -> &Arc<AsyncLoader> {
        &self.loader
    }

    pub fn textures(&self) -> &Arc<TextureCache> {
        &self.textures
    }

    pub fn models(&self) -> &Arc<ModelCache> {
        &self.models
    }

    /// The tiles of `map` that have saved data.
    pub fn discover_tiles(&self, map: &str) -> Vec<TileCoord> {
        (0..TILE_COUNT)
            .map(TileCoord::from_index)
            .filter(|coord| self.source.exists(&tile_path(map, *coord)))
            .collect_vec()
    }

    /// Closes the current map and opens `map`. Refuses to do so while the current map has unsaved
    /// tiles.
    pub fn change_map(&mut self, map: &str) -> Result<&SpatialTileIndex, TileIndexError> {
        self.close_map()?;

        let now = Instant::now();
        let on_disc = self.discover_tiles(map);
        if on_disc.is_empty() {
            warn!("Map {} has no tiles in the data directory", map);
        }

        let tiles = TileCache::new(
            "tiles",
            self.loader.clone(),
            TileGenerator::new(map, self.source.clone(), self.textures.clone(), self.models.clone()),
        );
        info!(
            "Opened map {} with {} tiles in {}ms",
            map,
            on_disc.len(),
            now.elapsed().as_millis()
        );

        let index = SpatialTileIndex::new(map, self.context, self.settings, tiles, on_disc);
        Ok(&*self.current_map.insert(index))
    }

    pub fn current_map(&self) -> Option<&SpatialTileIndex> {
        self.current_map.as_ref()
    }

    /// Evicts every tile of the current map. Fails, keeping the map open, if tiles are unsaved.
    pub fn close_map(&mut self) -> Result<(), TileIndexError> {
        let Some(index) = &self.current_map else {
            return Ok(());
        };

        let unsaved = index.changed_tiles();
        if !unsaved.is_empty() {
            return Err(TileIndexError::UnsavedChanges {
                map: index.map().to_string(),
                tiles: unsaved,
            });
        }

        self.current_map = None;
        Ok(())
    }

    /// Closes the current map even if it has unsaved tiles.
    pub fn discard_map(&mut self) {
        self.current_map = None;
    }
}
