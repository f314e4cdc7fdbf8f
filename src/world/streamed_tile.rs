use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::trace;

use crate::cache::{ContextId, Identity, ResourceGenerator, ResourceKey, canonicalize_path};
use crate::io::common::loader::RawAssetLoader;
use crate::io::common::manifest::{ReferenceManifest, parse_manifest};
use crate::loading::{AsyncLoader, LoadError, LoadState, LoadStatus, Loadable, Priority};
use crate::world::assets::{ModelAsset, ModelCache, TextureAsset, TextureCache};
use crate::world::coordinates::TileCoord;
use crate::world::dependencies::Dependencies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    Constructed,
    Queued,
    Loading,
    /// The tile itself is parsed, but textures or models it references are still loading. Draw
    /// it like a loading tile.
    ChildrenPending,
    Ready,
    Errored,
}

pub fn tile_path(map: &str, coord: TileCoord) -> String {
    let map = canonicalize_path(map);
    format!("world/maps/{}/{}_{}_{}.adt", map, map, coord.x, coord.y)
}

pub fn tile_key(context: ContextId, coord: TileCoord) -> ResourceKey {
    ResourceKey::id(context, coord.index() as u32)
}

/// One tile of world data. Loading it parses the tile's references and takes a reference on every
/// texture and model it names, so the tile only counts as finished once all of those are.
pub struct StreamedTile {
    coord: TileCoord,
    key: ResourceKey,
    identity: String,
    status: LoadStatus,
    source: Arc<dyn RawAssetLoader>,
    texture_cache: Arc<TextureCache>,
    model_cache: Arc<ModelCache>,
    textures: Dependencies<TextureAsset>,
    models: Dependencies<ModelAsset>,
    manifest: ArcSwapOption<ReferenceManifest>,
}

impl StreamedTile {
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn manifest(&self) -> Option<Arc<ReferenceManifest>> {
        self.manifest.load_full()
    }

    pub fn textures(&self) -> Vec<Arc<TextureAsset>> {
        self.textures.snapshot()
    }

    pub fn models(&self) -> Vec<Arc<ModelAsset>> {
        self.models.snapshot()
    }

    pub fn failed_children(&self) -> usize {
        self.textures.errored_count() + self.models.errored_count()
    }

    pub fn state(&self) -> TileState {
        match self.status.state() {
            LoadState::Constructed => TileState::Constructed,
            LoadState::Queued => TileState::Queued,
            LoadState::Loading => TileState::Loading,
            LoadState::Errored => TileState::Errored,
            LoadState::Ready => {
                // Missing textures are drawn as placeholders, missing models lose data.
                let child_failed = self.models.any_required_errored() || self.textures.any_required_errored();
                if child_failed && self.is_required_for_save() {
                    TileState::Errored
                } else if self.models.all_finished() && self.textures.all_finished() {
                    TileState::Ready
                } else {
                    TileState::ChildrenPending
                }
            }
        }
    }

    /// Blocks until the tile and everything it references finished loading. For code paths that
    /// need the tile fully usable, like export tooling. Must not be called from a loader thread.
    pub fn wait_for_children(&self) -> Result<TileState, LoadError> {
        if AsyncLoader::is_loader_thread() {
            return Err(LoadError::WouldDeadlock {
                identity: self.identity.clone(),
            });
        }

        self.wait_until_finished();
        Ok(self.state())
    }

    /// Paints an additional texture onto the tile. Only valid once the tile itself is loaded.
    pub(crate) fn add_texture(&self, path: &str) -> Result<Arc<TextureAsset>, LoadError> {
        let key = ResourceKey::path(self.key.context, path);
        let texture = self
            .textures
            .acquire(&self.texture_cache, key.clone())
            .map_err(|source| LoadError::ChildDependency {
                parent: self.identity.clone(),
                child: key.to_string(),
                source,
            })?;

        let path = match &key.identity {
            Identity::Path(path) => path.clone(),
            Identity::Id(_) => key.identity.to_string(),
        };
        self.manifest.rcu(|current| {
            let mut manifest = current.as_deref().cloned().unwrap_or_default();
            if !manifest.textures.contains(&path) {
                manifest.textures.push(path.clone());
            }
            Some(Arc::new(manifest))
        });
        Ok(texture)
    }
}

impl Loadable for StreamedTile {
    fn status(&self) -> &LoadStatus {
        &self.status
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn begin_load(&self) -> Result<(), LoadError> {
        profiling::scope!("StreamedTile::begin_load");
        let manifest = self
            .source
            .load_raw_owned(&self.identity)
            .and_then(|bytes| parse_manifest(&self.identity, &bytes))
            .map_err(|err| LoadError::decode(&self.identity, err))?;

        let context = self.key.context;
        for texture in &manifest.textures {
            let key = ResourceKey::path(context, texture);
            self.textures
                .acquire(&self.texture_cache, key.clone())
                .map_err(|source| self.child_error(&key, source))?;
        }

        for model in &manifest.models {
            let key = ResourceKey::path(context, model);
            self.models
                .acquire(&self.model_cache, key.clone())
                .map_err(|source| self.child_error(&key, source))?;
        }

        trace!(
            "Parsed tile {}, referencing {} textures and {} models",
            self.coord,
            manifest.textures.len(),
            manifest.models.len()
        );
        self.manifest.store(Some(Arc::new(manifest)));
        Ok(())
    }

    /// Saving a tile whose data failed to load would overwrite it with nothing.
    fn is_required_for_save(&self) -> bool {
        true
    }

    fn priority_class(&self) -> Priority {
        Priority::High
    }

    fn is_finished(&self) -> bool {
        matches!(self.state(), TileState::Ready | TileState::Errored)
    }

    fn errored(&self) -> bool {
        self.state() == TileState::Errored
    }

    fn wait_until_finished(&self) {
        self.status.wait_until_settled();
        self.models.wait_until_finished();
        self.textures.wait_until_finished();
    }

    /// Models first: they may hold references on the same textures.
    fn release(&self) {
        self.models.release(&self.model_cache);
        self.textures.release(&self.texture_cache);
    }
}

impl StreamedTile {
    fn child_error(&self, child: &ResourceKey, source: crate::cache::CacheError) -> LoadError {
        LoadError::ChildDependency {
            parent: self.identity.clone(),
            child: child.to_string(),
            source,
        }
    }
}

pub type TileCache = crate::cache::ResourceCache<StreamedTile, TileGenerator>;

pub struct TileGenerator {
    map: String,
    source: Arc<dyn RawAssetLoader>,
    texture_cache: Arc<TextureCache>,
    model_cache: Arc<ModelCache>,
}

impl TileGenerator {
    pub fn new(
        map: &str,
        source: Arc<dyn RawAssetLoader>,
        texture_cache: Arc<TextureCache>,
        model_cache: Arc<ModelCache>,
    ) -> Self {
        Self {
            map: map.to_string(),
            source,
            texture_cache,
            model_cache,
        }
    }
}

impl ResourceGenerator<StreamedTile> for TileGenerator {
    fn generate(&self, key: &ResourceKey) -> StreamedTile {
        // Tile keys are only ever built by tile_key. Anything else ends up as a tile that fails to
        // load, rather than a panic under the cache lock.
        let coord = match key.identity {
            Identity::Id(index) => TileCoord::from_index(index as usize),
            Identity::Path(_) => TileCoord::new(-1, -1),
        };

        StreamedTile {
            coord,
            key: key.clone(),
            identity: tile_path(&self.map, coord),
            status: LoadStatus::new(),
            source: self.source.clone(),
            texture_cache: self.texture_cache.clone(),
            model_cache: self.model_cache.clone(),
            textures: Dependencies::new(),
            models: Dependencies::new(),
            manifest: ArcSwapOption::empty(),
        }
    }
}
