use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::cache::{ResourceCache, ResourceGenerator, ResourceKey};
use crate::io::common::loader::RawAssetLoader;
use crate::io::common::manifest::{ReferenceManifest, decode_texture, parse_manifest};
use crate::loading::{LoadError, LoadStatus, Loadable, Priority};
use crate::world::dependencies::Dependencies;

pub type TextureCache = ResourceCache<TextureAsset, TextureGenerator>;
pub type ModelCache = ResourceCache<ModelAsset, ModelGenerator>;

pub struct TextureAsset {
    key: ResourceKey,
    identity: String,
    status: LoadStatus,
    source: Arc<dyn RawAssetLoader>,
    data: ArcSwapOption<Vec<u8>>,
}

impl TextureAsset {
    pub fn new(key: ResourceKey, source: Arc<dyn RawAssetLoader>) -> Self {
        Self {
            identity: key.identity.to_string(),
            key,
            status: LoadStatus::new(),
            source,
            data: ArcSwapOption::empty(),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// `None` until the texture is ready.
    pub fn data(&self) -> Option<Arc<Vec<u8>>> {
        self.data.load_full()
    }
}

impl Loadable for TextureAsset {
    fn status(&self) -> &LoadStatus {
        &self.status
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn begin_load(&self) -> Result<(), LoadError> {
        profiling::scope!("TextureAsset::begin_load");
        let data = self
            .source
            .load_raw_owned(&self.identity)
            .and_then(|bytes| decode_texture(&self.identity, bytes))
            .map_err(|err| LoadError::decode(&self.identity, err))?;

        self.data.store(Some(Arc::new(data)));
        Ok(())
    }

    fn priority_class(&self) -> Priority {
        Priority::Medium
    }
}

pub struct TextureGenerator {
    source: Arc<dyn RawAssetLoader>,
}

impl TextureGenerator {
    pub fn new(source: Arc<dyn RawAssetLoader>) -> Self {
        Self { source }
    }
}

impl ResourceGenerator<TextureAsset> for TextureGenerator {
    fn generate(&self, key: &ResourceKey) -> TextureAsset {
        TextureAsset::new(key.clone(), self.source.clone())
    }
}

/// A doodad model. Models reference textures of their own, so loading one fans out into the
/// texture cache.
pub struct ModelAsset {
    key: ResourceKey,
    identity: String,
    status: LoadStatus,
    source: Arc<dyn RawAssetLoader>,
    texture_cache: Arc<TextureCache>,
    textures: Dependencies<TextureAsset>,
    manifest: ArcSwapOption<ReferenceManifest>,
}

impl ModelAsset {
    pub fn new(key: ResourceKey, source: Arc<dyn RawAssetLoader>, texture_cache: Arc<TextureCache>) -> Self {
        Self {
            identity: key.identity.to_string(),
            key,
            status: LoadStatus::new(),
            source,
            texture_cache,
            textures: Dependencies::new(),
            manifest: ArcSwapOption::empty(),
        }
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
}

impl Loadable for ModelAsset {
    fn status(&self) -> &LoadStatus {
        &self.status
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn begin_load(&self) -> Result<(), LoadError> {
        profiling::scope!("ModelAsset::begin_load");
        let manifest = self
            .source
            .load_raw_owned(&self.identity)
            .and_then(|bytes| parse_manifest(&self.identity, &bytes))
            .map_err(|err| LoadError::decode(&self.identity, err))?;

        for texture in &manifest.textures {
            let key = ResourceKey::path(self.key.context, texture);
            self.textures
                .acquire(&self.texture_cache, key.clone())
                .map_err(|source| LoadError::ChildDependency {
                    parent: self.identity.clone(),
                    child: key.to_string(),
                    source,
                })?;
        }

        self.manifest.store(Some(Arc::new(manifest)));
        Ok(())
    }

    /// A tile saved with a model that failed to load would lose its placements.
    fn is_required_for_save(&self) -> bool {
        true
    }

    fn priority_class(&self) -> Priority {
        Priority::Low
    }

    fn is_finished(&self) -> bool {
        self.status.state().is_terminal() && self.textures.all_finished()
    }

    fn wait_until_finished(&self) {
        self.status.wait_until_settled();
        self.textures.wait_until_finished();
    }

    fn release(&self) {
        self.textures.release(&self.texture_cache);
    }
}

pub struct ModelGenerator {
    source: Arc<dyn RawAssetLoader>,
    texture_cache: Arc<TextureCache>,
}

impl ModelGenerator {
    pub fn new(source: Arc<dyn RawAssetLoader>, texture_cache: Arc<TextureCache>) -> Self {
        Self {
            source,
            texture_cache,
        }
    }
}

impl ResourceGenerator<ModelAsset> for ModelGenerator {
    fn generate(&self, key: &ResourceKey) -> ModelAsset {
        ModelAsset::new(key.clone(), self.source.clone(), self.texture_cache.clone())
    }
}
