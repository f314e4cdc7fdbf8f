use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, info, trace, warn};

use crate::cache::ContextId;
use crate::io::common::loader::RawAssetLoader;
use crate::loading::{AsyncLoader, Loadable};
use crate::save::{DirectoryTileSaver, SaveReport, save_changed_tiles};
use crate::settings::{RectArg, StreamingSettings};
use crate::world::coordinates::TileCoord;
use crate::world::map_manager::MapManager;

const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// The top-level context. It owns the loader handle, everything else borrows it through `Arc`s.
pub struct EditorApplication {
    // Dropped before the loader, so the caches are torn down while workers still run.
    pub map_manager: MapManager,
    pub loader: Arc<AsyncLoader>,
    data_dir: PathBuf,
}

impl EditorApplication {
    pub fn new(
        settings: StreamingSettings,
        source: Arc<dyn RawAssetLoader>,
        data_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let loader = Arc::new(
            AsyncLoader::start(settings.worker_threads).context("Spawning the async loader threads")?,
        );

        Ok(Self {
            map_manager: MapManager::new(loader.clone(), source, settings, ContextId::default()),
            loader,
            data_dir: data_dir.into(),
        })
    }

    /// Moves the camera tile by tile from `from` to `to`, like a render loop would: enter the tile,
    /// unload what fell behind, then poll until everything resident finished loading.
    pub fn walk(&mut self, map: &str, from: TileCoord, to: TileCoord) -> anyhow::Result<()> {
        let index = self
            .map_manager
            .change_map(map)
            .with_context(|| format!("Opening map {}", map))?;

        let now = Instant::now();
        let mut camera = from;
        loop {
            let requested = index.enter_tile(camera)?;
            let report = index.unload_tiles(camera)?;
            trace!(
                "Camera at {}: requested {}, evicted {}, deferred {}",
                camera,
                requested.len(),
                report.evicted.len(),
                report.deferred.len()
            );

            while index.resident_tiles().any(|tile| !tile.is_finished()) {
                profiling::finish_frame!();
                std::thread::sleep(POLL_INTERVAL);
            }

            let stats = index.stats();
            info!(
                "{}: {} resident, {} ready, {} errored, {} changed",
                camera, stats.resident, stats.ready, stats.errored, stats.changed
            );

            if camera == to {
                break;
            }
            camera = TileCoord::new(
                camera.x + (to.x - camera.x).signum(),
                camera.y + (to.y - camera.y).signum(),
            );
        }

        let stats = index.stats();
        println!(
            "Walked {} -> {} on {} in {}ms: {} tiles on disc, {} resident ({} ready, {} errored)",
            from,
            to,
            map,
            now.elapsed().as_millis(),
            stats.on_disc,
            stats.resident,
            stats.ready,
            stats.errored
        );
        println!(
            "{} textures and {} models resident",
            self.map_manager.textures().len(),
            self.map_manager.models().len()
        );
        Ok(())
    }

    /// Loads every tile of `rect` synchronously and prints what it references.
    pub fn export(&mut self, map: &str, rect: RectArg) -> anyhow::Result<()> {
        let index = self
            .map_manager
            .change_map(map)
            .with_context(|| format!("Opening map {}", map))?;

        let mut exported = 0;
        for tile in index.load_tiles_blocking(|coord| rect.contains(coord)) {
            let tile = tile?;
            let (textures, models) = tile
                .manifest()
                .map(|manifest| (manifest.textures.len(), manifest.models.len()))
                .unwrap_or_default();
            println!(
                "{} {:?}: {} textures, {} models, {} failed",
                tile.coord(),
                tile.state(),
                textures,
                models,
                tile.failed_children()
            );
            exported += 1;
        }

        if exported == 0 {
            warn!("Map {} has no tiles in {:?}", map, rect);
        }

        let kept = index.unload_all();
        if !kept.is_empty() {
            warn!("{} changed tiles stay resident", kept.len());
        }
        Ok(())
    }

    /// Saves the changed tiles of the current map into the data directory.
    pub fn save(&self) -> anyhow::Result<SaveReport> {
        let index = self
            .map_manager
            .current_map()
            .context("No map is open")?;
        let mut saver = DirectoryTileSaver::new(&self.data_dir);
        Ok(save_changed_tiles(index, &mut saver)?)
    }

    /// Saves and closes the current map, then stops the loader. Unsaved tiles are never dropped:
    /// if saving is refused or fails for some tiles, the map and the loader stay up and the error
    /// is returned.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        let has_changes = self
            .map_manager
            .current_map()
            .is_some_and(|index| !index.changed_tiles().is_empty());
        if has_changes {
            let report = self.save().context("Saving before shutdown")?;
            for (coord, reason) in &report.failed {
                error!("Tile {} could not be saved: {}", coord, reason);
            }
        }
        self.map_manager
            .close_map()
            .context("Closing the map before shutdown")?;

        let failures = self.loader.important_failures();
        if !failures.is_empty() {
            warn!("These assets failed to load: {}", failures.join(", "));
        }
        self.loader.shutdown();
        Ok(())
    }
}
