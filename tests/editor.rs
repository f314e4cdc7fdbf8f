use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tilestream::editor::application::EditorApplication;
use tilestream::io::common::manifest::parse_manifest;
use tilestream::io::fs::loader::FsLoader;
use tilestream::settings::StreamingSettings;
use tilestream::world::TileCoord;
use tilestream::world::streamed_tile::tile_path;

const MAP: &str = "test";

fn write(root: &Path, path: &str, contents: &[u8]) -> anyhow::Result<()> {
    let full_path = root.join(path);
    if let Some(parent) = full_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(full_path, contents)?;
    Ok(())
}

fn application(root: &Path) -> anyhow::Result<EditorApplication> {
    write(root, &tile_path(MAP, TileCoord::new(3, 3)), b"texture world/grass.blp\n")?;
    write(root, &tile_path(MAP, TileCoord::new(8, 8)), b"bogus line\n")?;
    write(root, "world/grass.blp", &[1, 2, 3])?;
    write(root, "world/rock.blp", &[4, 5, 6])?;

    let settings = StreamingSettings {
        worker_threads: 2,
        load_radius: 0,
        unload_radius: 1,
        unload_interval: Duration::ZERO,
    };
    EditorApplication::new(settings, Arc::new(FsLoader::new(root)), root)
}

fn saved_textures(root: &Path, coord: TileCoord) -> anyhow::Result<Vec<String>> {
    let written = std::fs::read(root.join(tile_path(MAP, coord)))?;
    Ok(parse_manifest("saved", &written)?.textures)
}

#[test]
fn shutdown_saves_changed_tiles() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut app = application(dir.path())?;
    let loader = app.loader.clone();
    let coord = TileCoord::new(3, 3);
    {
        let index = app.map_manager.change_map(MAP)?;
        index.load_tile(coord)?;
        loader.wait_until_idle()?;
        index.add_texture(coord, "world/rock.blp")?;
    }

    app.shutdown()?;
    assert!(app.map_manager.current_map().is_none());
    assert_eq!(
        saved_textures(dir.path(), coord)?,
        vec!["world/grass.blp", "world/rock.blp"]
    );
    Ok(())
}

#[test]
fn shutdown_keeps_unsaved_tiles_while_saving_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut app = application(dir.path())?;
    let loader = app.loader.clone();
    let coord = TileCoord::new(3, 3);
    {
        let index = app.map_manager.change_map(MAP)?;
        index.load_tile(TileCoord::new(8, 8))?;
        index.load_tile(coord)?;
        loader.wait_until_idle()?;
        index.add_texture(coord, "world/rock.blp")?;
    }
    assert!(loader.has_important_failure());

    assert!(app.shutdown().is_err());
    let index = app.map_manager.current_map().expect("the map stays open");
    assert_eq!(index.changed_tiles(), vec![coord]);
    assert_eq!(saved_textures(dir.path(), coord)?, vec!["world/grass.blp"]);

    loader.acknowledge_important_failures();
    app.shutdown()?;
    assert_eq!(
        saved_textures(dir.path(), coord)?,
        vec!["world/grass.blp", "world/rock.blp"]
    );
    Ok(())
}

#[test]
fn shutdown_without_changes_closes_the_map() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut app = application(dir.path())?;
    app.map_manager.change_map(MAP)?;

    app.shutdown()?;
    assert!(app.map_manager.current_map().is_none());
    assert_eq!(saved_textures(dir.path(), TileCoord::new(3, 3))?, vec!["world/grass.blp"]);
    Ok(())
}
