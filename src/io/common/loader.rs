use crate::loading::DecodeError;

/// Byte-level access to game data. Paths are relative, canonical (see
/// [`crate::cache::canonicalize_path`]) content paths like `world/maps/azeroth/azeroth_32_48.adt`.
pub trait RawAssetLoader: Send + Sync {
    /// in case of a caching implementation, this may need to clone the whole buffer!
    fn load_raw_owned(&self, path: &str) -> Result<Vec<u8>, DecodeError>;

    fn exists(&self, path: &str) -> bool;
}
