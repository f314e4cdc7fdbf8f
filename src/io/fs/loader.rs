use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::trace;

use crate::cache::canonicalize_path;
use crate::io::common::loader::RawAssetLoader;
use crate::loading::DecodeError;

/// Reads extracted game data from a directory. The data is expected to be stored with lowercase
/// names, as the content paths are canonicalized before they reach this loader.
pub struct FsLoader {
    data_folder: PathBuf,
}

impl FsLoader {
    pub fn new(data_folder: impl AsRef<Path>) -> Self {
        Self {
            data_folder: data_folder.as_ref().to_path_buf(),
        }
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    fn resolve(&self, path: &str) -> PathBuf {
        canonicalize_path(path)
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != "..")
            .fold(self.data_folder.clone(), |full, segment| full.join(segment))
    }
}

impl RawAssetLoader for FsLoader {
    fn load_raw_owned(&self, path: &str) -> Result<Vec<u8>, DecodeError> {
        let full_path = self.resolve(path);
        match std::fs::read(&full_path) {
            Ok(buf) => {
                trace!("Loaded {} ({} bytes)", path, buf.len());
                Ok(buf)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(DecodeError::NotFound {
                path: path.to_string(),
            }),
            Err(source) => Err(DecodeError::ReadError {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }
}
