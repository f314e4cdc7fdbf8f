use std::collections::HashMap;
use std::sync::RwLock;

use crate::cache::canonicalize_path;
use crate::io::common::loader::RawAssetLoader;
use crate::loading::DecodeError;

/// Keeps game data in memory, for tooling that generates assets on the fly and for tests.
#[derive(Default)]
pub struct MemoryLoader {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .expect("Memory Loader Write Lock")
            .insert(canonicalize_path(path), data.into());
    }

    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .write()
            .expect("Memory Loader Write Lock")
            .remove(&canonicalize_path(path))
    }
}

impl RawAssetLoader for MemoryLoader {
    fn load_raw_owned(&self, path: &str) -> Result<Vec<u8>, DecodeError> {
        self.files
            .read()
            .expect("Memory Loader Read Lock")
            .get(&canonicalize_path(path))
            .cloned()
            .ok_or_else(|| DecodeError::NotFound {
                path: path.to_string(),
            })
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .read()
            .expect("Memory Loader Read Lock")
            .contains_key(&canonicalize_path(path))
    }
}
