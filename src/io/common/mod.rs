pub mod loader;
pub mod manifest;
