//! Asynchronous asset loading and reference counted tile streaming for a world editor.

pub mod cache;
pub mod editor;
pub mod io;
pub mod loading;
pub mod save;
pub mod settings;
pub mod world;
