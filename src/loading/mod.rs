//! Background loading: the [`Loadable`] capability and the [`AsyncLoader`] worker pool that is the
//! only thing allowed to run a loadable's load routine.
//!
//! The loader is an explicitly constructed handle. Whoever owns the application context creates
//! it (see [`crate::editor::application::EditorApplication`]) and hands `Arc`s of it to the caches
//! and the tile index.

pub mod async_loader;
pub mod error;
pub mod loadable;

pub use async_loader::AsyncLoader;
pub use error::{DecodeError, LoadError};
pub use loadable::{LoadState, LoadStatus, Loadable, Priority};
