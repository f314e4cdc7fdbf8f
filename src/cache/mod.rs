//! The reference counted resource cache. It deduplicates instances by key and counts their holders
//! explicitly, because an instance may only be destroyed once the loader has let go of it.

pub mod key;
pub mod resource_cache;

pub use key::{ContextId, Identity, ResourceKey, canonicalize_path};
pub use resource_cache::{CacheError, ResourceCache, ResourceGenerator};
