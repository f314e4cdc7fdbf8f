//! Access to the raw game data and the stand-in decoders for it.

pub mod common;
pub mod fs;
pub mod memory;
