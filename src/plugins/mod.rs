//! Plugins shipped with the server

pub mod file;
pub mod memory;

pub use file::FilePlugin;
pub use memory::MemoryPlugin;
