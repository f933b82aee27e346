//! Block device server built from a chain of backends
//!
//! A plugin provides the data; filters stacked on top of it may change
//! or observe every request on its way down. The assembled [`Chain`] is
//! served to clients over NBD, one [`Connection`] per client.

pub mod backend;
pub mod chain;
pub mod config;
pub mod connection;
pub mod filters;
pub mod nbd;
pub mod plugins;

pub use backend::{Backend, BackendError, BackendResult, ChainError, Flags, ThreadModel};
pub use chain::{Chain, ModuleRegistry};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ExportInfo};
