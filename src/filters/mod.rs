//! Filters shipped with the server

pub mod log;
pub mod offset;
pub mod readonly;

pub use self::log::LogFilter;
pub use offset::OffsetFilter;
pub use readonly::ReadonlyFilter;
