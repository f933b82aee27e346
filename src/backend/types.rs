//! Request types shared by every backend in a chain
//!
//! Defines the capability set, the thread models a backend can declare,
//! per-request flags and the extent list used by block status queries.

use super::{BackendError, BackendResult};
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

/// Concurrency restriction declared by a backend.
///
/// Variants are ordered from most to least restrictive, so the effective
/// model of a chain is the minimum over its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum ThreadModel {
    /// Only one connection may be served at a time
    SerializeConnections = 0,
    /// Many connections, but one request at a time across all of them
    SerializeAllRequests = 1,
    /// One request at a time per connection
    SerializeRequests = 2,
    /// Requests may be issued concurrently on any connection
    Parallel = 3,
}

impl ThreadModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadModel::SerializeConnections => "serialize_connections",
            ThreadModel::SerializeAllRequests => "serialize_all_requests",
            ThreadModel::SerializeRequests => "serialize_requests",
            ThreadModel::Parallel => "parallel",
        }
    }

    /// Combine with a downstream model; the more serialized one wins.
    pub fn restrict(self, downstream: ThreadModel) -> ThreadModel {
        self.min(downstream)
    }
}

impl TryFrom<i32> for ThreadModel {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ThreadModel::SerializeConnections),
            1 => Ok(ThreadModel::SerializeAllRequests),
            2 => Ok(ThreadModel::SerializeRequests),
            3 => Ok(ThreadModel::Parallel),
            other => Err(other),
        }
    }
}

impl FromStr for ThreadModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "serialize_connections" => Ok(ThreadModel::SerializeConnections),
            "serialize_all_requests" => Ok(ThreadModel::SerializeAllRequests),
            "serialize_requests" => Ok(ThreadModel::SerializeRequests),
            "parallel" => Ok(ThreadModel::Parallel),
            _ => Err(format!("unknown thread model: {}", s)),
        }
    }
}

impl fmt::Display for ThreadModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Flags carried by data-path requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// A zero request may punch holes instead of writing zeroes
        const MAY_TRIM = 1 << 0;
        /// Force unit access: data must be on stable storage on return
        const FUA = 1 << 1;
        /// Extents: the caller only needs the first extent
        const REQ_ONE = 1 << 2;
        /// Zero: fail fast rather than fall back to a slow write
        const FAST_ZERO = 1 << 3;
    }
}

/// Every operation a backend can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Prepare,
    Finalize,
    Close,
    Reopen,
    GetSize,
    PluginName,
    Version,
    Usage,
    DumpFields,
    Config,
    ConfigComplete,
    MagicConfigKey,
    CanWrite,
    CanFlush,
    IsRotational,
    CanTrim,
    CanZero,
    CanFastZero,
    CanExtents,
    CanFua,
    CanMultiConn,
    CanCache,
    Pread,
    Pwrite,
    Flush,
    Trim,
    Zero,
    Extents,
    Cache,
}

impl Operation {
    pub const ALL: [Operation; 30] = [
        Operation::Open,
        Operation::Prepare,
        Operation::Finalize,
        Operation::Close,
        Operation::Reopen,
        Operation::GetSize,
        Operation::PluginName,
        Operation::Version,
        Operation::Usage,
        Operation::DumpFields,
        Operation::Config,
        Operation::ConfigComplete,
        Operation::MagicConfigKey,
        Operation::CanWrite,
        Operation::CanFlush,
        Operation::IsRotational,
        Operation::CanTrim,
        Operation::CanZero,
        Operation::CanFastZero,
        Operation::CanExtents,
        Operation::CanFua,
        Operation::CanMultiConn,
        Operation::CanCache,
        Operation::Pread,
        Operation::Pwrite,
        Operation::Flush,
        Operation::Trim,
        Operation::Zero,
        Operation::Extents,
        Operation::Cache,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Prepare => "prepare",
            Operation::Finalize => "finalize",
            Operation::Close => "close",
            Operation::Reopen => "reopen",
            Operation::GetSize => "get_size",
            Operation::PluginName => "plugin_name",
            Operation::Version => "version",
            Operation::Usage => "usage",
            Operation::DumpFields => "dump_fields",
            Operation::Config => "config",
            Operation::ConfigComplete => "config_complete",
            Operation::MagicConfigKey => "magic_config_key",
            Operation::CanWrite => "can_write",
            Operation::CanFlush => "can_flush",
            Operation::IsRotational => "is_rotational",
            Operation::CanTrim => "can_trim",
            Operation::CanZero => "can_zero",
            Operation::CanFastZero => "can_fast_zero",
            Operation::CanExtents => "can_extents",
            Operation::CanFua => "can_fua",
            Operation::CanMultiConn => "can_multi_conn",
            Operation::CanCache => "can_cache",
            Operation::Pread => "pread",
            Operation::Pwrite => "pwrite",
            Operation::Flush => "flush",
            Operation::Trim => "trim",
            Operation::Zero => "zero",
            Operation::Extents => "extents",
            Operation::Cache => "cache",
        }
    }

    /// Requests that move or describe data on a connection
    pub fn is_data_path(&self) -> bool {
        matches!(
            self,
            Operation::Pread
                | Operation::Pwrite
                | Operation::Flush
                | Operation::Trim
                | Operation::Zero
                | Operation::Extents
                | Operation::Cache
        )
    }

    /// Flags a caller may pass with this operation
    pub fn valid_flags(&self) -> Flags {
        match self {
            Operation::Pwrite | Operation::Trim => Flags::FUA,
            Operation::Zero => Flags::MAY_TRIM | Flags::FUA | Flags::FAST_ZERO,
            Operation::Extents => Flags::REQ_ONE,
            _ => Flags::empty(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extent type bit: the range is not allocated
pub const EXTENT_HOLE: u32 = 1 << 0;
/// Extent type bit: the range reads as zeroes
pub const EXTENT_ZERO: u32 = 1 << 1;

/// One run of blocks sharing the same allocation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub kind: u32,
}

/// Extent list for the window `[start, end)` of a block status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extents {
    start: u64,
    end: u64,
    list: Vec<Extent>,
}

impl Extents {
    pub fn new(start: u64, end: u64) -> BackendResult<Self> {
        if start > end {
            return Err(BackendError::InvalidArgument(format!(
                "extents window start {} is beyond end {}",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            list: Vec::new(),
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Append an extent.
    ///
    /// Extents must be added in order and be contiguous. Anything before
    /// the window start is clipped and anything from the window end onward
    /// is ignored. Adjacent extents of the same kind are merged.
    pub fn add(&mut self, offset: u64, length: u64, kind: u32) -> BackendResult<()> {
        if length == 0 {
            return Ok(());
        }
        let end = offset.checked_add(length).ok_or_else(|| {
            BackendError::InvalidArgument(format!(
                "extent at {} with length {} overflows",
                offset, length
            ))
        })?;

        if end <= self.start {
            return Ok(());
        }

        let expected = match self.list.last() {
            Some(last) => last.offset + last.length,
            None => self.start,
        };
        if expected >= self.end {
            return Ok(());
        }

        let (offset, length) = if offset < self.start {
            (self.start, end - self.start)
        } else {
            (offset, length)
        };
        if offset != expected {
            return Err(BackendError::InvalidArgument(format!(
                "extents must be contiguous: expected offset {}, got {}",
                expected, offset
            )));
        }

        match self.list.last_mut() {
            Some(last) if last.kind == kind => last.length += length,
            _ => self.list.push(Extent {
                offset,
                length,
                kind,
            }),
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[Extent] {
        &self.list
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
