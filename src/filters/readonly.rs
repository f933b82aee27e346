//! Read-only filter
//!
//! Hides write support of everything beneath it.

use crate::backend::{
    BackendError, BackendResult, Filter, FilterHandlers, FilterModule, Flags, Next,
};

pub struct ReadonlyFilter;

impl Filter for ReadonlyFilter {
    type Handle = ();
}

pub fn init() -> Option<FilterModule<ReadonlyFilter>> {
    let handlers = FilterHandlers {
        can_write: Some(ReadonlyFilter::can_write),
        pwrite: Some(ReadonlyFilter::pwrite),
        trim: Some(ReadonlyFilter::refuse),
        zero: Some(ReadonlyFilter::refuse),
        ..FilterHandlers::new()
    };
    Some(
        FilterModule::new("readonly", ReadonlyFilter, handlers)
            .with_longname("read-only filter")
            .with_description("Rejects writes, trims and zeroes."),
    )
}

impl ReadonlyFilter {
    fn can_write(&self, _next: &Next<'_>, _handle: &()) -> BackendResult<bool> {
        Ok(false)
    }

    fn pwrite(
        &self,
        _next: &Next<'_>,
        _handle: &(),
        _buf: &[u8],
        _offset: u64,
        _flags: Flags,
    ) -> BackendResult<()> {
        Err(BackendError::ReadOnly)
    }

    fn refuse(
        &self,
        _next: &Next<'_>,
        _handle: &(),
        _count: u32,
        _offset: u64,
        _flags: Flags,
    ) -> BackendResult<()> {
        Err(BackendError::ReadOnly)
    }
}
