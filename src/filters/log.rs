//! Request logging filter
//!
//! Logs every connection and data-path request passing through it,
//! together with the result, then forwards the request unchanged.

use crate::backend::{
    BackendResult, Extents, Filter, FilterHandlers, FilterModule, Flags, Next,
};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct LogFilter {
    connections: AtomicU64,
}

/// Per-connection numbering
pub struct LogHandle {
    connection: u64,
    session: u64,
    requests: AtomicU64,
}

impl Filter for LogFilter {
    type Handle = LogHandle;
}

pub fn init() -> Option<FilterModule<LogFilter>> {
    let handlers = FilterHandlers {
        open: Some(LogFilter::open),
        close: Some(LogFilter::close),
        pread: Some(LogFilter::pread),
        pwrite: Some(LogFilter::pwrite),
        flush: Some(LogFilter::flush),
        trim: Some(LogFilter::trim),
        zero: Some(LogFilter::zero),
        extents: Some(LogFilter::extents),
        cache: Some(LogFilter::cache),
        ..FilterHandlers::new()
    };
    Some(
        FilterModule::new("log", LogFilter::default(), handlers)
            .with_longname("request logging filter")
            .with_description("Logs connections and requests through the log facade."),
    )
}

impl LogHandle {
    fn new(connection: u64, session: u64) -> Self {
        Self {
            connection,
            session,
            requests: AtomicU64::new(0),
        }
    }

    /// Number of requests logged so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn request<T>(
        &self,
        description: String,
        call: impl FnOnce() -> BackendResult<T>,
    ) -> BackendResult<T> {
        let id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("connection={} id={} {} ...", self.connection, id, description);

        let result = call();
        match &result {
            Ok(_) => log::info!("connection={} id={} ...return 0", self.connection, id),
            Err(e) => log::info!(
                "connection={} id={} ...return errno={} ({})",
                self.connection,
                id,
                e.errno(),
                e
            ),
        }
        result
    }
}

impl LogFilter {
    fn open(&self, next: &Next<'_>, readonly: bool) -> BackendResult<LogHandle> {
        next.open(readonly)?;
        let connection = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "connection={} session={} open readonly={}",
            connection,
            next.session_id(),
            readonly
        );
        Ok(LogHandle::new(connection, next.session_id()))
    }

    fn close(&self, next: &Next<'_>, handle: LogHandle) {
        log::info!(
            "connection={} session={} close requests={}",
            handle.connection,
            handle.session,
            handle.requests()
        );
        next.close();
    }

    fn pread(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let description = format!("Read count={:#x} offset={:#x}", buf.len(), offset);
        handle.request(description, || next.pread(buf, offset, flags))
    }

    fn pwrite(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let description = format!(
            "Write count={:#x} offset={:#x} fua={}",
            buf.len(),
            offset,
            flags.contains(Flags::FUA)
        );
        handle.request(description, || next.pwrite(buf, offset, flags))
    }

    fn flush(&self, next: &Next<'_>, handle: &LogHandle, flags: Flags) -> BackendResult<()> {
        handle.request("Flush".to_string(), || next.flush(flags))
    }

    fn trim(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let description = format!(
            "Trim count={:#x} offset={:#x} fua={}",
            count,
            offset,
            flags.contains(Flags::FUA)
        );
        handle.request(description, || next.trim(count, offset, flags))
    }

    fn zero(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let description = format!(
            "Zero count={:#x} offset={:#x} trim={} fua={} fast={}",
            count,
            offset,
            flags.contains(Flags::MAY_TRIM),
            flags.contains(Flags::FUA),
            flags.contains(Flags::FAST_ZERO)
        );
        handle.request(description, || next.zero(count, offset, flags))
    }

    fn extents(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        let description = format!(
            "Extents count={:#x} offset={:#x} req_one={}",
            count,
            offset,
            flags.contains(Flags::REQ_ONE)
        );
        handle.request(description, || {
            next.extents(count, offset, flags, extents)?;
            log::debug!("connection={} extents={:?}", handle.connection, extents.as_slice());
            Ok(())
        })
    }

    fn cache(
        &self,
        next: &Next<'_>,
        handle: &LogHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let description = format!("Cache count={:#x} offset={:#x}", count, offset);
        handle.request(description, || next.cache(count, offset, flags))
    }
}
