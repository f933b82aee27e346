//! Forwarding to the next backend in the chain
//!
//! A [`Next`] is built fresh for every filter handler invocation and
//! borrows both the downstream backend and the current session, so a
//! filter cannot keep it beyond the call that received it.

use super::{Backend, BackendResult, Extents, Flags, Session};
use crate::config::ConfigResult;

/// Downstream backend bound to the active session
pub struct Next<'a> {
    backend: &'a Backend,
    session: &'a Session,
}

impl<'a> Next<'a> {
    pub(crate) fn new(backend: &'a Backend, session: &'a Session) -> Self {
        Self { backend, session }
    }

    /// Name of the downstream backend
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn open(&self, readonly: bool) -> BackendResult<()> {
        self.backend.open(self.session, readonly)
    }

    pub fn prepare(&self, readonly: bool) -> BackendResult<()> {
        self.backend.prepare(self.session, readonly)
    }

    pub fn finalize(&self) -> BackendResult<()> {
        self.backend.finalize(self.session)
    }

    pub fn close(&self) {
        self.backend.close(self.session)
    }

    pub fn reopen(&self, readonly: bool) -> BackendResult<()> {
        self.backend.reopen(self.session, readonly)
    }

    pub fn get_size(&self) -> BackendResult<u64> {
        self.backend.get_size(self.session)
    }

    pub fn can_write(&self) -> BackendResult<bool> {
        self.backend.can_write(self.session)
    }

    pub fn can_flush(&self) -> BackendResult<bool> {
        self.backend.can_flush(self.session)
    }

    pub fn is_rotational(&self) -> BackendResult<bool> {
        self.backend.is_rotational(self.session)
    }

    pub fn can_trim(&self) -> BackendResult<bool> {
        self.backend.can_trim(self.session)
    }

    pub fn can_zero(&self) -> BackendResult<bool> {
        self.backend.can_zero(self.session)
    }

    pub fn can_fast_zero(&self) -> BackendResult<bool> {
        self.backend.can_fast_zero(self.session)
    }

    pub fn can_extents(&self) -> BackendResult<bool> {
        self.backend.can_extents(self.session)
    }

    pub fn can_fua(&self) -> BackendResult<bool> {
        self.backend.can_fua(self.session)
    }

    pub fn can_multi_conn(&self) -> BackendResult<bool> {
        self.backend.can_multi_conn(self.session)
    }

    pub fn can_cache(&self) -> BackendResult<bool> {
        self.backend.can_cache(self.session)
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.backend.pread(self.session, buf, offset, flags)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.backend.pwrite(self.session, buf, offset, flags)
    }

    pub fn flush(&self, flags: Flags) -> BackendResult<()> {
        self.backend.flush(self.session, flags)
    }

    pub fn trim(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.backend.trim(self.session, count, offset, flags)
    }

    pub fn zero(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.backend.zero(self.session, count, offset, flags)
    }

    pub fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        self.backend.extents(self.session, count, offset, flags, extents)
    }

    pub fn cache(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.backend.cache(self.session, count, offset, flags)
    }
}

/// Downstream backend during configuration, before any session exists
pub struct ConfigNext<'a> {
    backend: &'a Backend,
}

impl<'a> ConfigNext<'a> {
    pub(crate) fn new(backend: &'a Backend) -> Self {
        Self { backend }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Pass a parameter this filter does not handle to the next backend
    pub fn config(&self, key: &str, value: &str) -> ConfigResult {
        self.backend.config(key, value)
    }

    pub fn config_complete(&self) -> ConfigResult {
        self.backend.config_complete()
    }
}
