//! Type-erased handler dispatch
//!
//! [`Backend`] holds its module behind this trait. Implementations
//! (`PluginBackend<P>` and `FilterBackend<F>`) carry the concrete module
//! state and handler table, downcast the session handle back to the
//! module's own handle type, and either run the module's handler or apply
//! the default for an unset slot.

use super::register::ModuleInfo;
use super::session::{ErasedHandle, Session};
use super::{Backend, BackendKind, BackendResult, Extents, Flags, Operation, ThreadModel};
use crate::config::ConfigResult;
use std::any::Any;

/// Borrowed form of a session handle
pub(crate) type AnyHandle = dyn Any + Send + Sync;

pub(crate) trait Dispatch: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn info(&self) -> &ModuleInfo;

    fn next(&self) -> Option<&Backend>;

    /// Thread model declared by this module alone
    fn thread_model(&self) -> BackendResult<ThreadModel>;

    fn version(&self) -> Option<&str>;

    fn plugin_name(&self) -> &str;

    fn magic_config_key(&self) -> Option<&str>;

    fn dump_fields(&self) -> Vec<(String, String)>;

    fn load(&self);

    fn unload(&self);

    fn config(&self, key: &str, value: &str) -> ConfigResult;

    fn config_complete(&self) -> ConfigResult;

    fn open(&self, session: &Session, readonly: bool) -> BackendResult<ErasedHandle>;

    fn prepare(&self, session: &Session, handle: &AnyHandle, readonly: bool) -> BackendResult<()>;

    fn finalize(&self, session: &Session, handle: &AnyHandle) -> BackendResult<()>;

    fn close(&self, session: &Session, handle: ErasedHandle);

    fn get_size(&self, session: &Session, handle: &AnyHandle) -> BackendResult<u64>;

    /// Answer one of the `can_*`/`is_*` predicates
    fn capability(&self, session: &Session, op: Operation, handle: &AnyHandle)
        -> BackendResult<bool>;

    fn pread(
        &self,
        session: &Session,
        handle: &AnyHandle,
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()>;

    fn pwrite(
        &self,
        session: &Session,
        handle: &AnyHandle,
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()>;

    fn flush(&self, session: &Session, handle: &AnyHandle, flags: Flags) -> BackendResult<()>;

    fn trim(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()>;

    fn zero(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn extents(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()>;

    fn cache(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()>;
}

/// Recover a module's own handle type from the session arena
pub(crate) fn downcast<'h, H: Any>(handle: &'h AnyHandle, backend: &str) -> BackendResult<&'h H> {
    handle
        .downcast_ref::<H>()
        .ok_or_else(|| super::BackendError::HandleType {
            backend: backend.to_string(),
        })
}
