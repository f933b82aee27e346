//! Filters: backends that wrap exactly one downstream backend
//!
//! A filter declares a [`FilterHandlers`] table with one optional slot per
//! operation. A filled slot is called with the filter's state, a [`Next`]
//! adapter for the downstream backend and the filter's own handle. An
//! empty slot forwards the call downstream unchanged and returns the
//! downstream result as is. An empty `open` slot opens downstream and
//! gives the filter the unit handle, which is why a filter without an
//! `open` handler must declare `type Handle = ()`.

use super::dispatch::{downcast, AnyHandle, Dispatch};
use super::register::ModuleInfo;
use super::session::{ErasedHandle, Session};
use super::{
    Backend, BackendKind, BackendResult, ConfigNext, Extents, Flags, Next, Operation,
    ThreadModel,
};
use crate::config::ConfigResult;
use std::sync::Arc;

/// State type of a filter module
pub trait Filter: Send + Sync + 'static {
    /// Per-connection state returned by the `open` handler
    type Handle: Send + Sync + 'static;
}

type Handle<F> = <F as Filter>::Handle;

pub type ThreadModelFn<F> = fn(&F) -> BackendResult<ThreadModel>;
pub type HookFn<F> = fn(&F);
pub type ConfigFn<F> = fn(&F, &ConfigNext<'_>, &str, &str) -> ConfigResult;
pub type ConfigCompleteFn<F> = fn(&F, &ConfigNext<'_>) -> ConfigResult;
pub type OpenFn<F> = fn(&F, &Next<'_>, bool) -> BackendResult<Handle<F>>;
pub type CloseFn<F> = fn(&F, &Next<'_>, Handle<F>);
pub type PrepareFn<F> = fn(&F, &Next<'_>, &Handle<F>, bool) -> BackendResult<()>;
pub type FinalizeFn<F> = fn(&F, &Next<'_>, &Handle<F>) -> BackendResult<()>;
pub type SizeFn<F> = fn(&F, &Next<'_>, &Handle<F>) -> BackendResult<u64>;
pub type PredicateFn<F> = fn(&F, &Next<'_>, &Handle<F>) -> BackendResult<bool>;
pub type PreadFn<F> = fn(&F, &Next<'_>, &Handle<F>, &mut [u8], u64, Flags) -> BackendResult<()>;
pub type PwriteFn<F> = fn(&F, &Next<'_>, &Handle<F>, &[u8], u64, Flags) -> BackendResult<()>;
pub type FlushFn<F> = fn(&F, &Next<'_>, &Handle<F>, Flags) -> BackendResult<()>;
pub type RangeFn<F> = fn(&F, &Next<'_>, &Handle<F>, u32, u64, Flags) -> BackendResult<()>;
pub type ExtentsFn<F> =
    fn(&F, &Next<'_>, &Handle<F>, u32, u64, Flags, &mut Extents) -> BackendResult<()>;

/// Handler table of a filter; `None` means "forward to the next backend"
pub struct FilterHandlers<F: Filter> {
    pub thread_model: Option<ThreadModelFn<F>>,
    pub load: Option<HookFn<F>>,
    pub unload: Option<HookFn<F>>,
    pub config: Option<ConfigFn<F>>,
    pub config_complete: Option<ConfigCompleteFn<F>>,
    pub open: Option<OpenFn<F>>,
    pub prepare: Option<PrepareFn<F>>,
    pub finalize: Option<FinalizeFn<F>>,
    pub close: Option<CloseFn<F>>,
    pub get_size: Option<SizeFn<F>>,
    pub can_write: Option<PredicateFn<F>>,
    pub can_flush: Option<PredicateFn<F>>,
    pub is_rotational: Option<PredicateFn<F>>,
    pub can_trim: Option<PredicateFn<F>>,
    pub can_zero: Option<PredicateFn<F>>,
    pub can_fast_zero: Option<PredicateFn<F>>,
    pub can_extents: Option<PredicateFn<F>>,
    pub can_fua: Option<PredicateFn<F>>,
    pub can_multi_conn: Option<PredicateFn<F>>,
    pub can_cache: Option<PredicateFn<F>>,
    pub pread: Option<PreadFn<F>>,
    pub pwrite: Option<PwriteFn<F>>,
    pub flush: Option<FlushFn<F>>,
    pub trim: Option<RangeFn<F>>,
    pub zero: Option<RangeFn<F>>,
    pub extents: Option<ExtentsFn<F>>,
    pub cache: Option<RangeFn<F>>,
}

impl<F: Filter> FilterHandlers<F> {
    /// Table with every slot unset: a pure pass-through filter
    pub const fn new() -> Self {
        Self {
            thread_model: None,
            load: None,
            unload: None,
            config: None,
            config_complete: None,
            open: None,
            prepare: None,
            finalize: None,
            close: None,
            get_size: None,
            can_write: None,
            can_flush: None,
            is_rotational: None,
            can_trim: None,
            can_zero: None,
            can_fast_zero: None,
            can_extents: None,
            can_fua: None,
            can_multi_conn: None,
            can_cache: None,
            pread: None,
            pwrite: None,
            flush: None,
            trim: None,
            zero: None,
            extents: None,
            cache: None,
        }
    }

    fn predicate(&self, op: Operation) -> Option<PredicateFn<F>> {
        match op {
            Operation::CanWrite => self.can_write,
            Operation::CanFlush => self.can_flush,
            Operation::IsRotational => self.is_rotational,
            Operation::CanTrim => self.can_trim,
            Operation::CanZero => self.can_zero,
            Operation::CanFastZero => self.can_fast_zero,
            Operation::CanExtents => self.can_extents,
            Operation::CanFua => self.can_fua,
            Operation::CanMultiConn => self.can_multi_conn,
            Operation::CanCache => self.can_cache,
            _ => None,
        }
    }
}

impl<F: Filter> Default for FilterHandlers<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a filter's registration function returns
pub struct FilterModule<F: Filter> {
    pub info: ModuleInfo,
    pub handlers: FilterHandlers<F>,
    pub filter: F,
}

impl<F: Filter> FilterModule<F> {
    /// Declare a filter built against this server
    pub fn new(name: &str, filter: F, handlers: FilterHandlers<F>) -> Self {
        Self {
            info: ModuleInfo::filter(name),
            handlers,
            filter,
        }
    }

    pub fn with_longname(mut self, longname: &str) -> Self {
        self.info.longname = Some(longname.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.info.description = Some(description.to_string());
        self
    }

    pub fn with_config_help(mut self, config_help: &str) -> Self {
        self.info.config_help = Some(config_help.to_string());
        self
    }
}

/// A registered filter together with the backend it wraps
pub(crate) struct FilterBackend<F: Filter> {
    module: FilterModule<F>,
    next: Arc<Backend>,
}

impl<F: Filter> FilterBackend<F> {
    pub(crate) fn new(module: FilterModule<F>, next: Arc<Backend>) -> Self {
        Self { module, next }
    }

    fn next_ops<'a>(&'a self, session: &'a Session) -> Next<'a> {
        Next::new(&self.next, session)
    }

    fn handle<'h>(&self, handle: &'h AnyHandle) -> BackendResult<&'h F::Handle> {
        downcast::<F::Handle>(handle, &self.module.info.name)
    }
}

impl<F: Filter> Dispatch for FilterBackend<F> {
    fn kind(&self) -> BackendKind {
        BackendKind::Filter
    }

    fn info(&self) -> &ModuleInfo {
        &self.module.info
    }

    fn next(&self) -> Option<&Backend> {
        Some(&self.next)
    }

    fn thread_model(&self) -> BackendResult<ThreadModel> {
        match self.module.handlers.thread_model {
            Some(thread_model) => thread_model(&self.module.filter),
            None => Ok(ThreadModel::Parallel),
        }
    }

    fn version(&self) -> Option<&str> {
        self.module.info.version.as_deref()
    }

    fn plugin_name(&self) -> &str {
        self.next.plugin_name()
    }

    fn magic_config_key(&self) -> Option<&str> {
        self.next.magic_config_key()
    }

    fn dump_fields(&self) -> Vec<(String, String)> {
        self.next.dump_fields()
    }

    fn load(&self) {
        if let Some(load) = self.module.handlers.load {
            load(&self.module.filter);
        }
    }

    fn unload(&self) {
        if let Some(unload) = self.module.handlers.unload {
            unload(&self.module.filter);
        }
    }

    fn config(&self, key: &str, value: &str) -> ConfigResult {
        match self.module.handlers.config {
            Some(config) => config(&self.module.filter, &ConfigNext::new(&self.next), key, value),
            None => self.next.config(key, value),
        }
    }

    fn config_complete(&self) -> ConfigResult {
        match self.module.handlers.config_complete {
            Some(config_complete) => {
                config_complete(&self.module.filter, &ConfigNext::new(&self.next))
            }
            None => self.next.config_complete(),
        }
    }

    fn open(&self, session: &Session, readonly: bool) -> BackendResult<ErasedHandle> {
        let next = self.next_ops(session);
        // Most filters open downstream first, giving inner-to-outer order.
        let handle: ErasedHandle = match self.module.handlers.open {
            Some(open) => Box::new(open(&self.module.filter, &next, readonly)?),
            None => {
                next.open(readonly)?;
                Box::new(())
            }
        };
        Ok(handle)
    }

    fn prepare(&self, session: &Session, handle: &AnyHandle, readonly: bool) -> BackendResult<()> {
        let next = self.next_ops(session);
        match self.module.handlers.prepare {
            Some(prepare) => prepare(&self.module.filter, &next, self.handle(handle)?, readonly),
            None => next.prepare(readonly),
        }
    }

    fn finalize(&self, session: &Session, handle: &AnyHandle) -> BackendResult<()> {
        let next = self.next_ops(session);
        match self.module.handlers.finalize {
            Some(finalize) => finalize(&self.module.filter, &next, self.handle(handle)?),
            None => next.finalize(),
        }
    }

    fn close(&self, session: &Session, handle: ErasedHandle) {
        let next = self.next_ops(session);
        let Some(close) = self.module.handlers.close else {
            drop(handle);
            next.close();
            return;
        };
        match handle.downcast::<F::Handle>() {
            Ok(handle) => close(&self.module.filter, &next, *handle),
            Err(_) => {
                log::warn!(
                    "{}: close: handle has an unexpected type",
                    self.module.info.name
                );
                next.close();
            }
        }
    }

    fn get_size(&self, session: &Session, handle: &AnyHandle) -> BackendResult<u64> {
        match self.module.handlers.get_size {
            Some(get_size) => {
                get_size(&self.module.filter, &self.next_ops(session), self.handle(handle)?)
            }
            None => self.next.get_size(session),
        }
    }

    fn capability(
        &self,
        session: &Session,
        op: Operation,
        handle: &AnyHandle,
    ) -> BackendResult<bool> {
        match self.module.handlers.predicate(op) {
            Some(predicate) => {
                predicate(&self.module.filter, &self.next_ops(session), self.handle(handle)?)
            }
            None => self.next.capability(session, op),
        }
    }

    fn pread(
        &self,
        session: &Session,
        handle: &AnyHandle,
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        match self.module.handlers.pread {
            Some(pread) => pread(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                buf,
                offset,
                flags,
            ),
            None => self.next.pread(session, buf, offset, flags),
        }
    }

    fn pwrite(
        &self,
        session: &Session,
        handle: &AnyHandle,
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        match self.module.handlers.pwrite {
            Some(pwrite) => pwrite(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                buf,
                offset,
                flags,
            ),
            None => self.next.pwrite(session, buf, offset, flags),
        }
    }

    fn flush(&self, session: &Session, handle: &AnyHandle, flags: Flags) -> BackendResult<()> {
        match self.module.handlers.flush {
            Some(flush) => flush(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                flags,
            ),
            None => self.next.flush(session, flags),
        }
    }

    fn trim(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        match self.module.handlers.trim {
            Some(trim) => trim(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                count,
                offset,
                flags,
            ),
            None => self.next.trim(session, count, offset, flags),
        }
    }

    fn zero(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        match self.module.handlers.zero {
            Some(zero) => zero(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                count,
                offset,
                flags,
            ),
            None => self.next.zero(session, count, offset, flags),
        }
    }

    fn extents(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        match self.module.handlers.extents {
            Some(handler) => handler(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                count,
                offset,
                flags,
                extents,
            ),
            None => self.next.extents(session, count, offset, flags, extents),
        }
    }

    fn cache(
        &self,
        session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        match self.module.handlers.cache {
            Some(cache) => cache(
                &self.module.filter,
                &self.next_ops(session),
                self.handle(handle)?,
                count,
                offset,
                flags,
            ),
            None => self.next.cache(session, count, offset, flags),
        }
    }
}
