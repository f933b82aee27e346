//! Plugins: the backend at the bottom of every chain
//!
//! A plugin owns the data. Its [`PluginHandlers`] table must provide
//! `open`, `get_size` and `pread`; every other slot is optional. Unset
//! capability slots are answered from which data handlers exist, `zero`
//! falls back to writing zeroes with `pwrite`, and FUA is emulated with
//! a flush when the plugin has no `can_fua` answer of its own.

use super::dispatch::{downcast, AnyHandle, Dispatch};
use super::register::ModuleInfo;
use super::session::{ErasedHandle, Session};
use super::{
    Backend, BackendError, BackendKind, BackendResult, Extents, Flags, Operation, ThreadModel,
};
use crate::config::{ConfigError, ConfigResult};

/// Largest buffer used when emulating `zero` with `pwrite`
const ZERO_BUFFER_SIZE: usize = 64 * 1024;

/// State type of a plugin module
pub trait Plugin: Send + Sync + 'static {
    /// Per-connection state returned by the `open` handler
    type Handle: Send + Sync + 'static;
}

type Handle<P> = <P as Plugin>::Handle;

pub type ThreadModelFn<P> = fn(&P) -> BackendResult<ThreadModel>;
pub type HookFn<P> = fn(&P);
pub type DumpFn<P> = fn(&P) -> Vec<(String, String)>;
pub type ConfigFn<P> = fn(&P, &str, &str) -> ConfigResult;
pub type ConfigCompleteFn<P> = fn(&P) -> ConfigResult;
pub type OpenFn<P> = fn(&P, bool) -> BackendResult<Handle<P>>;
pub type CloseFn<P> = fn(&P, Handle<P>);
pub type PrepareFn<P> = fn(&P, &Handle<P>, bool) -> BackendResult<()>;
pub type FinalizeFn<P> = fn(&P, &Handle<P>) -> BackendResult<()>;
pub type SizeFn<P> = fn(&P, &Handle<P>) -> BackendResult<u64>;
pub type PredicateFn<P> = fn(&P, &Handle<P>) -> BackendResult<bool>;
pub type PreadFn<P> = fn(&P, &Handle<P>, &mut [u8], u64, Flags) -> BackendResult<()>;
pub type PwriteFn<P> = fn(&P, &Handle<P>, &[u8], u64, Flags) -> BackendResult<()>;
pub type FlushFn<P> = fn(&P, &Handle<P>, Flags) -> BackendResult<()>;
pub type RangeFn<P> = fn(&P, &Handle<P>, u32, u64, Flags) -> BackendResult<()>;
pub type ExtentsFn<P> = fn(&P, &Handle<P>, u32, u64, Flags, &mut Extents) -> BackendResult<()>;

/// Handler table of a plugin
pub struct PluginHandlers<P: Plugin> {
    pub thread_model: Option<ThreadModelFn<P>>,
    pub load: Option<HookFn<P>>,
    pub unload: Option<HookFn<P>>,
    pub dump_plugin: Option<DumpFn<P>>,
    pub config: Option<ConfigFn<P>>,
    pub config_complete: Option<ConfigCompleteFn<P>>,
    pub open: Option<OpenFn<P>>,
    pub prepare: Option<PrepareFn<P>>,
    pub finalize: Option<FinalizeFn<P>>,
    pub close: Option<CloseFn<P>>,
    pub get_size: Option<SizeFn<P>>,
    pub can_write: Option<PredicateFn<P>>,
    pub can_flush: Option<PredicateFn<P>>,
    pub is_rotational: Option<PredicateFn<P>>,
    pub can_trim: Option<PredicateFn<P>>,
    pub can_zero: Option<PredicateFn<P>>,
    pub can_fast_zero: Option<PredicateFn<P>>,
    pub can_extents: Option<PredicateFn<P>>,
    pub can_fua: Option<PredicateFn<P>>,
    pub can_multi_conn: Option<PredicateFn<P>>,
    pub can_cache: Option<PredicateFn<P>>,
    pub pread: Option<PreadFn<P>>,
    pub pwrite: Option<PwriteFn<P>>,
    pub flush: Option<FlushFn<P>>,
    pub trim: Option<RangeFn<P>>,
    pub zero: Option<RangeFn<P>>,
    pub extents: Option<ExtentsFn<P>>,
    pub cache: Option<RangeFn<P>>,
}

impl<P: Plugin> PluginHandlers<P> {
    pub const fn new() -> Self {
        Self {
            thread_model: None,
            load: None,
            unload: None,
            dump_plugin: None,
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

    fn predicate(&self, op: Operation) -> Option<PredicateFn<P>> {
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

    /// Whether the slot for `op` is filled
    pub fn has(&self, op: Operation) -> bool {
        match op {
            Operation::Open => self.open.is_some(),
            Operation::Prepare => self.prepare.is_some(),
            Operation::Finalize => self.finalize.is_some(),
            Operation::Close => self.close.is_some(),
            Operation::GetSize => self.get_size.is_some(),
            Operation::DumpFields => self.dump_plugin.is_some(),
            Operation::Config => self.config.is_some(),
            Operation::ConfigComplete => self.config_complete.is_some(),
            Operation::Pread => self.pread.is_some(),
            Operation::Pwrite => self.pwrite.is_some(),
            Operation::Flush => self.flush.is_some(),
            Operation::Trim => self.trim.is_some(),
            Operation::Zero => self.zero.is_some(),
            Operation::Extents => self.extents.is_some(),
            Operation::Cache => self.cache.is_some(),
            op => self.predicate(op).is_some(),
        }
    }
}

impl<P: Plugin> Default for PluginHandlers<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a plugin's registration function returns
pub struct PluginModule<P: Plugin> {
    pub info: ModuleInfo,
    /// The plugin's own release, shown by `version`
    pub version: Option<String>,
    pub magic_config_key: Option<String>,
    pub handlers: PluginHandlers<P>,
    pub plugin: P,
}

impl<P: Plugin> PluginModule<P> {
    /// Declare a plugin built against this server
    pub fn new(name: &str, plugin: P, handlers: PluginHandlers<P>) -> Self {
        Self {
            info: ModuleInfo::plugin(name),
            version: None,
            magic_config_key: None,
            handlers,
            plugin,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_magic_config_key(mut self, key: &str) -> Self {
        self.magic_config_key = Some(key.to_string());
        self
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

pub(crate) struct PluginBackend<P: Plugin> {
    module: PluginModule<P>,
}

impl<P: Plugin> PluginBackend<P> {
    pub(crate) fn new(module: PluginModule<P>) -> Self {
        Self { module }
    }

    fn name(&self) -> &str {
        &self.module.info.name
    }

    fn handle<'h>(&self, handle: &'h AnyHandle) -> BackendResult<&'h P::Handle> {
        downcast::<P::Handle>(handle, self.name())
    }

    fn default_capability(&self, op: Operation) -> bool {
        let handlers = &self.module.handlers;
        match op {
            Operation::CanWrite => handlers.pwrite.is_some(),
            Operation::CanFlush => handlers.flush.is_some(),
            Operation::CanTrim => handlers.trim.is_some(),
            // Emulated with pwrite when there is no zero handler
            Operation::CanZero => true,
            // Emulation never takes the fast path, so it can fail fast
            Operation::CanFastZero => handlers.zero.is_none(),
            Operation::CanExtents => handlers.extents.is_some(),
            Operation::CanFua => handlers.flush.is_some(),
            Operation::CanCache => handlers.cache.is_some(),
            _ => false,
        }
    }

    /// Run a write-side request, emulating FUA with a flush if needed.
    fn with_fua(
        &self,
        handle: &P::Handle,
        flags: Flags,
        request: impl FnOnce(Flags) -> BackendResult<()>,
    ) -> BackendResult<()> {
        if !flags.contains(Flags::FUA) || self.module.handlers.can_fua.is_some() {
            return request(flags);
        }
        request(flags - Flags::FUA)?;
        self.flush_handle(handle)
    }

    fn flush_handle(&self, handle: &P::Handle) -> BackendResult<()> {
        let flush = self
            .module
            .handlers
            .flush
            .ok_or(BackendError::NotSupported(Operation::Flush))?;
        flush(&self.module.plugin, handle, Flags::empty())
    }

    fn emulate_zero(
        &self,
        handle: &P::Handle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        if flags.contains(Flags::FAST_ZERO) {
            return Err(BackendError::NotSupported(Operation::Zero));
        }
        let pwrite = self
            .module
            .handlers
            .pwrite
            .ok_or(BackendError::NotSupported(Operation::Pwrite))?;

        let zeroes = vec![0u8; (count as usize).min(ZERO_BUFFER_SIZE)];
        let mut remaining = count as usize;
        let mut offset = offset;
        while remaining > 0 {
            let len = remaining.min(zeroes.len());
            pwrite(&self.module.plugin, handle, &zeroes[..len], offset, flags & Flags::FUA)?;
            offset += len as u64;
            remaining -= len;
        }
        Ok(())
    }
}

impl<P: Plugin> Dispatch for PluginBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::Plugin
    }

    fn info(&self) -> &ModuleInfo {
        &self.module.info
    }

    fn next(&self) -> Option<&Backend> {
        None
    }

    fn thread_model(&self) -> BackendResult<ThreadModel> {
        match self.module.handlers.thread_model {
            Some(thread_model) => thread_model(&self.module.plugin),
            None => Ok(ThreadModel::Parallel),
        }
    }

    fn version(&self) -> Option<&str> {
        self.module
            .version
            .as_deref()
            .or(self.module.info.version.as_deref())
    }

    fn plugin_name(&self) -> &str {
        self.name()
    }

    fn magic_config_key(&self) -> Option<&str> {
        self.module.magic_config_key.as_deref()
    }

    fn dump_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        if let Some(version) = &self.module.version {
            fields.push(("version".to_string(), version.clone()));
        }
        fields.push((
            "api_version".to_string(),
            self.module.info.api_version.to_string(),
        ));
        let thread_model = match self.thread_model() {
            Ok(model) => model.to_string(),
            Err(e) => format!("error: {}", e),
        };
        fields.push(("thread_model".to_string(), thread_model));
        for op in Operation::ALL {
            if self.module.handlers.has(op) {
                fields.push((format!("has_{}", op), "1".to_string()));
            }
        }
        if let Some(dump_plugin) = self.module.handlers.dump_plugin {
            fields.extend(dump_plugin(&self.module.plugin));
        }
        fields
    }

    fn load(&self) {
        if let Some(load) = self.module.handlers.load {
            load(&self.module.plugin);
        }
    }

    fn unload(&self) {
        if let Some(unload) = self.module.handlers.unload {
            unload(&self.module.plugin);
        }
    }

    fn config(&self, key: &str, value: &str) -> ConfigResult {
        match self.module.handlers.config {
            Some(config) => config(&self.module.plugin, key, value),
            None => Err(ConfigError::NoParameters {
                key: key.to_string(),
            }),
        }
    }

    fn config_complete(&self) -> ConfigResult {
        match self.module.handlers.config_complete {
            Some(config_complete) => config_complete(&self.module.plugin),
            None => Ok(()),
        }
    }

    fn open(&self, _session: &Session, readonly: bool) -> BackendResult<ErasedHandle> {
        let open = self
            .module
            .handlers
            .open
            .ok_or(BackendError::NotSupported(Operation::Open))?;
        let handle: ErasedHandle = Box::new(open(&self.module.plugin, readonly)?);
        Ok(handle)
    }

    fn prepare(&self, _session: &Session, handle: &AnyHandle, readonly: bool) -> BackendResult<()> {
        match self.module.handlers.prepare {
            Some(prepare) => prepare(&self.module.plugin, self.handle(handle)?, readonly),
            None => Ok(()),
        }
    }

    fn finalize(&self, _session: &Session, handle: &AnyHandle) -> BackendResult<()> {
        match self.module.handlers.finalize {
            Some(finalize) => finalize(&self.module.plugin, self.handle(handle)?),
            None => Ok(()),
        }
    }

    fn close(&self, _session: &Session, handle: ErasedHandle) {
        let Some(close) = self.module.handlers.close else {
            return;
        };
        match handle.downcast::<P::Handle>() {
            Ok(handle) => close(&self.module.plugin, *handle),
            Err(_) => log::warn!("{}: close: handle has an unexpected type", self.name()),
        }
    }

    fn get_size(&self, _session: &Session, handle: &AnyHandle) -> BackendResult<u64> {
        let get_size = self
            .module
            .handlers
            .get_size
            .ok_or(BackendError::NotSupported(Operation::GetSize))?;
        get_size(&self.module.plugin, self.handle(handle)?)
    }

    fn capability(
        &self,
        _session: &Session,
        op: Operation,
        handle: &AnyHandle,
    ) -> BackendResult<bool> {
        match self.module.handlers.predicate(op) {
            Some(predicate) => predicate(&self.module.plugin, self.handle(handle)?),
            None => Ok(self.default_capability(op)),
        }
    }

    fn pread(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let pread = self
            .module
            .handlers
            .pread
            .ok_or(BackendError::NotSupported(Operation::Pread))?;
        pread(&self.module.plugin, self.handle(handle)?, buf, offset, flags)
    }

    fn pwrite(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let pwrite = self
            .module
            .handlers
            .pwrite
            .ok_or(BackendError::NotSupported(Operation::Pwrite))?;
        let handle = self.handle(handle)?;
        self.with_fua(handle, flags, |flags| {
            pwrite(&self.module.plugin, handle, buf, offset, flags)
        })
    }

    fn flush(&self, _session: &Session, handle: &AnyHandle, flags: Flags) -> BackendResult<()> {
        let flush = self
            .module
            .handlers
            .flush
            .ok_or(BackendError::NotSupported(Operation::Flush))?;
        flush(&self.module.plugin, self.handle(handle)?, flags)
    }

    fn trim(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let trim = self
            .module
            .handlers
            .trim
            .ok_or(BackendError::NotSupported(Operation::Trim))?;
        let handle = self.handle(handle)?;
        self.with_fua(handle, flags, |flags| {
            trim(&self.module.plugin, handle, count, offset, flags)
        })
    }

    fn zero(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let handle = self.handle(handle)?;
        self.with_fua(handle, flags, |flags| match self.module.handlers.zero {
            Some(zero) => match zero(&self.module.plugin, handle, count, offset, flags) {
                Err(e) if e.errno() == libc::EOPNOTSUPP && !flags.contains(Flags::FAST_ZERO) => {
                    log::debug!("{}: zero not supported here, writing zeroes", self.name());
                    self.emulate_zero(handle, count, offset, flags)
                }
                result => result,
            },
            None => self.emulate_zero(handle, count, offset, flags),
        })
    }

    fn extents(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        let handler = self
            .module
            .handlers
            .extents
            .ok_or(BackendError::NotSupported(Operation::Extents))?;
        handler(&self.module.plugin, self.handle(handle)?, count, offset, flags, extents)
    }

    fn cache(
        &self,
        _session: &Session,
        handle: &AnyHandle,
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        let cache = self
            .module
            .handlers
            .cache
            .ok_or(BackendError::NotSupported(Operation::Cache))?;
        cache(&self.module.plugin, self.handle(handle)?, count, offset, flags)
    }
}
