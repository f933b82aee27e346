//! Backend chain nodes
//!
//! A chain is a plugin (index 0) wrapped by zero or more filters. Every
//! link is a [`Backend`]: it owns its module's handler table behind a
//! type-erased dispatcher and applies the checks common to every call
//! (lifecycle state, request bounds, flags, capabilities) before handing
//! the request to the module. Filters reach the backend beneath them
//! through a [`Next`] adapter.

mod dispatch;
pub mod filter;
pub mod next;
pub mod plugin;
pub mod register;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use filter::{Filter, FilterHandlers, FilterModule};
pub use next::{ConfigNext, Next};
pub use plugin::{Plugin, PluginHandlers, PluginModule};
pub use register::{
    register_filter, register_plugin, ModuleInfo, FILTER_API_VERSION, PLUGIN_API_VERSION,
    SERVER_VERSION,
};
pub use session::{ErasedHandle, HandleState, Session};
pub use types::{Extent, Extents, Flags, Operation, ThreadModel, EXTENT_HOLE, EXTENT_ZERO};

use crate::config::{ConfigError, ConfigResult};
use dispatch::{AnyHandle, Dispatch};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors returned by a single request on a connection
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Errno { errno: i32, message: String },

    #[error("{0} is not supported")]
    NotSupported(Operation),

    #[error("device is read-only")]
    ReadOnly,

    #[error("{op} out of range: offset {offset} + count {count} exceeds size {size}")]
    OutOfRange {
        op: Operation,
        offset: u64,
        count: u64,
        size: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{backend}: {op} issued while handle is {state}")]
    InvalidState {
        backend: String,
        op: Operation,
        state: &'static str,
    },

    #[error("{backend}: handle has an unexpected type")]
    HandleType { backend: String },
}

impl BackendError {
    /// Error carrying an explicit errno value
    pub fn from_errno(errno: i32, message: impl Into<String>) -> Self {
        BackendError::Errno {
            errno,
            message: message.into(),
        }
    }

    /// errno reported to the protocol front end
    pub fn errno(&self) -> i32 {
        match self {
            BackendError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            BackendError::Errno { errno, .. } => *errno,
            BackendError::NotSupported(_) => libc::EOPNOTSUPP,
            BackendError::ReadOnly => libc::EROFS,
            BackendError::OutOfRange { op, .. } => match op {
                Operation::Pwrite | Operation::Zero | Operation::Trim => libc::ENOSPC,
                _ => libc::EINVAL,
            },
            BackendError::InvalidArgument(_) => libc::EINVAL,
            BackendError::InvalidState { .. } => libc::EINVAL,
            BackendError::HandleType { .. } => libc::EIO,
        }
    }
}

/// Result type for per-request operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that stop a chain from being composed
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{filename}: {kind} registration function failed")]
    RegistrationFailed { filename: String, kind: BackendKind },

    #[error(
        "{filename}: {kind} is incompatible with this version of the server \
         (api_version = {actual}, need {expected})"
    )]
    ApiVersion {
        filename: String,
        kind: BackendKind,
        actual: i32,
        expected: i32,
    },

    #[error(
        "{filename}: {kind} is incompatible with this version of the server \
         (version = {actual}, need {expected})"
    )]
    BuildVersion {
        filename: String,
        kind: BackendKind,
        actual: String,
        expected: String,
    },

    #[error("{filename}: {kind} name '{name}' is invalid: {reason}")]
    InvalidName {
        filename: String,
        kind: BackendKind,
        name: String,
        reason: &'static str,
    },

    #[error("{filename}: {kind} must define {op}")]
    MissingHandler {
        filename: String,
        kind: BackendKind,
        op: Operation,
    },

    #[error("{filename}: filter defines no open handler, so its handle type must be ()")]
    HandleNotNeeded { filename: String },

    #[error("{backend}: invalid thread model: {reason}")]
    ThreadModel { backend: String, reason: String },

    #[error("{backend}: {source}")]
    Config {
        backend: String,
        #[source]
        source: ConfigError,
    },

    #[error("unknown {kind}: {name}")]
    UnknownModule { kind: BackendKind, name: String },

    #[error("{kind} '{name}' is already registered")]
    DuplicateModule { kind: BackendKind, name: String },
}

/// Whether a backend terminates the chain or wraps another backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Plugin,
    Filter,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Plugin => f.write_str("plugin"),
            BackendKind::Filter => f.write_str("filter"),
        }
    }
}

/// One link in a backend chain
pub struct Backend {
    index: usize,
    name: String,
    filename: String,
    thread_model: OnceLock<ThreadModel>,
    loaded: AtomicBool,
    ops: Box<dyn Dispatch>,
}

impl Backend {
    pub(crate) fn new(index: usize, filename: &str, ops: Box<dyn Dispatch>) -> Self {
        Self {
            index,
            name: ops.info().name.clone(),
            filename: filename.to_string(),
            thread_model: OnceLock::new(),
            loaded: AtomicBool::new(false),
            ops,
        }
    }

    /// Position in the chain; the plugin is 0
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of backends from this one down to the plugin
    pub fn depth(&self) -> usize {
        self.index + 1
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> BackendKind {
        self.ops.kind()
    }

    /// The backend this one wraps, if any
    pub fn next(&self) -> Option<&Backend> {
        self.ops.next()
    }

    /// Effective thread model, once the chain has been composed
    pub fn thread_model(&self) -> Option<ThreadModel> {
        self.thread_model.get().copied()
    }

    /// Name of the plugin at the bottom of the chain
    pub fn plugin_name(&self) -> &str {
        self.ops.plugin_name()
    }

    /// Key that a bare `value` parameter is assigned to
    pub fn magic_config_key(&self) -> Option<&str> {
        self.ops.magic_config_key()
    }

    pub fn version(&self) -> Option<&str> {
        self.ops.version()
    }

    /// Help text describing this backend and its parameters
    pub fn usage(&self) -> String {
        let info = self.ops.info();
        let mut text = format!("{}: {}", self.kind(), self.name);
        if let Some(longname) = &info.longname {
            text.push_str(&format!(" ({})", longname));
        }
        text.push('\n');
        text.push_str(&format!("({})\n", self.filename));
        for block in [&info.description, &info.config_help].into_iter().flatten() {
            text.push_str(block);
            if !block.ends_with('\n') {
                text.push('\n');
            }
        }
        text
    }

    /// `key=value` diagnostics describing the plugin
    pub fn dump_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        if self.kind() == BackendKind::Plugin {
            fields.push(("path".to_string(), self.filename.clone()));
            fields.push(("name".to_string(), self.name.clone()));
        }
        fields.extend(self.ops.dump_fields());
        fields
    }

    pub fn config(&self, key: &str, value: &str) -> ConfigResult {
        log::debug!("{}: config key={}, value={}", self.name, key, value);
        self.ops.config(key, value)
    }

    pub fn config_complete(&self) -> ConfigResult {
        log::debug!("{}: config_complete", self.name);
        self.ops.config_complete()
    }

    /// Compute and freeze the effective thread model of this backend.
    pub(crate) fn negotiate_thread_model(&self) -> Result<ThreadModel, ChainError> {
        if let Some(model) = self.thread_model.get() {
            return Ok(*model);
        }

        let downstream = match self.next() {
            Some(next) => Some(next.negotiate_thread_model()?),
            None => None,
        };
        let declared = self
            .ops
            .thread_model()
            .map_err(|e| ChainError::ThreadModel {
                backend: self.name.clone(),
                reason: e.to_string(),
            })?;
        let effective = match downstream {
            Some(downstream) => declared.restrict(downstream),
            None => declared,
        };

        log::debug!(
            "{}: thread model declared={} effective={}",
            self.name,
            declared,
            effective
        );
        let _ = self.thread_model.set(effective);
        Ok(effective)
    }

    pub(crate) fn load(&self) {
        if !self.loaded.swap(true, Ordering::SeqCst) {
            log::debug!("{}: load", self.name);
            self.ops.load();
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Open this backend's handle for `session`.
    ///
    /// If the open fails, every backend beneath this one that is still
    /// open in the session is closed before the error is returned.
    pub fn open(&self, session: &Session, readonly: bool) -> BackendResult<()> {
        let slot = session.slot(self.index)?;
        {
            let mut slot = slot.write();
            if slot.state != HandleState::Unopened {
                return Err(self.invalid_state(Operation::Open, slot.state));
            }
            slot.state = HandleState::Opening;
            slot.readonly = readonly;
        }

        log::debug!(
            "{}: open session={} readonly={}",
            self.name,
            session.id(),
            readonly
        );

        match self.ops.open(session, readonly) {
            Ok(handle) => {
                let mut slot = slot.write();
                slot.handle = Some(handle);
                slot.state = HandleState::Open;
                Ok(())
            }
            Err(e) => {
                log::debug!("{}: open failed: {}", self.name, e);
                slot.write().reset();
                self.release_below(session);
                Err(e)
            }
        }
    }

    pub fn prepare(&self, session: &Session, readonly: bool) -> BackendResult<()> {
        let slot = session.slot(self.index)?;
        {
            let guard = slot.read();
            match guard.state {
                HandleState::Open => {}
                HandleState::Prepared => return Ok(()),
                state => return Err(self.invalid_state(Operation::Prepare, state)),
            }
            let handle = self.handle_of(&guard, Operation::Prepare)?;
            log::debug!("{}: prepare session={}", self.name, session.id());
            self.ops.prepare(session, handle, readonly)?;
        }
        slot.write().state = HandleState::Prepared;
        Ok(())
    }

    /// Finalize before close. A handle that was opened but never prepared
    /// has nothing to finalize.
    pub fn finalize(&self, session: &Session) -> BackendResult<()> {
        let slot = session.slot(self.index)?;
        {
            let guard = slot.read();
            match guard.state {
                HandleState::Prepared => {
                    let handle = self.handle_of(&guard, Operation::Finalize)?;
                    log::debug!("{}: finalize session={}", self.name, session.id());
                    self.ops.finalize(session, handle)?;
                }
                HandleState::Open | HandleState::Finalized => {}
                state => return Err(self.invalid_state(Operation::Finalize, state)),
            }
        }
        slot.write().state = HandleState::Finalized;
        Ok(())
    }

    /// Release this backend's handle. Closing a handle that was never
    /// opened is a no-op.
    pub fn close(&self, session: &Session) {
        let Ok(slot) = session.slot(self.index) else {
            return;
        };
        let handle = {
            let mut slot = slot.write();
            match slot.state {
                HandleState::Unopened | HandleState::Opening => return,
                _ => slot.reset(),
            }
        };

        log::debug!("{}: close session={}", self.name, session.id());
        if let Some(handle) = handle {
            self.ops.close(session, handle);
        }
    }

    /// Finalize, close, open and prepare this backend again.
    pub fn reopen(&self, session: &Session, readonly: bool) -> BackendResult<()> {
        if self.is_open(session) {
            if let Err(e) = self.finalize(session) {
                self.close(session);
                return Err(e);
            }
            self.close(session);
        }

        self.open(session, readonly)?;
        if let Err(e) = self.prepare(session, readonly) {
            let _ = self.finalize(session);
            self.close(session);
            return Err(e);
        }
        Ok(())
    }

    /// Whether this backend holds a handle in `session`
    pub fn is_open(&self, session: &Session) -> bool {
        matches!(
            session.handle_state(self.index),
            Some(HandleState::Open | HandleState::Prepared | HandleState::Finalized)
        )
    }

    fn release_below(&self, session: &Session) {
        let mut next = self.next();
        while let Some(backend) = next {
            if backend.is_open(session) {
                log::debug!(
                    "{}: releasing handle after failed open of {}",
                    backend.name,
                    self.name
                );
                backend.close(session);
            }
            next = backend.next();
        }
    }

    // ------------------------------------------------------------------
    // Size and capabilities
    // ------------------------------------------------------------------

    pub fn get_size(&self, session: &Session) -> BackendResult<u64> {
        if let Some(size) = self.cached(session, Operation::GetSize, |caps| caps.size)? {
            return Ok(size);
        }
        let size = self.with_handle(session, Operation::GetSize, |handle| {
            self.ops.get_size(session, handle)
        })?;
        session.slot(self.index)?.write().caps.size = Some(size);
        Ok(size)
    }

    pub fn can_write(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanWrite)
    }

    pub fn can_flush(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanFlush)
    }

    pub fn is_rotational(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::IsRotational)
    }

    pub fn can_trim(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanTrim)
    }

    pub fn can_zero(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanZero)
    }

    pub fn can_fast_zero(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanFastZero)
    }

    pub fn can_extents(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanExtents)
    }

    pub fn can_fua(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanFua)
    }

    pub fn can_multi_conn(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanMultiConn)
    }

    pub fn can_cache(&self, session: &Session) -> BackendResult<bool> {
        self.capability(session, Operation::CanCache)
    }

    /// Answer a capability predicate, consulting the per-session cache
    pub fn capability(&self, session: &Session, op: Operation) -> BackendResult<bool> {
        if !op_is_predicate(op) {
            return Err(BackendError::InvalidArgument(format!(
                "{} is not a capability",
                op
            )));
        }
        if let Some(value) = self.cached(session, op, |caps| caps.get(op))? {
            return Ok(value);
        }

        let implied_false = match op {
            Operation::CanWrite => session.slot(self.index)?.read().readonly,
            Operation::CanTrim | Operation::CanZero | Operation::CanFua => {
                !self.can_write(session)?
            }
            Operation::CanFastZero => !self.can_zero(session)?,
            _ => false,
        };
        let value = if implied_false {
            false
        } else {
            self.with_handle(session, op, |handle| {
                self.ops.capability(session, op, handle)
            })?
        };

        session.slot(self.index)?.write().caps.set(op, value);
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    pub fn pread(
        &self,
        session: &Session,
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        self.check_request(session, Operation::Pread, buf.len() as u64, offset, flags)?;
        log::trace!("{}: pread count={} offset={}", self.name, buf.len(), offset);
        self.with_handle(session, Operation::Pread, |handle| {
            self.ops.pread(session, handle, buf, offset, flags)
        })
    }

    pub fn pwrite(
        &self,
        session: &Session,
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        self.check_request(session, Operation::Pwrite, buf.len() as u64, offset, flags)?;
        self.check_writable(session, flags)?;
        log::trace!(
            "{}: pwrite count={} offset={} flags={:?}",
            self.name,
            buf.len(),
            offset,
            flags
        );
        self.with_handle(session, Operation::Pwrite, |handle| {
            self.ops.pwrite(session, handle, buf, offset, flags)
        })
    }

    pub fn flush(&self, session: &Session, flags: Flags) -> BackendResult<()> {
        self.check_flags(Operation::Flush, flags)?;
        if !self.can_flush(session)? {
            return Err(BackendError::NotSupported(Operation::Flush));
        }
        log::trace!("{}: flush", self.name);
        self.with_handle(session, Operation::Flush, |handle| {
            self.ops.flush(session, handle, flags)
        })
    }

    pub fn trim(&self, session: &Session, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_request(session, Operation::Trim, count as u64, offset, flags)?;
        self.check_writable(session, flags)?;
        if !self.can_trim(session)? {
            return Err(BackendError::NotSupported(Operation::Trim));
        }
        log::trace!("{}: trim count={} offset={}", self.name, count, offset);
        self.with_handle(session, Operation::Trim, |handle| {
            self.ops.trim(session, handle, count, offset, flags)
        })
    }

    pub fn zero(&self, session: &Session, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_request(session, Operation::Zero, count as u64, offset, flags)?;
        self.check_writable(session, flags)?;
        if !self.can_zero(session)? {
            return Err(BackendError::NotSupported(Operation::Zero));
        }
        if flags.contains(Flags::FAST_ZERO) && !self.can_fast_zero(session)? {
            return Err(BackendError::InvalidArgument(format!(
                "{}: fast zero requested but not supported",
                self.name
            )));
        }
        log::trace!(
            "{}: zero count={} offset={} flags={:?}",
            self.name,
            count,
            offset,
            flags
        );
        self.with_handle(session, Operation::Zero, |handle| {
            self.ops.zero(session, handle, count, offset, flags)
        })
    }

    /// Describe allocation of `[offset, offset + count)`.
    ///
    /// A backend that cannot report extents answers with a single
    /// allocated extent covering the whole request.
    pub fn extents(
        &self,
        session: &Session,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        self.check_request(session, Operation::Extents, count as u64, offset, flags)?;
        if !self.can_extents(session)? {
            return extents.add(offset, count as u64, 0);
        }

        log::trace!("{}: extents count={} offset={}", self.name, count, offset);
        self.with_handle(session, Operation::Extents, |handle| {
            self.ops.extents(session, handle, count, offset, flags, extents)
        })?;

        if count > 0 && extents.is_empty() && extents.start() < extents.end() {
            return Err(BackendError::from_errno(
                libc::EIO,
                format!("{}: extents: no extents returned", self.name),
            ));
        }
        Ok(())
    }

    pub fn cache(&self, session: &Session, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_request(session, Operation::Cache, count as u64, offset, flags)?;
        if !self.can_cache(session)? {
            return Err(BackendError::NotSupported(Operation::Cache));
        }
        log::trace!("{}: cache count={} offset={}", self.name, count, offset);
        self.with_handle(session, Operation::Cache, |handle| {
            self.ops.cache(session, handle, count, offset, flags)
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn invalid_state(&self, op: Operation, state: HandleState) -> BackendError {
        BackendError::InvalidState {
            backend: self.name.clone(),
            op,
            state: state.as_str(),
        }
    }

    fn handle_of<'g>(
        &self,
        slot: &'g session::HandleSlot,
        op: Operation,
    ) -> BackendResult<&'g AnyHandle> {
        slot.handle
            .as_deref()
            .ok_or_else(|| self.invalid_state(op, slot.state))
    }

    /// Run `f` with this backend's handle, holding the slot's read lock.
    fn with_handle<T>(
        &self,
        session: &Session,
        op: Operation,
        f: impl FnOnce(&AnyHandle) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let slot = session.slot(self.index)?.read();
        if !slot.state.is_usable() {
            return Err(self.invalid_state(op, slot.state));
        }
        f(self.handle_of(&slot, op)?)
    }

    fn cached<T>(
        &self,
        session: &Session,
        op: Operation,
        f: impl FnOnce(&session::CapabilityCache) -> Option<T>,
    ) -> BackendResult<Option<T>> {
        let slot = session.slot(self.index)?.read();
        if !slot.state.is_usable() {
            return Err(self.invalid_state(op, slot.state));
        }
        Ok(f(&slot.caps))
    }

    fn check_flags(&self, op: Operation, flags: Flags) -> BackendResult<()> {
        if !op.valid_flags().contains(flags) {
            return Err(BackendError::InvalidArgument(format!(
                "{}: invalid flags {:?} for {}",
                self.name, flags, op
            )));
        }
        Ok(())
    }

    fn check_request(
        &self,
        session: &Session,
        op: Operation,
        count: u64,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        self.check_flags(op, flags)?;
        if count > u32::MAX as u64 {
            return Err(BackendError::InvalidArgument(format!(
                "{}: {} count {} exceeds 32 bits",
                self.name, op, count
            )));
        }

        let size = self.get_size(session)?;
        let in_range = offset
            .checked_add(count)
            .map_or(false, |end| end <= size);
        if !in_range {
            return Err(BackendError::OutOfRange {
                op,
                offset,
                count,
                size,
            });
        }
        Ok(())
    }

    fn check_writable(&self, session: &Session, flags: Flags) -> BackendResult<()> {
        if !self.can_write(session)? {
            return Err(BackendError::ReadOnly);
        }
        if flags.contains(Flags::FUA) && !self.can_fua(session)? {
            return Err(BackendError::InvalidArgument(format!(
                "{}: FUA requested but not supported",
                self.name
            )));
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Runs before the downstream backend is dropped, so modules are
        // unloaded outermost first.
        if self.loaded.swap(false, Ordering::SeqCst) {
            log::debug!("{}: unload", self.name);
            self.ops.unload();
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("filename", &self.filename)
            .field("thread_model", &self.thread_model())
            .finish()
    }
}

fn op_is_predicate(op: Operation) -> bool {
    matches!(
        op,
        Operation::CanWrite
            | Operation::CanFlush
            | Operation::IsRotational
            | Operation::CanTrim
            | Operation::CanZero
            | Operation::CanFastZero
            | Operation::CanExtents
            | Operation::CanFua
            | Operation::CanMultiConn
            | Operation::CanCache
    )
}
