//! Client connections
//!
//! A [`Connection`] is what a protocol front end talks to. It owns the
//! [`Session`] holding every backend's handle for one client and tracks
//! the connection-level lifecycle:
//!
//! ```text
//! Unopened -> Opening -> Prepared -> Active -> Finalizing -> Closed
//! ```
//!
//! Requests are only accepted once the export has been negotiated.

use crate::backend::{BackendError, BackendResult, Extents, Flags, Operation, Session};
use crate::chain::Chain;
use parking_lot::Mutex;
use std::fmt;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Opening,
    Prepared,
    Active,
    Finalizing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unopened => "unopened",
            SessionState::Opening => "opening",
            SessionState::Prepared => "prepared",
            SessionState::Active => "active",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the outermost backend offers this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportInfo {
    pub size: u64,
    pub can_write: bool,
    pub can_flush: bool,
    pub is_rotational: bool,
    pub can_trim: bool,
    pub can_zero: bool,
    pub can_fast_zero: bool,
    pub can_extents: bool,
    pub can_fua: bool,
    pub can_multi_conn: bool,
    pub can_cache: bool,
}

/// A single data-path request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { offset: u64, count: u32, flags: Flags },
    Write { offset: u64, data: Vec<u8>, flags: Flags },
    Flush { flags: Flags },
    Trim { offset: u64, count: u32, flags: Flags },
    Zero { offset: u64, count: u32, flags: Flags },
    Extents { offset: u64, count: u32, flags: Flags },
    Cache { offset: u64, count: u32, flags: Flags },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Read { .. } => Operation::Pread,
            Request::Write { .. } => Operation::Pwrite,
            Request::Flush { .. } => Operation::Flush,
            Request::Trim { .. } => Operation::Trim,
            Request::Zero { .. } => Operation::Zero,
            Request::Extents { .. } => Operation::Extents,
            Request::Cache { .. } => Operation::Cache,
        }
    }
}

/// Successful answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(Vec<u8>),
    Extents(Extents),
    Done,
}

/// One client's view of a chain
pub struct Connection<'c> {
    chain: &'c Chain,
    session: Session,
    readonly: bool,
    state: Mutex<SessionState>,
    export: Mutex<Option<ExportInfo>>,
}

impl<'c> Connection<'c> {
    pub fn new(chain: &'c Chain, readonly: bool) -> Self {
        Self {
            chain,
            session: Session::new(chain.depth()),
            readonly,
            state: Mutex::new(SessionState::Unopened),
            export: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Negotiated export, once [`Connection::negotiate`] has run
    pub fn export(&self) -> Option<ExportInfo> {
        *self.export.lock()
    }

    /// Open and prepare the whole chain.
    pub fn open(&self) -> BackendResult<()> {
        self.transition(Operation::Open, SessionState::Unopened, SessionState::Opening)?;
        let top = self.chain.top();

        if let Err(e) = top.open(&self.session, self.readonly) {
            log::debug!("connection {}: open failed: {}", self.id(), e);
            self.set_state(SessionState::Closed);
            return Err(e);
        }
        if let Err(e) = top.prepare(&self.session, self.readonly) {
            log::debug!("connection {}: prepare failed: {}", self.id(), e);
            self.release();
            self.set_state(SessionState::Closed);
            return Err(e);
        }

        self.set_state(SessionState::Prepared);
        Ok(())
    }

    /// Query size and capabilities of the outermost backend.
    pub fn negotiate(&self) -> BackendResult<ExportInfo> {
        {
            let state = self.state.lock();
            if *state != SessionState::Prepared {
                return Err(self.invalid_state(Operation::GetSize, *state));
            }
        }

        let top = self.chain.top();
        let session = &self.session;
        let info = ExportInfo {
            size: top.get_size(session)?,
            can_write: top.can_write(session)?,
            can_flush: top.can_flush(session)?,
            is_rotational: top.is_rotational(session)?,
            can_trim: top.can_trim(session)?,
            can_zero: top.can_zero(session)?,
            can_fast_zero: top.can_fast_zero(session)?,
            can_extents: top.can_extents(session)?,
            can_fua: top.can_fua(session)?,
            can_multi_conn: top.can_multi_conn(session)?,
            can_cache: top.can_cache(session)?,
        };

        log::debug!("connection {}: negotiated {:?}", self.id(), info);
        *self.export.lock() = Some(info);
        self.set_state(SessionState::Active);
        Ok(info)
    }

    /// Run one request against the outermost backend
    pub fn invoke(&self, request: Request) -> BackendResult<Reply> {
        match request {
            Request::Read {
                offset,
                count,
                flags,
            } => {
                let mut buf = vec![0u8; count as usize];
                self.pread(&mut buf, offset, flags)?;
                Ok(Reply::Data(buf))
            }
            Request::Write {
                offset,
                data,
                flags,
            } => {
                self.pwrite(&data, offset, flags)?;
                Ok(Reply::Done)
            }
            Request::Flush { flags } => {
                self.flush(flags)?;
                Ok(Reply::Done)
            }
            Request::Trim {
                offset,
                count,
                flags,
            } => {
                self.trim(count, offset, flags)?;
                Ok(Reply::Done)
            }
            Request::Zero {
                offset,
                count,
                flags,
            } => {
                self.zero(count, offset, flags)?;
                Ok(Reply::Done)
            }
            Request::Extents {
                offset,
                count,
                flags,
            } => Ok(Reply::Extents(self.extents(count, offset, flags)?)),
            Request::Cache {
                offset,
                count,
                flags,
            } => {
                self.cache(count, offset, flags)?;
                Ok(Reply::Done)
            }
        }
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Pread)?;
        self.chain.top().pread(&self.session, buf, offset, flags)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Pwrite)?;
        self.chain.top().pwrite(&self.session, buf, offset, flags)
    }

    pub fn flush(&self, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Flush)?;
        self.chain.top().flush(&self.session, flags)
    }

    pub fn trim(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Trim)?;
        self.chain.top().trim(&self.session, count, offset, flags)
    }

    pub fn zero(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Zero)?;
        self.chain.top().zero(&self.session, count, offset, flags)
    }

    pub fn extents(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<Extents> {
        self.check_active(Operation::Extents)?;
        let mut extents = Extents::new(offset, offset.saturating_add(count as u64))?;
        self.chain
            .top()
            .extents(&self.session, count, offset, flags, &mut extents)?;
        Ok(extents)
    }

    pub fn cache(&self, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.check_active(Operation::Cache)?;
        self.chain.top().cache(&self.session, count, offset, flags)
    }

    /// Finalize and close the chain. Safe to call more than once, and
    /// a connection that never opened touches no handle.
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = match previous {
                SessionState::Prepared | SessionState::Active => SessionState::Finalizing,
                _ => SessionState::Closed,
            };
            previous
        };
        if !matches!(previous, SessionState::Prepared | SessionState::Active) {
            return;
        }

        if let Err(e) = self.chain.top().finalize(&self.session) {
            log::warn!("connection {}: finalize failed: {}", self.id(), e);
        }
        self.release();
        self.set_state(SessionState::Closed);
        log::debug!("connection {}: closed", self.id());
    }

    /// Close the top backend, then anything a filter left open beneath it.
    fn release(&self) {
        for backend in self.chain.backends() {
            if backend.is_open(&self.session) {
                backend.close(&self.session);
            }
        }
    }

    fn transition(&self, op: Operation, from: SessionState, to: SessionState) -> BackendResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(self.invalid_state(op, *state));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn check_active(&self, op: Operation) -> BackendResult<()> {
        let state = *self.state.lock();
        if state != SessionState::Active {
            return Err(self.invalid_state(op, state));
        }
        Ok(())
    }

    fn invalid_state(&self, op: Operation, state: SessionState) -> BackendError {
        BackendError::InvalidState {
            backend: format!("connection {}", self.id()),
            op,
            state: state.as_str(),
        }
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("readonly", &self.readonly)
            .finish()
    }
}
