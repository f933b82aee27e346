//! Per-connection handle storage
//!
//! A [`Session`] holds one slot per backend in the chain, indexed by the
//! backend's position (0 is the plugin). Each slot owns the opaque handle
//! returned by that backend's `open` together with the capability answers
//! cached for the connection.

use super::{BackendError, BackendResult, Operation};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased per-connection handle owned by one backend
pub type ErasedHandle = Box<dyn Any + Send + Sync>;

/// Lifecycle of one backend's handle within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleState {
    #[default]
    Unopened,
    Opening,
    Open,
    Prepared,
    Finalized,
}

impl HandleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleState::Unopened => "unopened",
            HandleState::Opening => "opening",
            HandleState::Open => "open",
            HandleState::Prepared => "prepared",
            HandleState::Finalized => "finalized",
        }
    }

    /// Whether data-path and capability calls are allowed
    pub fn is_usable(&self) -> bool {
        matches!(self, HandleState::Open | HandleState::Prepared)
    }
}

/// Answers cached per backend per connection
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CapabilityCache {
    pub size: Option<u64>,
    pub can_write: Option<bool>,
    pub can_flush: Option<bool>,
    pub is_rotational: Option<bool>,
    pub can_trim: Option<bool>,
    pub can_zero: Option<bool>,
    pub can_fast_zero: Option<bool>,
    pub can_extents: Option<bool>,
    pub can_fua: Option<bool>,
    pub can_multi_conn: Option<bool>,
    pub can_cache: Option<bool>,
}

impl CapabilityCache {
    pub fn get(&self, op: Operation) -> Option<bool> {
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

    pub fn set(&mut self, op: Operation, value: bool) {
        let entry = match op {
            Operation::CanWrite => &mut self.can_write,
            Operation::CanFlush => &mut self.can_flush,
            Operation::IsRotational => &mut self.is_rotational,
            Operation::CanTrim => &mut self.can_trim,
            Operation::CanZero => &mut self.can_zero,
            Operation::CanFastZero => &mut self.can_fast_zero,
            Operation::CanExtents => &mut self.can_extents,
            Operation::CanFua => &mut self.can_fua,
            Operation::CanMultiConn => &mut self.can_multi_conn,
            Operation::CanCache => &mut self.can_cache,
            _ => return,
        };
        *entry = Some(value);
    }
}

#[derive(Default)]
pub(crate) struct HandleSlot {
    pub state: HandleState,
    pub handle: Option<ErasedHandle>,
    pub readonly: bool,
    pub caps: CapabilityCache,
}

impl HandleSlot {
    /// Forget everything about the previous open
    pub fn reset(&mut self) -> Option<ErasedHandle> {
        self.state = HandleState::Unopened;
        self.readonly = false;
        self.caps = CapabilityCache::default();
        self.handle.take()
    }
}

/// Handle arena for one client connection
pub struct Session {
    id: u64,
    slots: Vec<RwLock<HandleSlot>>,
}

impl Session {
    /// Create a session for a chain of `depth` backends
    pub fn new(depth: usize) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            slots: (0..depth).map(|_| RwLock::new(HandleSlot::default())).collect(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Current state of the handle owned by backend `index`
    pub fn handle_state(&self, index: usize) -> Option<HandleState> {
        self.slots.get(index).map(|slot| slot.read().state)
    }

    pub(crate) fn slot(&self, index: usize) -> BackendResult<&RwLock<HandleSlot>> {
        self.slots.get(index).ok_or_else(|| {
            BackendError::InvalidArgument(format!(
                "session {} has no slot for backend {} (depth {})",
                self.id,
                index,
                self.slots.len()
            ))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let leaked = self
            .slots
            .iter()
            .filter(|slot| slot.read().handle.is_some())
            .count();
        if leaked > 0 {
            log::debug!(
                "session {}: dropping {} handle(s) that were never closed",
                self.id,
                leaked
            );
        }
    }
}
