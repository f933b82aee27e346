//! Recording modules shared by the chain tests

use super::{
    BackendError, BackendResult, ConfigNext, Extents, Filter, FilterHandlers, FilterModule, Flags,
    Next, Plugin, PluginHandlers, PluginModule, ThreadModel,
};
use crate::config::{ConfigError, ConfigResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// One recorded handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub count: u64,
    pub offset: u64,
    pub flags: Flags,
}

/// Shared log of handler invocations
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    params: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: String) {
        self.record_call(name, 0, 0, Flags::empty());
    }

    pub fn record_call(&self, name: String, count: u64, offset: u64, flags: Flags) {
        self.events.lock().push(Event {
            name,
            count,
            offset,
            flags,
        });
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }

    pub fn last(&self, name: &str) -> Option<Event> {
        self.events.lock().iter().rev().find(|e| e.name == name).cloned()
    }

    /// Config key and value as the plugin received them
    pub fn record_param(&self, key: &str, value: &str) {
        self.params.lock().push((key.to_string(), value.to_string()));
    }

    pub fn params(&self) -> Vec<(String, String)> {
        self.params.lock().clone()
    }

    /// Names of all recorded events, oldest first
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Names ending in `suffix`, oldest first
    pub fn names_ending(&self, suffix: &str) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|name| name.ends_with(suffix))
            .collect()
    }
}

/// Plugin that records every call and reads back `offset + i` as bytes
pub struct TestPlugin {
    pub recorder: Recorder,
    pub size: u64,
    pub thread_model: ThreadModel,
    pub fail_open: bool,
}

pub struct TestHandle {
    pub readonly: bool,
}

impl Plugin for TestPlugin {
    type Handle = TestHandle;
}

impl TestPlugin {
    pub fn new(recorder: &Recorder, size: u64) -> Self {
        Self {
            recorder: recorder.clone(),
            size,
            thread_model: ThreadModel::Parallel,
            fail_open: false,
        }
    }

    pub fn module(recorder: &Recorder, size: u64) -> PluginModule<Self> {
        Self::new(recorder, size).into_module()
    }

    pub fn into_module(self) -> PluginModule<Self> {
        PluginModule::new("test", self, Self::handlers())
            .with_magic_config_key("size")
            .with_version("1.0")
    }

    /// Every slot filled except `can_*`, `zero` and `cache`
    pub fn handlers() -> PluginHandlers<Self> {
        PluginHandlers {
            thread_model: Some(Self::thread_model),
            load: Some(Self::load),
            unload: Some(Self::unload),
            config: Some(Self::config),
            config_complete: Some(Self::config_complete),
            open: Some(Self::open),
            prepare: Some(Self::prepare),
            finalize: Some(Self::finalize),
            close: Some(Self::close),
            get_size: Some(Self::get_size),
            pread: Some(Self::pread),
            pwrite: Some(Self::pwrite),
            flush: Some(Self::flush),
            trim: Some(Self::trim),
            extents: Some(Self::extents),
            ..PluginHandlers::new()
        }
    }

    fn thread_model(&self) -> BackendResult<ThreadModel> {
        Ok(self.thread_model)
    }

    fn load(&self) {
        self.recorder.record("test.load".to_string());
    }

    fn unload(&self) {
        self.recorder.record("test.unload".to_string());
    }

    fn config(&self, key: &str, value: &str) -> ConfigResult {
        self.recorder.record("test.config".to_string());
        if key == "reject" {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        self.recorder.record_param(key, value);
        Ok(())
    }

    fn config_complete(&self) -> ConfigResult {
        self.recorder.record("test.config_complete".to_string());
        Ok(())
    }

    fn open(&self, readonly: bool) -> BackendResult<TestHandle> {
        self.recorder.record("test.open".to_string());
        if self.fail_open {
            return Err(BackendError::from_errno(libc::EIO, "test: open failed"));
        }
        Ok(TestHandle { readonly })
    }

    fn prepare(&self, _handle: &TestHandle, _readonly: bool) -> BackendResult<()> {
        self.recorder.record("test.prepare".to_string());
        Ok(())
    }

    fn finalize(&self, _handle: &TestHandle) -> BackendResult<()> {
        self.recorder.record("test.finalize".to_string());
        Ok(())
    }

    fn close(&self, _handle: TestHandle) {
        self.recorder.record("test.close".to_string());
    }

    fn get_size(&self, _handle: &TestHandle) -> BackendResult<u64> {
        self.recorder.record("test.get_size".to_string());
        Ok(self.size)
    }

    fn pread(&self, _handle: &TestHandle, buf: &mut [u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.recorder
            .record_call("test.pread".to_string(), buf.len() as u64, offset, flags);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = offset.wrapping_add(i as u64) as u8;
        }
        Ok(())
    }

    fn pwrite(&self, _handle: &TestHandle, buf: &[u8], offset: u64, flags: Flags) -> BackendResult<()> {
        self.recorder
            .record_call("test.pwrite".to_string(), buf.len() as u64, offset, flags);
        Ok(())
    }

    fn flush(&self, _handle: &TestHandle, flags: Flags) -> BackendResult<()> {
        self.recorder.record_call("test.flush".to_string(), 0, 0, flags);
        Ok(())
    }

    fn trim(&self, _handle: &TestHandle, count: u32, offset: u64, flags: Flags) -> BackendResult<()> {
        self.recorder
            .record_call("test.trim".to_string(), count as u64, offset, flags);
        Ok(())
    }

    fn extents(
        &self,
        _handle: &TestHandle,
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        self.recorder
            .record_call("test.extents".to_string(), count as u64, offset, flags);
        extents.add(offset, count as u64, super::EXTENT_HOLE | super::EXTENT_ZERO)
    }
}

/// Filter with no `open`: records hooks and config, forwards everything
pub struct PassFilter {
    pub name: String,
    pub recorder: Recorder,
    pub thread_model: ThreadModel,
}

impl Filter for PassFilter {
    type Handle = ();
}

impl PassFilter {
    pub fn new(name: &str, recorder: &Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            thread_model: ThreadModel::Parallel,
        }
    }

    pub fn module(name: &str, recorder: &Recorder) -> FilterModule<Self> {
        Self::new(name, recorder).into_module()
    }

    pub fn into_module(self) -> FilterModule<Self> {
        let name = self.name.clone();
        FilterModule::new(
            &name,
            self,
            FilterHandlers {
                thread_model: Some(Self::thread_model),
                load: Some(Self::load),
                unload: Some(Self::unload),
                config: Some(Self::config),
                config_complete: Some(Self::config_complete),
                ..FilterHandlers::new()
            },
        )
    }

    fn thread_model(&self) -> BackendResult<ThreadModel> {
        Ok(self.thread_model)
    }

    fn load(&self) {
        self.recorder.record(format!("{}.load", self.name));
    }

    fn unload(&self) {
        self.recorder.record(format!("{}.unload", self.name));
    }

    /// Consumes `<name>-opt`, forwards every other key
    fn config(&self, next: &ConfigNext<'_>, key: &str, value: &str) -> ConfigResult {
        if key == format!("{}-opt", self.name) {
            self.recorder.record(format!("{}.config", self.name));
            return Ok(());
        }
        next.config(key, value)
    }

    fn config_complete(&self, next: &ConfigNext<'_>) -> ConfigResult {
        self.recorder.record(format!("{}.config_complete", self.name));
        next.config_complete()
    }
}

/// Filter that opens downstream itself and records its lifecycle
pub struct OpenFilter {
    pub name: String,
    pub recorder: Recorder,
    pub fail_open: bool,
}

impl Filter for OpenFilter {
    type Handle = u64;
}

impl OpenFilter {
    pub fn new(name: &str, recorder: &Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            fail_open: false,
        }
    }

    pub fn module(name: &str, recorder: &Recorder) -> FilterModule<Self> {
        Self::new(name, recorder).into_module()
    }

    pub fn into_module(self) -> FilterModule<Self> {
        let name = self.name.clone();
        FilterModule::new(
            &name,
            self,
            FilterHandlers {
                open: Some(Self::open),
                close: Some(Self::close),
                ..FilterHandlers::new()
            },
        )
    }

    fn open(&self, next: &Next<'_>, readonly: bool) -> BackendResult<u64> {
        next.open(readonly)?;
        self.recorder.record(format!("{}.open", self.name));
        if self.fail_open {
            return Err(BackendError::from_errno(
                libc::EIO,
                format!("{}: open failed", self.name),
            ));
        }
        Ok(next.session_id())
    }

    fn close(&self, next: &Next<'_>, _handle: u64) {
        self.recorder.record(format!("{}.close", self.name));
        next.close();
    }
}
