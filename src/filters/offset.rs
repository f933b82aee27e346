//! Offset filter
//!
//! Exposes the window `[offset, offset + range)` of the backend beneath
//! it as a whole disk. Without `range` the window runs to the end.

use crate::backend::{
    BackendError, BackendResult, ConfigNext, Extents, Filter, FilterHandlers, FilterModule, Flags,
    Next,
};
use crate::config::{parse_size, ConfigResult};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    offset: u64,
    range: Option<u64>,
}

#[derive(Default)]
pub struct OffsetFilter {
    window: Mutex<Window>,
}

impl Filter for OffsetFilter {
    type Handle = ();
}

pub fn init() -> Option<FilterModule<OffsetFilter>> {
    let handlers = FilterHandlers {
        config: Some(OffsetFilter::config),
        get_size: Some(OffsetFilter::get_size),
        pread: Some(OffsetFilter::pread),
        pwrite: Some(OffsetFilter::pwrite),
        trim: Some(OffsetFilter::trim),
        zero: Some(OffsetFilter::zero),
        extents: Some(OffsetFilter::extents),
        cache: Some(OffsetFilter::cache),
        ..FilterHandlers::new()
    };
    Some(
        FilterModule::new("offset", OffsetFilter::default(), handlers)
            .with_longname("offset filter")
            .with_description("Serves part of the underlying disk.")
            .with_config_help(
                "offset=<SIZE>  Start of the window (default 0).\n\
                 range=<SIZE>   Length of the window (default: to the end).",
            ),
    )
}

impl OffsetFilter {
    fn window(&self) -> Window {
        *self.window.lock()
    }

    fn config(&self, next: &ConfigNext<'_>, key: &str, value: &str) -> ConfigResult {
        match key {
            "offset" => self.window.lock().offset = parse_size(key, value)?,
            "range" => self.window.lock().range = Some(parse_size(key, value)?),
            _ => return next.config(key, value),
        }
        Ok(())
    }

    fn get_size(&self, next: &Next<'_>, _handle: &()) -> BackendResult<u64> {
        let size = next.get_size()?;
        let window = self.window();
        let end = match window.range {
            Some(range) => window.offset.checked_add(range),
            None => Some(size),
        };
        match end {
            Some(end) if window.offset <= size && end <= size => Ok(end - window.offset),
            _ => Err(BackendError::InvalidArgument(format!(
                "offset: window offset={} range={:?} is beyond the underlying size {}",
                window.offset, window.range, size
            ))),
        }
    }

    fn pread(
        &self,
        next: &Next<'_>,
        _handle: &(),
        buf: &mut [u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        next.pread(buf, offset + self.window().offset, flags)
    }

    fn pwrite(
        &self,
        next: &Next<'_>,
        _handle: &(),
        buf: &[u8],
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        next.pwrite(buf, offset + self.window().offset, flags)
    }

    fn trim(
        &self,
        next: &Next<'_>,
        _handle: &(),
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        next.trim(count, offset + self.window().offset, flags)
    }

    fn zero(
        &self,
        next: &Next<'_>,
        _handle: &(),
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        next.zero(count, offset + self.window().offset, flags)
    }

    fn cache(
        &self,
        next: &Next<'_>,
        _handle: &(),
        count: u32,
        offset: u64,
        flags: Flags,
    ) -> BackendResult<()> {
        next.cache(count, offset + self.window().offset, flags)
    }

    fn extents(
        &self,
        next: &Next<'_>,
        handle: &(),
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        let shift = self.window().offset;
        let limit = self.get_size(next, handle)?;
        let start = offset + shift;
        let mut below = Extents::new(start, start + count as u64)?;
        next.extents(count, start, flags, &mut below)?;
        // The layer below may describe more than the window holds
        for extent in below.iter() {
            let offset = extent.offset - shift;
            if offset >= limit {
                break;
            }
            extents.add(offset, extent.length.min(limit - offset), extent.kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Recorder, TestHandle, TestPlugin};
    use crate::backend::{register_filter, register_plugin, EXTENT_HOLE, EXTENT_ZERO};
    use crate::chain::Chain;
    use crate::connection::Connection;

    fn offset_chain(recorder: &Recorder, size: u64, params: &[&str]) -> Chain {
        let plugin = register_plugin("test.so", || Some(TestPlugin::module(recorder, size))).unwrap();
        let top = register_filter(plugin, "builtin:offset", init).unwrap();
        Chain::compose(top, params).unwrap()
    }

    #[test]
    fn test_window_translation() {
        let recorder = Recorder::new();
        let chain = offset_chain(&recorder, 1 << 20, &["offset=4k", "range=64k"]);
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        assert_eq!(conn.negotiate().unwrap().size, 64 * 1024);

        let mut buf = [0u8; 2];
        conn.pread(&mut buf, 1, Flags::empty()).unwrap();
        let event = recorder.last("test.pread").unwrap();
        assert_eq!(event.offset, 4096 + 1);
        assert_eq!(buf, [1, 2]);

        conn.pwrite(&[0u8; 10], 100, Flags::empty()).unwrap();
        assert_eq!(recorder.last("test.pwrite").unwrap().offset, 4196);

        conn.trim(512, 512, Flags::empty()).unwrap();
        assert_eq!(recorder.last("test.trim").unwrap().offset, 4608);

        // Beyond the window, even though the plugin is larger
        assert!(matches!(
            conn.pread(&mut buf, 64 * 1024 - 1, Flags::empty()),
            Err(BackendError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_window_to_end_and_unknown_keys_forwarded() {
        let recorder = Recorder::new();
        let chain = offset_chain(&recorder, 10_000, &["offset=1000", "colour=blue"]);
        assert_eq!(recorder.count("test.config"), 1);

        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        assert_eq!(conn.negotiate().unwrap().size, 9000);
    }

    #[test]
    fn test_extents_translated_back() {
        let recorder = Recorder::new();
        let chain = offset_chain(&recorder, 1 << 20, &["offset=8192"]);
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        conn.negotiate().unwrap();

        let extents = conn.extents(4096, 512, Flags::empty()).unwrap();
        let event = recorder.last("test.extents").unwrap();
        assert_eq!((event.count, event.offset), (4096, 8192 + 512));
        let list = extents.as_slice();
        assert_eq!(list.len(), 1);
        assert_eq!((list[0].offset, list[0].length), (512, 4096));
        assert_eq!(list[0].kind, EXTENT_HOLE | EXTENT_ZERO);
    }

    #[test]
    fn test_extents_clipped_to_window_end() {
        // Reports one data extent running to the end of the disk
        fn to_end(
            plugin: &TestPlugin,
            _: &TestHandle,
            _: u32,
            offset: u64,
            _: Flags,
            extents: &mut Extents,
        ) -> BackendResult<()> {
            extents.add(offset, plugin.size - offset, 0)
        }

        let recorder = Recorder::new();
        let plugin = register_plugin("test.so", || {
            let mut module = TestPlugin::module(&recorder, 1 << 20);
            module.handlers.extents = Some(to_end);
            Some(module)
        })
        .unwrap();
        let top = register_filter(plugin, "builtin:offset", init).unwrap();
        let chain = Chain::compose(top, &["offset=4k", "range=8k"]).unwrap();
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        assert_eq!(conn.negotiate().unwrap().size, 8192);

        let extents = conn.extents(2048, 4096, Flags::empty()).unwrap();
        let list = extents.as_slice();
        assert_eq!(list.len(), 1);
        assert_eq!((list[0].offset, list[0].length, list[0].kind), (4096, 4096, 0));
    }

    #[test]
    fn test_window_beyond_device() {
        let recorder = Recorder::new();
        let chain = offset_chain(&recorder, 4096, &["offset=2048", "range=4096"]);
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        assert!(matches!(
            conn.negotiate(),
            Err(BackendError::InvalidArgument(_))
        ));
    }
}
