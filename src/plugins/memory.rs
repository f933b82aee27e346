//! Sparse RAM disk
//!
//! Data lives in 32 KiB pages that are allocated on first write. Pages
//! that were never written, or were trimmed or zeroed as a whole, read
//! back as zeroes and are reported as holes.

use crate::backend::{
    BackendResult, Extents, Flags, Plugin, PluginHandlers, PluginModule, EXTENT_HOLE, EXTENT_ZERO,
};
use crate::config::{parse_size, ConfigError, ConfigResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

const PAGE_SIZE: u64 = 32 * 1024;

/// Part of one page touched by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageSpan {
    page: u64,
    start: usize,
    len: usize,
}

impl PageSpan {
    fn is_whole_page(&self) -> bool {
        self.start == 0 && self.len as u64 == PAGE_SIZE
    }
}

fn spans(offset: u64, count: u64) -> impl Iterator<Item = PageSpan> {
    let end = offset + count;
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let start = pos % PAGE_SIZE;
        let len = (PAGE_SIZE - start).min(end - pos);
        let span = PageSpan {
            page: pos / PAGE_SIZE,
            start: start as usize,
            len: len as usize,
        };
        pos += len;
        Some(span)
    })
}

#[derive(Default)]
pub struct MemoryPlugin {
    size: Mutex<Option<u64>>,
    pages: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl Plugin for MemoryPlugin {
    type Handle = ();
}

pub fn init() -> Option<PluginModule<MemoryPlugin>> {
    let handlers = PluginHandlers {
        config: Some(MemoryPlugin::config),
        config_complete: Some(MemoryPlugin::config_complete),
        dump_plugin: Some(MemoryPlugin::dump_plugin),
        open: Some(MemoryPlugin::open),
        get_size: Some(MemoryPlugin::get_size),
        can_multi_conn: Some(MemoryPlugin::can_multi_conn),
        pread: Some(MemoryPlugin::pread),
        pwrite: Some(MemoryPlugin::pwrite),
        flush: Some(MemoryPlugin::flush),
        trim: Some(MemoryPlugin::trim),
        zero: Some(MemoryPlugin::zero),
        extents: Some(MemoryPlugin::extents),
        ..PluginHandlers::new()
    };
    Some(
        PluginModule::new("memory", MemoryPlugin::default(), handlers)
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_magic_config_key("size")
            .with_longname("sparse RAM disk")
            .with_description("Serves a sparse virtual disk held in memory.")
            .with_config_help("size=<SIZE>  (required) Size of the disk, e.g. 64M or 2G."),
    )
}

impl MemoryPlugin {
    fn config(&self, key: &str, value: &str) -> ConfigResult {
        match key {
            "size" => {
                *self.size.lock() = Some(parse_size(key, value)?);
                Ok(())
            }
            _ => Err(ConfigError::UnknownKey(key.to_string())),
        }
    }

    fn config_complete(&self) -> ConfigResult {
        if self.size.lock().is_none() {
            return Err(ConfigError::MissingKey("size".to_string()));
        }
        Ok(())
    }

    fn dump_plugin(&self) -> Vec<(String, String)> {
        vec![("page_size".to_string(), PAGE_SIZE.to_string())]
    }

    fn open(&self, _readonly: bool) -> BackendResult<()> {
        Ok(())
    }

    fn get_size(&self, _handle: &()) -> BackendResult<u64> {
        Ok(self.size.lock().unwrap_or(0))
    }

    fn can_multi_conn(&self, _handle: &()) -> BackendResult<bool> {
        Ok(true)
    }

    fn pread(&self, _handle: &(), buf: &mut [u8], offset: u64, _flags: Flags) -> BackendResult<()> {
        let pages = self.pages.read();
        let mut done = 0;
        for span in spans(offset, buf.len() as u64) {
            let out = &mut buf[done..done + span.len];
            match pages.get(&span.page) {
                Some(page) => out.copy_from_slice(&page[span.start..span.start + span.len]),
                None => out.fill(0),
            }
            done += span.len;
        }
        Ok(())
    }

    fn pwrite(&self, _handle: &(), buf: &[u8], offset: u64, _flags: Flags) -> BackendResult<()> {
        let mut pages = self.pages.write();
        let mut done = 0;
        for span in spans(offset, buf.len() as u64) {
            let page = pages
                .entry(span.page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
            page[span.start..span.start + span.len].copy_from_slice(&buf[done..done + span.len]);
            done += span.len;
        }
        Ok(())
    }

    fn flush(&self, _handle: &(), _flags: Flags) -> BackendResult<()> {
        Ok(())
    }

    fn trim(&self, _handle: &(), count: u32, offset: u64, _flags: Flags) -> BackendResult<()> {
        self.clear(count, offset);
        Ok(())
    }

    fn zero(&self, _handle: &(), count: u32, offset: u64, _flags: Flags) -> BackendResult<()> {
        self.clear(count, offset);
        Ok(())
    }

    /// Drop whole pages and zero the partial ones at either end
    fn clear(&self, count: u32, offset: u64) {
        let mut pages = self.pages.write();
        for span in spans(offset, count as u64) {
            if span.is_whole_page() {
                pages.remove(&span.page);
            } else if let Some(page) = pages.get_mut(&span.page) {
                page[span.start..span.start + span.len].fill(0);
            }
        }
    }

    fn extents(
        &self,
        _handle: &(),
        count: u32,
        offset: u64,
        flags: Flags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        let pages = self.pages.read();
        for span in spans(offset, count as u64) {
            let kind = if pages.contains_key(&span.page) {
                0
            } else {
                EXTENT_HOLE | EXTENT_ZERO
            };
            // One complete extent is enough for REQ_ONE
            let first_done = extents.len() == 1 && extents.as_slice()[0].kind != kind;
            if flags.contains(Flags::REQ_ONE) && first_done {
                break;
            }
            extents.add(span.page * PAGE_SIZE + span.start as u64, span.len as u64, kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{register_plugin, ChainError};
    use crate::chain::Chain;
    use crate::connection::Connection;

    fn memory_chain(params: &[&str]) -> Result<Chain, ChainError> {
        let plugin = register_plugin("builtin:memory", init)?;
        Chain::compose(plugin, params)
    }

    #[test]
    fn test_page_spans() {
        let spans: Vec<PageSpan> = spans(PAGE_SIZE - 10, 20 + PAGE_SIZE).collect();
        assert_eq!(
            spans,
            vec![
                PageSpan { page: 0, start: (PAGE_SIZE - 10) as usize, len: 10 },
                PageSpan { page: 1, start: 0, len: PAGE_SIZE as usize },
                PageSpan { page: 2, start: 0, len: 10 },
            ]
        );
        assert!(spans[1].is_whole_page());
        assert_eq!(super::spans(0, 0).count(), 0);
    }

    #[test]
    fn test_size_is_required() {
        let err = memory_chain(&[]).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Config {
                source: ConfigError::MissingKey(_),
                ..
            }
        ));
        let err = memory_chain(&["1M", "colour=red"]).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Config {
                source: ConfigError::UnknownKey(_),
                ..
            }
        ));
    }

    #[test]
    fn test_read_write_roundtrip() {
        let chain = memory_chain(&["size=1M"]).unwrap();
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        let info = conn.negotiate().unwrap();
        assert_eq!(info.size, 1 << 20);
        assert!(info.can_multi_conn);
        assert!(info.can_trim);
        assert!(info.can_extents);

        // Straddles a page boundary
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let offset = PAGE_SIZE - 500;
        conn.pwrite(&data, offset, Flags::empty()).unwrap();

        let mut buf = vec![0xffu8; 1000];
        conn.pread(&mut buf, offset, Flags::empty()).unwrap();
        assert_eq!(buf, data);

        let mut untouched = vec![0xffu8; 64];
        conn.pread(&mut untouched, 4 * PAGE_SIZE, Flags::empty()).unwrap();
        assert!(untouched.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_and_extents() {
        let chain = memory_chain(&["256k"]).unwrap();
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        conn.negotiate().unwrap();

        conn.pwrite(&vec![0x55u8; 3 * PAGE_SIZE as usize], 0, Flags::FUA).unwrap();
        let extents = conn.extents(4 * PAGE_SIZE as u32, 0, Flags::empty()).unwrap();
        let list = extents.as_slice();
        assert_eq!(list.len(), 2);
        assert_eq!((list[0].offset, list[0].length, list[0].kind), (0, 3 * PAGE_SIZE, 0));
        assert_eq!(list[1].kind, EXTENT_HOLE | EXTENT_ZERO);

        // Whole middle page plus half of the last one
        conn.zero(
            (PAGE_SIZE + PAGE_SIZE / 2) as u32,
            PAGE_SIZE,
            Flags::MAY_TRIM,
        )
        .unwrap();
        let mut buf = vec![0xffu8; (2 * PAGE_SIZE) as usize];
        conn.pread(&mut buf, PAGE_SIZE, Flags::empty()).unwrap();
        assert!(buf[..(PAGE_SIZE + PAGE_SIZE / 2) as usize].iter().all(|b| *b == 0));
        assert!(buf[(PAGE_SIZE + PAGE_SIZE / 2) as usize..].iter().all(|b| *b == 0x55));

        let extents = conn.extents(3 * PAGE_SIZE as u32, 0, Flags::empty()).unwrap();
        let kinds: Vec<u32> = extents.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![0, EXTENT_HOLE | EXTENT_ZERO, 0]);

        let first = conn.extents(3 * PAGE_SIZE as u32, 0, Flags::REQ_ONE).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.as_slice()[0].length, PAGE_SIZE);
    }

    #[test]
    fn test_trim_reads_back_zeroes() {
        let chain = memory_chain(&["size=64k"]).unwrap();
        let conn = Connection::new(&chain, false);
        conn.open().unwrap();
        conn.negotiate().unwrap();

        conn.pwrite(&[9u8; 100], 0, Flags::empty()).unwrap();
        conn.trim(50, 25, Flags::empty()).unwrap();
        let mut buf = [0u8; 100];
        conn.pread(&mut buf, 0, Flags::empty()).unwrap();
        assert!(buf[..25].iter().all(|b| *b == 9));
        assert!(buf[25..75].iter().all(|b| *b == 0));
        assert!(buf[75..].iter().all(|b| *b == 9));
    }

    #[test]
    fn test_shared_between_connections() {
        let chain = memory_chain(&["size=64k"]).unwrap();
        let writer = Connection::new(&chain, false);
        writer.open().unwrap();
        writer.negotiate().unwrap();
        writer.pwrite(b"hello", 10, Flags::empty()).unwrap();

        let reader = Connection::new(&chain, true);
        reader.open().unwrap();
        reader.negotiate().unwrap();
        let mut buf = [0u8; 5];
        reader.pread(&mut buf, 10, Flags::empty()).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
