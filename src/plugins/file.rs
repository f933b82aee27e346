//! File-backed plugin
//!
//! Serves a regular file as the disk. The file is opened once all
//! parameters are known and shared by every connection.

use crate::backend::{BackendError, BackendResult, Flags, Plugin, PluginHandlers, PluginModule};
use crate::config::{parse_bool, parse_size, ConfigError, ConfigResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Default)]
struct Settings {
    path: Option<PathBuf>,
    size: Option<u64>,
    readonly: bool,
}

/// Open image file
struct Image {
    file: Mutex<File>,
    size: u64,
    readonly: bool,
}

impl Image {
    /// Open a file, creating or extending it to `size` bytes if given
    fn open(path: &Path, size: Option<u64>, readonly: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(size.is_some() && !readonly)
            .open(path)?;

        let current_size = file.metadata()?.len();
        let size = match size {
            Some(size) if size > current_size && !readonly => {
                file.set_len(size)?;
                size
            }
            _ => current_size,
        };

        Ok(Self {
            file: Mutex::new(file),
            size,
            readonly,
        })
    }
}

#[derive(Default)]
pub struct FilePlugin {
    settings: Mutex<Settings>,
    image: OnceLock<Image>,
}

impl Plugin for FilePlugin {
    type Handle = ();
}

pub fn init() -> Option<PluginModule<FilePlugin>> {
    let handlers = PluginHandlers {
        config: Some(FilePlugin::config),
        config_complete: Some(FilePlugin::config_complete),
        dump_plugin: Some(FilePlugin::dump_plugin),
        open: Some(FilePlugin::open),
        get_size: Some(FilePlugin::get_size),
        can_write: Some(FilePlugin::can_write),
        pread: Some(FilePlugin::pread),
        pwrite: Some(FilePlugin::pwrite),
        flush: Some(FilePlugin::flush),
        ..PluginHandlers::new()
    };
    Some(
        PluginModule::new("file", FilePlugin::default(), handlers)
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_magic_config_key("file")
            .with_longname("raw file image")
            .with_description("Serves a regular file as a disk image.")
            .with_config_help(
                "file=<PATH>      (required) Image file to serve.\n\
                 size=<SIZE>      Create or extend the file to this size.\n\
                 readonly=<BOOL>  Open the file read-only.",
            ),
    )
}

impl FilePlugin {
    fn config(&self, key: &str, value: &str) -> ConfigResult {
        let mut settings = self.settings.lock();
        match key {
            "file" => {
                if value.is_empty() {
                    return Err(ConfigError::invalid_value(key, value, "path is empty"));
                }
                settings.path = Some(PathBuf::from(value));
            }
            "size" => settings.size = Some(parse_size(key, value)?),
            "readonly" => settings.readonly = parse_bool(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn config_complete(&self) -> ConfigResult {
        let settings = self.settings.lock();
        let path = settings
            .path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("file".to_string()))?;

        let image = Image::open(path, settings.size, settings.readonly)?;
        log::info!(
            "file: serving {} ({} bytes{})",
            path.display(),
            image.size,
            if image.readonly { ", read-only" } else { "" }
        );
        if self.image.set(image).is_err() {
            return Err(ConfigError::Invalid("file: image already opened".to_string()));
        }
        Ok(())
    }

    fn dump_plugin(&self) -> Vec<(String, String)> {
        let settings = self.settings.lock();
        match &settings.path {
            Some(path) => vec![("file".to_string(), path.display().to_string())],
            None => Vec::new(),
        }
    }

    fn image(&self) -> BackendResult<&Image> {
        self.image
            .get()
            .ok_or_else(|| BackendError::from_errno(libc::EBADF, "file: image is not open"))
    }

    fn open(&self, _readonly: bool) -> BackendResult<()> {
        self.image().map(|_| ())
    }

    fn get_size(&self, _handle: &()) -> BackendResult<u64> {
        Ok(self.image()?.size)
    }

    fn can_write(&self, _handle: &()) -> BackendResult<bool> {
        Ok(!self.image()?.readonly)
    }

    fn pread(&self, _handle: &(), buf: &mut [u8], offset: u64, _flags: Flags) -> BackendResult<()> {
        let mut file = self.image()?.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn pwrite(&self, _handle: &(), buf: &[u8], offset: u64, _flags: Flags) -> BackendResult<()> {
        let mut file = self.image()?.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self, _handle: &(), _flags: Flags) -> BackendResult<()> {
        let file = self.image()?.file.lock();
        file.sync_all()?;
        Ok(())
    }
}
