//! Registration and load gate
//!
//! Every module is built by an initializer that returns its module
//! description, or `None` if it could not be created. The gate checks the
//! declared API version and build version against the server's own, the
//! module name and the handlers the module kind requires, then wraps the
//! module in a [`Backend`] and runs its `load` hook.

use super::filter::{Filter, FilterBackend, FilterModule};
use super::plugin::{Plugin, PluginBackend, PluginModule};
use super::{Backend, BackendKind, ChainError, Operation};
use std::any::TypeId;
use std::sync::Arc;

/// API version a plugin must declare
pub const PLUGIN_API_VERSION: i32 = 2;

/// API version a filter must declare
pub const FILTER_API_VERSION: i32 = 6;

/// Build version modules are checked against
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity and compatibility fields common to plugins and filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub api_version: i32,
    /// Server version the module was built against
    pub version: Option<String>,
    pub name: String,
    pub longname: Option<String>,
    pub description: Option<String>,
    pub config_help: Option<String>,
}

impl ModuleInfo {
    pub fn plugin(name: &str) -> Self {
        Self::new(name, PLUGIN_API_VERSION)
    }

    pub fn filter(name: &str) -> Self {
        Self::new(name, FILTER_API_VERSION)
    }

    fn new(name: &str, api_version: i32) -> Self {
        Self {
            api_version,
            version: Some(SERVER_VERSION.to_string()),
            name: name.to_string(),
            longname: None,
            description: None,
            config_help: None,
        }
    }
}

/// Register the plugin at the bottom of a chain.
pub fn register_plugin<P, I>(filename: &str, init: I) -> Result<Arc<Backend>, ChainError>
where
    P: Plugin,
    I: FnOnce() -> Option<PluginModule<P>>,
{
    let kind = BackendKind::Plugin;
    let module = init().ok_or_else(|| ChainError::RegistrationFailed {
        filename: filename.to_string(),
        kind,
    })?;

    check_info(filename, kind, &module.info, PLUGIN_API_VERSION)?;
    let required = [
        (Operation::Open, module.handlers.open.is_some()),
        (Operation::GetSize, module.handlers.get_size.is_some()),
        (Operation::Pread, module.handlers.pread.is_some()),
    ];
    if let Some((op, _)) = required.into_iter().find(|(_, present)| !present) {
        return Err(ChainError::MissingHandler {
            filename: filename.to_string(),
            kind,
            op,
        });
    }

    let backend = Backend::new(0, filename, Box::new(PluginBackend::new(module)));
    log::debug!("registered plugin {} ({})", backend.name(), filename);
    backend.load();
    Ok(Arc::new(backend))
}

/// Register a filter on top of `next`.
///
/// On failure `next` is dropped here, which unloads it and everything
/// beneath it unless the caller still holds a reference.
pub fn register_filter<F, I>(
    next: Arc<Backend>,
    filename: &str,
    init: I,
) -> Result<Arc<Backend>, ChainError>
where
    F: Filter,
    I: FnOnce() -> Option<FilterModule<F>>,
{
    let kind = BackendKind::Filter;
    let module = init().ok_or_else(|| ChainError::RegistrationFailed {
        filename: filename.to_string(),
        kind,
    })?;

    check_info(filename, kind, &module.info, FILTER_API_VERSION)?;
    if module.handlers.open.is_none() && TypeId::of::<F::Handle>() != TypeId::of::<()>() {
        return Err(ChainError::HandleNotNeeded {
            filename: filename.to_string(),
        });
    }

    let index = next.index() + 1;
    let backend = Backend::new(index, filename, Box::new(FilterBackend::new(module, next)));
    log::debug!(
        "registered filter {} ({}) at index {}",
        backend.name(),
        filename,
        index
    );
    backend.load();
    Ok(Arc::new(backend))
}

fn check_info(
    filename: &str,
    kind: BackendKind,
    info: &ModuleInfo,
    api_version: i32,
) -> Result<(), ChainError> {
    if info.api_version != api_version {
        return Err(ChainError::ApiVersion {
            filename: filename.to_string(),
            kind,
            actual: info.api_version,
            expected: api_version,
        });
    }

    if info.version.as_deref() != Some(SERVER_VERSION) {
        return Err(ChainError::BuildVersion {
            filename: filename.to_string(),
            kind,
            actual: info.version.clone().unwrap_or_else(|| "<null>".to_string()),
            expected: SERVER_VERSION.to_string(),
        });
    }

    validate_name(&info.name).map_err(|reason| ChainError::InvalidName {
        filename: filename.to_string(),
        kind,
        name: info.name.clone(),
        reason,
    })
}

/// Module names start with a letter and contain letters, digits, '-' and '_'
fn validate_name(name: &str) -> Result<(), &'static str> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("name is empty"),
        Some(c) if !c.is_ascii_alphabetic() => return Err("name must begin with a letter"),
        Some(_) => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err("name may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}
