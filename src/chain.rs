//! Chain composition
//!
//! [`ModuleRegistry`] maps module names to their initializers. A chain is
//! built innermost first: the plugin is registered, then each filter is
//! registered on top of the chain built so far. [`Chain::compose`] then
//! delivers the configuration to the outermost backend, runs
//! `config_complete` and fixes the effective thread model.

use crate::backend::{
    register_filter, register_plugin, Backend, BackendKind, ChainError, Filter, FilterModule,
    Plugin, PluginModule, ThreadModel,
};
use crate::config::{parse_param, ChainConfig, ConfigError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type PluginLoader = Box<dyn Fn(&str) -> Result<Arc<Backend>, ChainError> + Send + Sync>;
type FilterLoader =
    Box<dyn Fn(Arc<Backend>, &str) -> Result<Arc<Backend>, ChainError> + Send + Sync>;

struct Entry<L> {
    filename: String,
    loader: L,
}

/// Named plugin and filter initializers
#[derive(Default)]
pub struct ModuleRegistry {
    plugins: BTreeMap<String, Entry<PluginLoader>>,
    filters: BTreeMap<String, Entry<FilterLoader>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins and filters shipped with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Names are unique and valid, so these cannot fail.
        let results = [
            registry.add_plugin("memory", "builtin:memory", crate::plugins::memory::init),
            registry.add_plugin("file", "builtin:file", crate::plugins::file::init),
            registry.add_filter("readonly", "builtin:readonly", crate::filters::readonly::init),
            registry.add_filter("offset", "builtin:offset", crate::filters::offset::init),
            registry.add_filter("log", "builtin:log", crate::filters::log::init),
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("builtin module not registered: {}", e);
            }
        }
        registry
    }

    pub fn add_plugin<P, I>(&mut self, name: &str, filename: &str, init: I) -> Result<(), ChainError>
    where
        P: Plugin,
        I: Fn() -> Option<PluginModule<P>> + Send + Sync + 'static,
    {
        if self.plugins.contains_key(name) {
            return Err(ChainError::DuplicateModule {
                kind: BackendKind::Plugin,
                name: name.to_string(),
            });
        }
        let loader: PluginLoader = Box::new(move |filename: &str| register_plugin(filename, &init));
        self.plugins.insert(
            name.to_string(),
            Entry {
                filename: filename.to_string(),
                loader,
            },
        );
        Ok(())
    }

    pub fn add_filter<F, I>(&mut self, name: &str, filename: &str, init: I) -> Result<(), ChainError>
    where
        F: Filter,
        I: Fn() -> Option<FilterModule<F>> + Send + Sync + 'static,
    {
        if self.filters.contains_key(name) {
            return Err(ChainError::DuplicateModule {
                kind: BackendKind::Filter,
                name: name.to_string(),
            });
        }
        let loader: FilterLoader = Box::new(move |next: Arc<Backend>, filename: &str| {
            register_filter(next, filename, &init)
        });
        self.filters.insert(
            name.to_string(),
            Entry {
                filename: filename.to_string(),
                loader,
            },
        );
        Ok(())
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn load_plugin(&self, name: &str) -> Result<Arc<Backend>, ChainError> {
        let entry = self
            .plugins
            .get(name)
            .ok_or_else(|| ChainError::UnknownModule {
                kind: BackendKind::Plugin,
                name: name.to_string(),
            })?;
        (entry.loader)(&entry.filename)
    }

    pub fn load_filter(&self, name: &str, next: Arc<Backend>) -> Result<Arc<Backend>, ChainError> {
        let entry = self
            .filters
            .get(name)
            .ok_or_else(|| ChainError::UnknownModule {
                kind: BackendKind::Filter,
                name: name.to_string(),
            })?;
        (entry.loader)(next, &entry.filename)
    }

    /// Load `plugin` and wrap it in `filters`, given outermost first.
    pub fn build<S: AsRef<str>>(&self, plugin: &str, filters: &[S]) -> Result<Arc<Backend>, ChainError> {
        let mut top = self.load_plugin(plugin)?;
        for filter in filters.iter().rev() {
            top = self.load_filter(filter.as_ref(), top)?;
        }
        Ok(top)
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A configured chain ready to serve connections
#[derive(Debug)]
pub struct Chain {
    top: Arc<Backend>,
    thread_model: ThreadModel,
}

impl Chain {
    /// Configure an assembled chain and fix its thread model.
    ///
    /// `params` are delivered in order to the outermost backend. A
    /// parameter without `=` is given to the plugin's magic config key.
    pub fn compose<S: AsRef<str>>(top: Arc<Backend>, params: &[S]) -> Result<Self, ChainError> {
        let config_error = |source: ConfigError| ChainError::Config {
            backend: top.name().to_string(),
            source,
        };

        for param in params {
            let (key, value) = parse_param(param.as_ref()).map_err(config_error)?;
            let key = match key {
                Some(key) => key,
                None => top.magic_config_key().ok_or_else(|| {
                    config_error(ConfigError::NoMagicKey {
                        value: value.to_string(),
                    })
                })?,
            };
            top.config(key, value).map_err(config_error)?;
        }
        top.config_complete().map_err(config_error)?;

        let thread_model = top.negotiate_thread_model()?;
        log::info!(
            "chain ready: {} (plugin {}, depth {}, thread model {})",
            top.name(),
            top.plugin_name(),
            top.depth(),
            thread_model
        );
        Ok(Self { top, thread_model })
    }

    /// Build and configure the chain described by a `[chain]` section
    pub fn from_config(registry: &ModuleRegistry, config: &ChainConfig) -> Result<Self, ChainError> {
        let top = registry.build(&config.plugin, &config.filters)?;
        Self::compose(top, &config.params)
    }

    /// Outermost backend
    pub fn top(&self) -> &Backend {
        &self.top
    }

    /// Number of backends, plugin included
    pub fn depth(&self) -> usize {
        self.top.depth()
    }

    pub fn thread_model(&self) -> ThreadModel {
        self.thread_model
    }

    /// Backends from the outermost down to the plugin
    pub fn backends(&self) -> impl Iterator<Item = &Backend> {
        std::iter::successors(Some(&*self.top), |backend| backend.next())
    }

    pub fn plugin(&self) -> &Backend {
        let mut backend = &*self.top;
        while let Some(next) = backend.next() {
            backend = next;
        }
        backend
    }

    pub fn plugin_name(&self) -> &str {
        self.top.plugin_name()
    }

    /// Version of the plugin
    pub fn version(&self) -> Option<&str> {
        self.plugin().version()
    }

    /// Help text for every backend, outermost first
    pub fn usage(&self) -> String {
        self.backends()
            .map(Backend::usage)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn dump_fields(&self) -> Vec<(String, String)> {
        self.top.dump_fields()
    }
}
