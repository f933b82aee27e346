//! NBD server binary
//!
//! Serves a plugin, optionally wrapped in filters, over NBD.

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::process;

use voe_chain::backend::{Backend, SERVER_VERSION};
use voe_chain::chain::{Chain, ModuleRegistry};
use voe_chain::config::{ChainConfig, Config, ServerConfig};
use voe_chain::nbd::{NbdServer, NbdServerConfig};

#[derive(Parser, Debug)]
#[command(name = "nbd-chain", version = SERVER_VERSION)]
#[command(about = "NBD server for a plugin wrapped in filters", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (e.g., 127.0.0.1:10809)
    #[arg(short, long)]
    bind: Option<String>,

    /// Export name
    #[arg(short, long)]
    export: Option<String>,

    /// Filter to stack on the plugin; the first one given is outermost
    #[arg(long = "filter", value_name = "FILTER")]
    filters: Vec<String>,

    /// Serve every connection read-only
    #[arg(short, long)]
    readonly: bool,

    /// Print plugin diagnostics as key=value lines and exit
    #[arg(long)]
    dump_plugin: bool,

    /// Print help for the plugin and filters and exit
    #[arg(long)]
    help_plugin: bool,

    /// List built-in plugins and filters and exit
    #[arg(long)]
    list: bool,

    /// Plugin name
    plugin: Option<String>,

    /// Plugin and filter parameters (key=value, or a bare value for the
    /// plugin's magic key)
    params: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nbd-chain: {:#}", e);
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str()))
        .init();

    if let Err(e) = run(&args, config) {
        log::error!("{:#}", e);
        process::exit(1);
    }
}

/// Merge the configuration file, if any, with the command line
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => {
            let Some(plugin) = &args.plugin else {
                if args.list {
                    return Ok(Config {
                        server: ServerConfig::default(),
                        chain: ChainConfig {
                            plugin: String::new(),
                            filters: Vec::new(),
                            params: Vec::new(),
                        },
                    });
                }
                bail!("no plugin given (use a plugin name or --config)");
            };
            Config {
                server: ServerConfig::default(),
                chain: ChainConfig {
                    plugin: plugin.clone(),
                    filters: Vec::new(),
                    params: Vec::new(),
                },
            }
        }
    };

    if let Some(plugin) = &args.plugin {
        config.chain.plugin = plugin.clone();
    }
    if !args.filters.is_empty() {
        config.chain.filters = args.filters.clone();
    }
    config.chain.params.extend(args.params.iter().cloned());
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(export) = &args.export {
        config.server.export_name = export.clone();
    }
    config.server.readonly |= args.readonly;

    Ok(config)
}

fn run(args: &Args, config: Config) -> Result<()> {
    let registry = ModuleRegistry::with_builtins();

    if args.list {
        println!("plugins: {}", registry.plugin_names().collect::<Vec<_>>().join(" "));
        println!("filters: {}", registry.filter_names().collect::<Vec<_>>().join(" "));
        return Ok(());
    }

    if args.dump_plugin || args.help_plugin {
        let top = registry
            .build(&config.chain.plugin, &config.chain.filters)
            .context("failed to load chain")?;
        let backends: Vec<&Backend> = std::iter::successors(Some(&*top), |b| b.next()).collect();
        if args.help_plugin {
            for backend in &backends {
                println!("{}", backend.usage());
            }
        }
        if args.dump_plugin {
            if let Some(plugin) = backends.last() {
                for (key, value) in plugin.dump_fields() {
                    println!("{}={}", key, value);
                }
            }
        }
        return Ok(());
    }

    log::info!("Starting NBD server");
    log::info!("  Bind address: {}", config.server.bind);
    log::info!("  Export name: {:?}", config.server.export_name);
    log::info!("  Plugin: {}", config.chain.plugin);
    log::info!("  Filters: {:?}", config.chain.filters);
    log::info!("  Read-only: {}", config.server.readonly);

    let chain = Chain::from_config(&registry, &config.chain).context("failed to configure chain")?;
    if let Some(version) = chain.version() {
        log::info!("  Plugin version: {}", version);
    }

    let nbd_config = NbdServerConfig {
        bind_addr: config.server.bind,
        export_name: config.server.export_name,
        readonly: config.server.readonly,
    };

    NbdServer::new(nbd_config, chain)
        .run()
        .context("server error")
}
