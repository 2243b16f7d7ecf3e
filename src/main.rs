use anyhow::{Context, Result};
use clap::Parser;
use class_proxy::backend::RemapBackend;
use class_proxy::cache::IndexStore;
use class_proxy::classpath::{ClassSource, Classpath};
use class_proxy::cli::{Cli, Commands};
use class_proxy::config::{
    LOG_ENV, ProxyConfig, clear_store, resolve_config_path, resolve_store_path,
};
use class_proxy::criterion::Category;
use class_proxy::error::PartialScanWarning;
use class_proxy::generator::{Contract, ProxyClassGenerator};
use class_proxy::index::Index;
use class_proxy::version::VersionResolver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear => {
            let store_path = resolve_store_path(&cli)?;
            clear_store(&store_path)?;
            print_json(&serde_json::json!({
                "cleared": store_path.to_string_lossy(),
            }))?;
        }
        Commands::Stats => {
            let store = IndexStore::open(resolve_store_path(&cli)?)?;
            print_json(&store.stats()?)?;
        }
        Commands::Index => {
            let config = load_config(&cli)?;
            let classpath = open_classpath(&cli)?;
            let loaded = load_index(&cli, &config, &classpath)?;
            print_json(&IndexOutput::new(&loaded))?;
        }
        Commands::Query { category } => {
            let category: Category = category.parse().map_err(anyhow::Error::msg)?;
            let config = load_config(&cli)?;
            let classpath = open_classpath(&cli)?;
            let loaded = load_index(&cli, &config, &classpath)?;
            print_json(&loaded.index.get(&category))?;
        }
        Commands::Resolve {
            contract,
            bind,
            parents,
            version,
            output,
        } => {
            let config = load_config(&cli)?;
            let classpath = Arc::new(open_classpath(&cli)?);
            let loaded = load_index(&cli, &config, &*classpath)?;
            let resolver = config.resolver(version.as_deref())?;
            let version = resolver.version().label().to_string();

            let generator = ProxyClassGenerator::new(
                classpath,
                Arc::new(loaded.index),
                Arc::new(resolver),
                Arc::new(RemapBackend::new()),
            );
            let contract = Contract::new(&contract);
            let parent_patterns: Vec<&str> = parents.iter().map(String::as_str).collect();
            let class = generator.resolve_with_parents(&contract, &bind, &parent_patterns)?;
            let parent_classes = parent_patterns
                .iter()
                .filter_map(|p| generator.cached(&contract, p))
                .map(|c| c.name().to_string())
                .collect();

            if let Some(path) = &output {
                write_bytes(path, class.bytes())?;
            }
            print_json(&ResolveOutput {
                contract: contract.name().to_string(),
                pattern: bind,
                version,
                logical_name: class.logical_name.clone(),
                class_name: class.name().to_string(),
                relocations: class.relocations.clone(),
                nested: class.nested_names(),
                parents: parent_classes,
                bytes: class.bytes().len(),
                output,
            })?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let path = resolve_config_path(cli)?;
    debug!(config = ?path, "loading config");
    ProxyConfig::load(path.as_deref())
}

fn open_classpath(cli: &Cli) -> Result<Classpath> {
    if cli.classpath.is_empty() {
        anyhow::bail!("No classpath given; pass one or more roots with -c/--classpath");
    }
    Classpath::open(&cli.classpath)
}

struct LoadedIndex {
    index: Index,
    warnings: Vec<PartialScanWarning>,
    cache_hit: bool,
    duration_ms: u64,
}

/// Loads the stored index for this classpath and criteria set, or scans and
/// stores a fresh one. Store failures only cost the cache.
fn load_index(cli: &Cli, config: &ProxyConfig, classpath: &dyn ClassSource) -> Result<LoadedIndex> {
    let start = Instant::now();
    let builder = config.index_builder()?;

    let store = if cli.no_store {
        None
    } else {
        let path = resolve_store_path(cli)?;
        match IndexStore::open(path.clone()) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(store = %path.display(), error = %e, "index store unavailable");
                None
            }
        }
    };

    if let Some(store) = &store {
        let fingerprint = builder
            .fingerprint(classpath)
            .context("Failed to fingerprint classpath")?;
        match store.load(&fingerprint) {
            Ok(Some(stored)) => {
                return Ok(LoadedIndex {
                    index: stored.index,
                    warnings: stored.warnings,
                    cache_hit: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read stored index"),
        }
    }

    let report = builder.build(classpath);
    if let Some(store) = &store
        && let Err(e) = store.store(&report.index, &report.warnings)
    {
        warn!(error = %e, "failed to store index");
    }
    Ok(LoadedIndex {
        index: report.index,
        warnings: report.warnings,
        cache_hit: false,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[derive(Debug, Serialize)]
struct IndexOutput<'a> {
    classes: usize,
    matches: usize,
    categories: BTreeMap<String, usize>,
    warnings: &'a [PartialScanWarning],
    cache_hit: bool,
    fingerprint: Option<&'a str>,
    duration_ms: u64,
}

impl<'a> IndexOutput<'a> {
    fn new(loaded: &'a LoadedIndex) -> Self {
        Self {
            classes: loaded.index.class_names().len(),
            matches: loaded.index.match_count(),
            categories: loaded
                .index
                .categories()
                .map(|(category, names)| (category.to_string(), names.len()))
                .collect(),
            warnings: &loaded.warnings,
            cache_hit: loaded.cache_hit,
            fingerprint: loaded.index.fingerprint(),
            duration_ms: loaded.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResolveOutput {
    contract: String,
    pattern: String,
    version: String,
    logical_name: String,
    class_name: String,
    relocations: BTreeMap<String, String>,
    nested: Vec<String>,
    parents: Vec<String>,
    bytes: usize,
    output: Option<PathBuf>,
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, bytes)
        .with_context(|| format!("Failed to write class file: {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
