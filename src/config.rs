use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::criterion::Criterion;
use crate::index::IndexBuilder;
use crate::version::{MappingTable, VersionToken, VersionedMappings, VersionedTable};

pub const STORE_ENV: &str = "CLASS_PROXY_STORE";
pub const LOG_ENV: &str = "CLASS_PROXY_LOG";

const DEFAULT_VERSION: &str = "0";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    pub threads: Option<usize>,
    #[serde(default)]
    pub criteria: Vec<CriterionConfig>,
    #[serde(default)]
    pub version: VersionConfig,
}

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CriterionConfig {
    pub name: String,
    pub prefix: Option<String>,
    #[serde(default)]
    pub subtype: Vec<String>,
    #[serde(default)]
    pub implements: Vec<String>,
    #[serde(default)]
    pub type_annotation: Vec<String>,
    #[serde(default)]
    pub method_annotation: Vec<String>,
    #[serde(default)]
    pub field_annotation: Vec<String>,
}

impl CriterionConfig {
    pub fn to_criterion(&self) -> Criterion {
        let base = match &self.prefix {
            Some(prefix) => Criterion::with_prefix(&self.name, prefix),
            None => Criterion::new(&self.name),
        };
        base.subtype(&self.subtype)
            .implements(&self.implements)
            .type_annotation(&self.type_annotation)
            .method_annotation(&self.method_annotation)
            .field_annotation(&self.field_annotation)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionConfig {
    pub current: Option<String>,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub mappings: Vec<VersionedTable>,
}

impl ProxyConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config")
    }

    /// Reads `path`, or returns the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self {
                parallel: true,
                ..Self::default()
            });
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn criteria(&self) -> Vec<Criterion> {
        self.criteria.iter().map(CriterionConfig::to_criterion).collect()
    }

    /// Fails when two criteria share a name.
    pub fn index_builder(&self) -> Result<IndexBuilder> {
        let builder = IndexBuilder::new()
            .register_all(self.criteria())
            .context("Invalid criteria in config")?
            .parallel(self.parallel);
        Ok(match self.threads {
            Some(n) => builder.threads(n),
            None => builder,
        })
    }

    /// Mapping table for `version` (or the configured current version).
    pub fn resolver(&self, version: Option<&str>) -> Result<MappingTable> {
        let label = version
            .or(self.version.current.as_deref())
            .unwrap_or(DEFAULT_VERSION);
        let token = VersionToken::parse(label)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid version: {label}"))?;
        let mappings = VersionedMappings::from_tables(self.version.mappings.clone());
        Ok(mappings.select(&token).strict(self.version.strict))
    }
}

pub fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(p) = cli.config.clone() {
        return Ok(Some(p));
    }
    let default_path = class_proxy_home()?.join("config.toml");
    Ok(default_path.exists().then_some(default_path))
}

pub fn resolve_store_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.store.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(STORE_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    Ok(class_proxy_home()?.join("index.lmdb"))
}

pub fn clear_store(store_path: &Path) -> Result<()> {
    remove_file_if_exists(store_path, "store")?;
    remove_file_if_exists(&lmdb_lock_path(store_path), "store lock")?;
    Ok(())
}

fn class_proxy_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("class-proxy"))
}

fn lmdb_lock_path(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
