//! Host version tokens and version-keyed name mapping.
//!
//! The mapping from logical to concrete class names is data, not branching:
//! a [`VersionedMappings`] table set is reduced to one [`MappingTable`] for the
//! running host by a pure function of the version token.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::classfile::{package_name, simple_name};
use crate::error::{ProxyError, Result};

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const PACKAGE_PLACEHOLDER: &str = "{package}";

/// Ordered host version, parsed from the numeric groups of its label:
/// `1.20.4` -> [1, 20, 4], `v1_20_R3` -> [1, 20, 3], `V2` -> [2].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VersionToken {
    label: String,
    parts: Vec<u32>,
}

impl VersionToken {
    pub fn parse(label: &str) -> std::result::Result<Self, String> {
        let parts: Vec<u32> = label
            .split(|c: char| !c.is_ascii_digit())
            .filter(|g| !g.is_empty())
            .map(|g| g.parse::<u32>().map_err(|e| format!("bad version group {g}: {e}")))
            .collect::<std::result::Result<_, _>>()?;
        if parts.is_empty() {
            return Err(format!("version has no numeric part: {label}"));
        }
        Ok(Self {
            label: label.to_string(),
            parts,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl PartialEq for VersionToken {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionToken {}

impl PartialOrd for VersionToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Missing trailing groups count as zero, so `1.20` == `1.20.0`.
impl Ord for VersionToken {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl FromStr for VersionToken {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        VersionToken::parse(s)
    }
}

impl From<VersionToken> for String {
    fn from(v: VersionToken) -> Self {
        v.label
    }
}

impl TryFrom<String> for VersionToken {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        VersionToken::parse(&s)
    }
}

pub trait VersionResolver: Send + Sync {
    fn version(&self) -> &VersionToken;

    /// Concrete binary name for a logical one, if this host renames it.
    fn map_name(&self, logical: &str) -> Option<String>;

    /// Strict resolvers treat an unmapped name as unresolvable.
    fn is_strict(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct MappingTable {
    version: VersionToken,
    names: BTreeMap<String, String>,
    strict: bool,
}

impl MappingTable {
    pub fn new(version: VersionToken) -> Self {
        Self {
            version,
            names: BTreeMap::new(),
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn map(mut self, logical: &str, concrete: &str) -> Self {
        self.names.insert(logical.to_string(), concrete.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl VersionResolver for MappingTable {
    fn version(&self) -> &VersionToken {
        &self.version
    }

    fn map_name(&self, logical: &str) -> Option<String> {
        self.names.get(logical).cloned()
    }

    fn is_strict(&self) -> bool {
        self.strict
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedTable {
    pub since: VersionToken,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

/// Mapping tables keyed by the first host version they apply to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedMappings {
    tables: Vec<VersionedTable>,
}

impl VersionedMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, since: VersionToken, names: BTreeMap<String, String>) -> Self {
        self.tables.push(VersionedTable { since, names });
        self
    }

    pub fn from_tables(tables: Vec<VersionedTable>) -> Self {
        Self { tables }
    }

    /// The mapping in effect on `version`: every table with `since <= version`
    /// merged in ascending `since` order, later tables overriding earlier ones.
    pub fn select(&self, version: &VersionToken) -> MappingTable {
        let mut applicable: Vec<&VersionedTable> =
            self.tables.iter().filter(|t| &t.since <= version).collect();
        applicable.sort_by(|a, b| a.since.cmp(&b.since));

        let mut table = MappingTable::new(version.clone());
        for t in applicable {
            for (logical, concrete) in &t.names {
                table.names.insert(logical.clone(), concrete.clone());
            }
        }
        table
    }

    pub fn map_name(&self, logical: &str, version: &VersionToken) -> Option<String> {
        self.select(version).map_name(logical)
    }
}

/// Expands a binding pattern against a contract's binary name.
///
/// `{name}` is the contract's simple name and `{package}` its package. When
/// the expansion has no package of its own it lands in the contract's package:
/// `{name}Impl` over `a.b.Engine` gives `a.b.EngineImpl`.
pub fn substitute_binding(pattern: &str, contract: &str) -> String {
    let package = package_name(contract);
    let expanded = pattern
        .replace(NAME_PLACEHOLDER, simple_name(contract))
        .replace(PACKAGE_PLACEHOLDER, package.unwrap_or(""));
    let expanded = expanded.trim_start_matches('.').to_string();
    match package {
        Some(pkg) if !expanded.contains('.') => format!("{pkg}.{expanded}"),
        _ => expanded,
    }
}

/// Logical name for the binding, then the host's concrete name for it.
/// Unmapped names are used literally unless the resolver is strict.
pub fn resolve_target(
    pattern: &str,
    contract: &str,
    resolver: &dyn VersionResolver,
) -> Result<(String, String)> {
    let logical = substitute_binding(pattern, contract);
    match resolver.map_name(&logical) {
        Some(concrete) => Ok((logical, concrete)),
        None if resolver.is_strict() => Err(ProxyError::NotFound(logical)),
        None => Ok((logical.clone(), logical)),
    }
}
