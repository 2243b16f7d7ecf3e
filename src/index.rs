//! Builds the category index over one classpath snapshot.
//!
//! Every class is read once and offered to every registered criterion. Each
//! evaluation only looks at its own `ClassDescriptor`, so the per-class work
//! runs on a rayon pool with no shared state; results are merged once the
//! whole scan is done. Classes that cannot be read or parsed are skipped with
//! a [`PartialScanWarning`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::classfile::read_class;
use crate::classpath::ClassSource;
use crate::criterion::{Category, Criterion, MatchEntry, MatchKind};
use crate::error::{PartialScanWarning, ProxyError, Result};

static EMPTY: BTreeSet<String> = BTreeSet::new();

/// Category -> matching class names, plus every class name that parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    categories: BTreeMap<Category, BTreeSet<String>>,
    classes: BTreeSet<String>,
    fingerprint: Option<String>,
}

impl Index {
    /// Names recorded under `category`; empty when nothing matched.
    pub fn get(&self, category: &Category) -> &BTreeSet<String> {
        self.categories.get(category).unwrap_or(&EMPTY)
    }

    /// Every name any kind of the named criterion matched.
    pub fn scope(&self, criterion: &str) -> BTreeSet<String> {
        MatchKind::ALL
            .into_iter()
            .flat_map(|kind| self.get(&Category::new(criterion, kind)).iter().cloned())
            .collect()
    }

    pub fn categories(&self) -> impl Iterator<Item = (&Category, &BTreeSet<String>)> {
        self.categories.iter()
    }

    pub fn class_names(&self) -> &BTreeSet<String> {
        &self.classes
    }

    pub fn contains_class(&self, name: &str) -> bool {
        self.classes.contains(name)
    }

    /// Every indexed class nested (at any depth) under `outer`, i.e. whose
    /// binary name starts with `outer$`.
    pub fn nested_classes(&self, outer: &str) -> Vec<String> {
        let prefix = format!("{outer}$");
        self.classes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn match_count(&self) -> usize {
        self.categories.values().map(BTreeSet::len).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub index: Index,
    pub warnings: Vec<PartialScanWarning>,
    pub scanned: usize,
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn into_shared(self) -> Arc<Index> {
        Arc::new(self.index)
    }
}

#[derive(Debug, Clone)]
pub struct IndexBuilder {
    criteria: Vec<Criterion>,
    parallel: bool,
    threads: Option<usize>,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            parallel: true,
            threads: None,
        }
    }
}

type ClassOutcome = std::result::Result<(String, Vec<MatchEntry>), PartialScanWarning>;

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a criterion. Names must be unique: a criterion's categories are
    /// its own scope.
    pub fn register(mut self, criterion: Criterion) -> Result<Self> {
        if self.criteria.iter().any(|c| c.name() == criterion.name()) {
            return Err(ProxyError::DuplicateCriterion(criterion.name().to_string()));
        }
        self.criteria.push(criterion);
        Ok(self)
    }

    pub fn register_all(self, criteria: impl IntoIterator<Item = Criterion>) -> Result<Self> {
        criteria.into_iter().try_fold(self, IndexBuilder::register)
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Worker count for parallel scans; the global rayon pool is used when unset.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    /// Identifies the index this builder would produce from `source`: the
    /// classpath snapshot plus the registered criteria.
    pub fn fingerprint(&self, source: &dyn ClassSource) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(source.fingerprint()?.as_bytes());
        for criterion in &self.criteria {
            hasher.update(b"\n");
            hasher.update(criterion.signature().as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn build(&self, source: &dyn ClassSource) -> ScanReport {
        let start = Instant::now();
        let names: Vec<&String> = source.class_names().iter().collect();

        let outcomes: Vec<ClassOutcome> = if !self.parallel {
            names.iter().map(|n| self.scan_class(source, n)).collect()
        } else if let Some(threads) = self.threads {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| self.scan_parallel(source, &names)),
                Err(e) => {
                    warn!(error = %e, "failed to build scan pool, using the global pool");
                    self.scan_parallel(source, &names)
                }
            }
        } else {
            self.scan_parallel(source, &names)
        };

        let mut index = Index {
            fingerprint: self.fingerprint(source).ok(),
            ..Index::default()
        };
        let mut warnings = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok((name, entries)) => {
                    for entry in entries {
                        index
                            .categories
                            .entry(entry.category)
                            .or_default()
                            .insert(entry.class_name);
                    }
                    index.classes.insert(name);
                }
                Err(warning) => {
                    warn!(class = %warning.class_name, reason = %warning.reason, "skipping classpath entry");
                    warnings.push(warning);
                }
            }
        }

        let report = ScanReport {
            scanned: names.len(),
            duration_ms: start.elapsed().as_millis() as u64,
            index,
            warnings,
        };
        info!(
            scanned = report.scanned,
            indexed = report.index.classes.len(),
            matches = report.index.match_count(),
            skipped = report.warnings.len(),
            duration_ms = report.duration_ms,
            "classpath index built"
        );
        report
    }

    fn scan_parallel(&self, source: &dyn ClassSource, names: &[&String]) -> Vec<ClassOutcome> {
        names
            .par_iter()
            .map(|n| self.scan_class(source, n))
            .collect()
    }

    fn scan_class(&self, source: &dyn ClassSource, name: &str) -> ClassOutcome {
        let warning = |reason: String| PartialScanWarning {
            class_name: name.to_string(),
            reason,
        };
        let bytes = source.read_class(name).map_err(|e| warning(e.to_string()))?;
        let class = read_class(&bytes).map_err(|e| {
            warning(
                ProxyError::Malformed {
                    name: name.to_string(),
                    source: e,
                }
                .to_string(),
            )
        })?;
        let entries = self
            .criteria
            .iter()
            .filter_map(|c| c.evaluate(&class))
            .collect();
        Ok((class.name, entries))
    }
}
