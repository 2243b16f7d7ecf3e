//! Persistent store for built indices.
//!
//! Uses LMDB (via heed). Each index is stored as JSON, together with the
//! warnings of the scan that built it, under the fingerprint of the classpath
//! and criteria it was built from, so an unchanged classpath can skip the scan
//! on the next start. Only the most recently stored indices are kept.

use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PartialScanWarning, Result};
use crate::index::Index;

pub const INDICES_DB: &str = "indices";
pub const META_DB: &str = "meta";
pub const DEFAULT_RETAINED: usize = 4;

const LATEST_KEY: &str = "latest";
/// JSON list of stored fingerprints, most recent first.
const RECENT_KEY: &str = "recent";
const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug)]
pub struct IndexStore {
    env: Env,
    db_path: PathBuf,
    indices: StrDb,
    meta: StrDb,
    retained: usize,
}

/// An index as stored, with the warnings its scan produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIndex {
    pub index: Index,
    #[serde(default)]
    pub warnings: Vec<PartialScanWarning>,
}

#[derive(Serialize)]
struct StoredIndexRef<'a> {
    index: &'a Index,
    warnings: &'a [PartialScanWarning],
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub db_path: String,
    pub stored_indices: u64,
    pub latest_fingerprint: Option<String>,
    pub latest_classes: Option<usize>,
    pub latest_matches: Option<usize>,
}

impl IndexStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let env = open_env(&db_path)?;
        let mut wtxn = env.write_txn()?;
        let indices = env.create_database::<Str, Str>(&mut wtxn, Some(INDICES_DB))?;
        let meta = env.create_database::<Str, Str>(&mut wtxn, Some(META_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            indices,
            meta,
            retained: DEFAULT_RETAINED,
        })
    }

    /// Number of indices kept; storing past it evicts the least recently
    /// stored ones.
    pub fn retain(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// The index stored for `fingerprint`, if any.
    pub fn load(&self, fingerprint: &str) -> Result<Option<StoredIndex>> {
        let rtxn = self.env.read_txn()?;
        let Some(json) = self.indices.get(&rtxn, fingerprint)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(json)?))
    }

    /// Stores `index` and its scan warnings under the index fingerprint. An
    /// index without one is not stored and `false` is returned.
    pub fn store(&self, index: &Index, warnings: &[PartialScanWarning]) -> Result<bool> {
        let Some(fingerprint) = index.fingerprint() else {
            return Ok(false);
        };
        let json = serde_json::to_string(&StoredIndexRef { index, warnings })?;
        let mut wtxn = self.env.write_txn()?;
        self.indices.put(&mut wtxn, fingerprint, &json)?;
        self.meta.put(&mut wtxn, LATEST_KEY, fingerprint)?;
        let evicted = self.touch_recent(&mut wtxn, fingerprint)?;
        wtxn.commit()?;
        debug!(fingerprint, bytes = json.len(), evicted, "index stored");
        Ok(true)
    }

    /// Moves `fingerprint` to the front of the recent list and deletes the
    /// indices that fall off its end. Returns how many were deleted.
    fn touch_recent(&self, wtxn: &mut RwTxn<'_>, fingerprint: &str) -> Result<usize> {
        let mut recent: Vec<String> = match self.meta.get(&*wtxn, RECENT_KEY)? {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        recent.retain(|fp| fp != fingerprint);
        recent.insert(0, fingerprint.to_string());

        let evicted = recent.split_off(recent.len().min(self.retained));
        for fp in &evicted {
            self.indices.delete(wtxn, fp)?;
        }
        self.meta
            .put(wtxn, RECENT_KEY, &serde_json::to_string(&recent)?)?;
        Ok(evicted.len())
    }

    pub fn latest(&self) -> Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.meta.get(&rtxn, LATEST_KEY)?.map(str::to_string))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let stored_indices = {
            let rtxn = self.env.read_txn()?;
            table_len(&self.indices, &rtxn)?
        };
        let latest_fingerprint = self.latest()?;
        let latest = match &latest_fingerprint {
            Some(fp) => self.load(fp)?,
            None => None,
        };
        Ok(StoreStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            stored_indices,
            latest_classes: latest.as_ref().map(|s| s.index.class_names().len()),
            latest_matches: latest.as_ref().map(|s| s.index.match_count()),
            latest_fingerprint,
        })
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the store a single file at the configured path.
    let env = unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options.open(db_path)?
    };
    Ok(env)
}

fn table_len(db: &StrDb, rtxn: &RoTxn<'_>) -> Result<u64> {
    let mut count = 0u64;
    for item in db.iter(rtxn)? {
        let _ = item?;
        count += 1;
    }
    Ok(count)
}
