//! LMDB persistence of the path cache.
//!
//! One database, `roots`, maps each cached root to the JSON list of its
//! items. A snapshot is written whole: `save` replaces every row inside a
//! single write transaction.

use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cache::PathCache;
use crate::error::{Result, ScanError};
use crate::path::ScanRoot;
use crate::unit::FoundItem;

pub const ROOTS_DB: &str = "roots";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

pub struct Snapshot {
    env: Env,
    db_path: PathBuf,
    roots: StrDb,
}

impl Snapshot {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::io(parent.to_string_lossy(), e))?;
        }

        let env = open_env(&db_path)?;
        let mut wtxn = env.write_txn()?;
        let roots = env.create_database::<Str, Str>(&mut wtxn, Some(ROOTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            roots,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Writes every cached root, dropping rows of roots no longer cached.
    pub fn save(&self, cache: &PathCache) -> Result<usize> {
        let mut rows = Vec::new();
        for root in cache.roots() {
            if let Some(items) = cache.get(&root) {
                rows.push((root, serde_json::to_string(&items)?));
            }
        }

        let mut wtxn = self.env.write_txn()?;
        self.roots.clear(&mut wtxn)?;
        for (root, json) in &rows {
            self.roots.put(&mut wtxn, root.as_str(), json.as_str())?;
        }
        wtxn.commit()?;

        debug!(path = %self.db_path.display(), roots = rows.len(), "snapshot saved");
        Ok(rows.len())
    }

    /// Publishes every stored root into `cache`. A row that no longer
    /// deserializes is skipped.
    pub fn load_into(&self, cache: &PathCache) -> Result<usize> {
        let rtxn = self.env.read_txn()?;
        let mut loaded = 0usize;
        for row in self.roots.iter(&rtxn)? {
            let (root, json) = row?;
            let Ok(items) = serde_json::from_str::<Vec<FoundItem>>(json) else {
                debug!(root, "unreadable snapshot row skipped");
                continue;
            };
            cache.publish(ScanRoot::from_normalized(root), items);
            loaded += 1;
        }
        debug!(path = %self.db_path.display(), roots = loaded, "snapshot loaded");
        Ok(loaded)
    }

    pub fn stats(&self) -> Result<SnapshotStats> {
        let rtxn = self.env.read_txn()?;
        let roots = table_len(&self.roots, &rtxn)?;

        let mut items = 0u64;
        let mut largest = Vec::new();
        for row in self.roots.iter(&rtxn)? {
            let (root, json) = row?;
            let Ok(list) = serde_json::from_str::<Vec<FoundItem>>(json) else {
                continue;
            };
            items += list.len() as u64;
            largest.push(RootStats {
                root: root.to_string(),
                items: list.len() as u64,
            });
        }
        largest.sort_by(|a, b| b.items.cmp(&a.items).then_with(|| a.root.cmp(&b.root)));
        largest.truncate(10);

        Ok(SnapshotStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            roots,
            items,
            largest,
        })
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: default LMDB locking is kept; NO_SUB_DIR makes --db a single file.
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

#[derive(Debug, Serialize)]
pub struct RootStats {
    pub root: String,
    pub items: u64,
}

#[derive(Debug, Serialize)]
pub struct SnapshotStats {
    pub db_path: String,
    pub roots: u64,
    pub items: u64,
    pub largest: Vec<RootStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::EntryKey;
    use crate::unit::{UnitDescriptor, UnitKind};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_db_path() -> PathBuf {
        let mut p = std::env::temp_dir();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        p.push(format!(
            "unit-hunter-snapshot-{}-{}-{}.lmdb",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos(),
            n
        ));
        p
    }

    fn item(key: &str, name: &str) -> FoundItem {
        let mut unit = UnitDescriptor::new(name, UnitKind::Class)
            .with_superclass(UnitDescriptor::unresolved("java.lang.Object"));
        unit.annotations.push("Entity".to_string());
        FoundItem::new(EntryKey::file(key), unit, key.as_bytes())
    }

    #[test]
    fn save_and_load_round_trip() {
        let db_path = temp_db_path();
        let cache = PathCache::new();
        cache.publish(
            ScanRoot::from_normalized("/r1"),
            vec![item("/r1/a/A.java", "a.A"), item("/r1/a/B.java", "a.B")],
        );
        cache.publish(ScanRoot::from_normalized("/r2.jar"), vec![item("/r2.jar!/C.java", "C")]);

        let snapshot = Snapshot::open(&db_path).unwrap();
        assert_eq!(snapshot.save(&cache).unwrap(), 2);

        let stats = snapshot.stats().unwrap();
        assert_eq!(stats.roots, 2);
        assert_eq!(stats.items, 3);
        assert_eq!(stats.largest[0].root, "/r1");

        let restored = PathCache::new();
        assert_eq!(snapshot.load_into(&restored).unwrap(), 2);
        assert_eq!(restored.roots(), cache.roots());
        assert_eq!(
            restored.get(&ScanRoot::from_normalized("/r1")),
            cache.get(&ScanRoot::from_normalized("/r1"))
        );

        // saving a smaller cache drops stale rows
        cache.invalidate(&ScanRoot::from_normalized("/r1"));
        snapshot.save(&cache).unwrap();
        assert_eq!(snapshot.stats().unwrap().roots, 1);

        drop(snapshot);
        std::fs::remove_file(&db_path).ok();
        let mut lock = db_path.into_os_string();
        lock.push("-lock");
        std::fs::remove_file(PathBuf::from(lock)).ok();
    }
}
