//! Path-keyed store of scan harvests.
//!
//! A root enters the cache only as a whole: `publish` builds the complete
//! item map first and swaps it in with a single insert, so readers never see
//! a root that is half-populated.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::path::{EntryKey, ScanRoot, is_within, outermost};
use crate::unit::{FoundItem, UnitDescriptor};

type ItemMap = DashMap<EntryKey, FoundItem>;

/// How a set of requested roots relates to what is already cached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContainmentReport {
    /// Requested roots cached as they are.
    pub exact_hits: Vec<ScanRoot>,
    /// Requested roots with nothing cached in or around them.
    pub no_hits: Vec<ScanRoot>,
    /// Cached root -> requested roots lying inside it.
    pub covered: BTreeMap<ScanRoot, Vec<ScanRoot>>,
    /// Requested root -> cached directory roots lying inside it.
    pub partially_contained_directories: BTreeMap<ScanRoot, Vec<ScanRoot>>,
    /// Requested root -> cached file or archive roots lying inside it.
    pub partially_contained_files: BTreeMap<ScanRoot, Vec<ScanRoot>>,
    /// Requested outer root -> requested roots nested inside it.
    pub redundant: BTreeMap<ScanRoot, Vec<ScanRoot>>,
}

impl ContainmentReport {
    /// Cached roots that the scan of `requested` may skip.
    pub fn cached_inside(&self, requested: &ScanRoot) -> Vec<ScanRoot> {
        let mut inside: Vec<ScanRoot> = self
            .partially_contained_directories
            .get(requested)
            .into_iter()
            .chain(self.partially_contained_files.get(requested))
            .flatten()
            .cloned()
            .collect();
        inside.sort();
        inside
    }

    /// Requested roots that need a walk: no hits and partial containers.
    pub fn roots_to_scan(&self) -> Vec<ScanRoot> {
        let mut roots: Vec<ScanRoot> = self
            .no_hits
            .iter()
            .chain(self.partially_contained_directories.keys())
            .chain(self.partially_contained_files.keys())
            .cloned()
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

#[derive(Default)]
pub struct PathCache {
    roots: DashMap<ScanRoot, Arc<ItemMap>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, root: &ScanRoot) -> bool {
        self.roots.contains_key(root)
    }

    /// Items cached for exactly `root`, ordered by key.
    pub fn get(&self, root: &ScanRoot) -> Option<Vec<FoundItem>> {
        let map = self.roots.get(root).map(|m| Arc::clone(m.value()))?;
        Some(sorted_items(&map, |_| true))
    }

    /// Items of the cached root `cached` whose keys lie within `subpath`.
    pub fn items_within(&self, cached: &ScanRoot, subpath: &str) -> Vec<FoundItem> {
        match self.roots.get(cached).map(|m| Arc::clone(m.value())) {
            Some(map) => sorted_items(&map, |key| is_within(key.as_str(), subpath)),
            None => Vec::new(),
        }
    }

    /// Replaces whatever is cached for `root` with `items`.
    pub fn publish<I>(&self, root: ScanRoot, items: I)
    where
        I: IntoIterator<Item = FoundItem>,
    {
        let map: ItemMap = items
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();
        self.roots.insert(root, Arc::new(map));
    }

    /// Every cached unit, in no particular order.
    pub fn units(&self) -> Vec<Arc<UnitDescriptor>> {
        self.roots
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .map(|i| Arc::clone(&i.value().unit))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn roots(&self) -> Vec<ScanRoot> {
        let mut roots: Vec<ScanRoot> = self.roots.iter().map(|e| e.key().clone()).collect();
        roots.sort();
        roots
    }

    pub fn invalidate(&self, root: &ScanRoot) -> bool {
        self.roots.remove(root).is_some()
    }

    pub fn clear(&self) {
        self.roots.clear();
    }

    /// Number of cached roots.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of cached items across every root.
    pub fn item_count(&self) -> usize {
        self.roots.iter().map(|e| e.value().len()).sum()
    }

    /// Classifies `requested` against the cached roots. Every requested root
    /// lands in exactly one of: exact hit, covered, redundant, or the scan set
    /// (no hit / partially contained).
    pub fn check(&self, requested: &[ScanRoot]) -> ContainmentReport {
        let cached = self.roots();
        let mut report = ContainmentReport::default();
        let mut uncached: Vec<&ScanRoot> = Vec::new();

        let mut requested: Vec<&ScanRoot> = requested.iter().collect();
        requested.sort();
        requested.dedup();

        for root in requested {
            if self.contains(root) {
                report.exact_hits.push(root.clone());
            } else if let Some(outer) = cached.iter().find(|c| c.contains(root.as_str())) {
                report
                    .covered
                    .entry(outer.clone())
                    .or_default()
                    .push(root.clone());
            } else {
                uncached.push(root);
            }
        }

        let outer_roots = outermost(uncached.iter().map(|r| r.as_str()));
        for root in &uncached {
            if outer_roots.iter().any(|o| o == root.as_str()) {
                continue;
            }
            if let Some(outer) = outer_roots.iter().find(|o| is_within(root.as_str(), o)) {
                report
                    .redundant
                    .entry(ScanRoot::from_normalized(outer))
                    .or_default()
                    .push((*root).clone());
            }
        }

        for outer in outer_roots {
            let root = ScanRoot::from_normalized(&outer);
            let inside = outermost(
                cached
                    .iter()
                    .map(|c| c.as_str())
                    .filter(|c| is_within(c, &outer)),
            );
            if inside.is_empty() {
                report.no_hits.push(root);
                continue;
            }
            for cached_root in inside {
                let cached_root = ScanRoot::from_normalized(&cached_root);
                let bucket = if cached_root.as_path().is_dir() {
                    &mut report.partially_contained_directories
                } else {
                    &mut report.partially_contained_files
                };
                bucket.entry(root.clone()).or_default().push(cached_root);
            }
        }

        report
    }
}

fn sorted_items(map: &ItemMap, keep: impl Fn(&EntryKey) -> bool) -> Vec<FoundItem> {
    let mut items: Vec<FoundItem> = map
        .iter()
        .filter(|e| keep(e.key()))
        .map(|e| e.value().clone())
        .collect();
    items.sort_by(|a, b| a.key.cmp(&b.key));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitKind;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        p.push(format!(
            "unit-hunter-cache-{}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos(),
            n
        ));
        fs::create_dir_all(&p).unwrap();
        p
    }

    fn item(key: &str) -> FoundItem {
        let name = key.rsplit('/').next().unwrap().trim_end_matches(".java");
        FoundItem::new(
            EntryKey::file(key),
            UnitDescriptor::new(name, UnitKind::Class),
            key.as_bytes(),
        )
    }

    fn root(path: &str) -> ScanRoot {
        ScanRoot::from_normalized(path)
    }

    #[test]
    fn publish_replaces_whole_root() {
        let cache = PathCache::new();
        let r = root("/r");

        cache.publish(r.clone(), vec![item("/r/A.java"), item("/r/sub/B.java")]);
        cache.publish(root("/s"), vec![item("/s/C.java")]);
        assert_eq!(cache.get(&r).unwrap().len(), 2);
        assert_eq!(cache.items_within(&r, "/r/sub").len(), 1);
        assert!(cache.items_within(&r, "/r/su").is_empty());
        assert_eq!(cache.item_count(), 3);
        assert_eq!(cache.units().len(), 3);
        assert!(cache.invalidate(&root("/s")));

        cache.publish(r.clone(), vec![item("/r/D.java")]);
        assert_eq!(cache.get(&r).unwrap().len(), 1);

        assert!(cache.invalidate(&r));
        assert!(cache.is_empty());
        assert!(cache.get(&r).is_none());
    }

    #[test]
    fn check_classifies_every_request() {
        let base = temp_dir();
        let base_str = crate::path::clean(&base.to_string_lossy());
        let cached_dir = format!("{base_str}/lib/dir");
        let cached_jar = format!("{base_str}/lib/x.jar");
        fs::create_dir_all(&cached_dir).unwrap();
        fs::write(&cached_jar, b"").unwrap();
        let covering = format!("{base_str}/big");

        let cache = PathCache::new();
        cache.publish(root(&cached_dir), Vec::new());
        cache.publish(root(&cached_jar), Vec::new());
        cache.publish(root(&covering), Vec::new());

        let requested = vec![
            root(&cached_jar),
            root(&format!("{covering}/inner")),
            root(&format!("{base_str}/lib")),
            root(&format!("{base_str}/lib/other")),
            root(&format!("{base_str}/fresh")),
        ];
        let report = cache.check(&requested);

        assert_eq!(report.exact_hits, vec![root(&cached_jar)]);
        assert_eq!(
            report.covered.get(&root(&covering)),
            Some(&vec![root(&format!("{covering}/inner"))])
        );
        let lib = root(&format!("{base_str}/lib"));
        assert_eq!(
            report.partially_contained_directories.get(&lib),
            Some(&vec![root(&cached_dir)])
        );
        assert_eq!(
            report.partially_contained_files.get(&lib),
            Some(&vec![root(&cached_jar)])
        );
        assert_eq!(
            report.redundant.get(&lib),
            Some(&vec![root(&format!("{base_str}/lib/other"))])
        );
        assert_eq!(report.no_hits, vec![root(&format!("{base_str}/fresh"))]);
        assert_eq!(report.roots_to_scan(), vec![root(&format!("{base_str}/fresh")), lib.clone()]);
        assert_eq!(report.cached_inside(&lib), vec![root(&cached_dir), root(&cached_jar)]);

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn check_is_order_independent_and_prefix_safe() {
        let cache = PathCache::new();
        cache.publish(root("/a/foo"), Vec::new());

        let forward = cache.check(&[root("/a/foobar"), root("/a/foo/x"), root("/a/foobar/y")]);
        let backward = cache.check(&[root("/a/foobar/y"), root("/a/foo/x"), root("/a/foobar")]);
        assert_eq!(forward, backward);
        assert_eq!(forward.no_hits, vec![root("/a/foobar")]);
        assert_eq!(forward.covered.get(&root("/a/foo")), Some(&vec![root("/a/foo/x")]));
        assert_eq!(
            forward.redundant.get(&root("/a/foobar")),
            Some(&vec![root("/a/foobar/y")])
        );
    }
}
