//! Per-query result accumulator.
//!
//! A context is filled concurrently by the walk's tasks and read by the
//! caller once the search has ended. Clones share the same state.

use dashmap::{DashMap, DashSet};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::debug;

use crate::criteria::{CriteriaId, UnitCriteria};
use crate::error::{EntryFailure, Result, ScanError};
use crate::member::MemberCriteria;
use crate::path::{EntryKey, ScanRoot};
use crate::tasks::panic_message;
use crate::unit::{FoundItem, Member};

type ItemMap = DashMap<EntryKey, FoundItem>;

enum SearchState {
    Idle,
    Running(JoinHandle<Result<()>>),
    Finished,
}

struct ContextInner {
    criteria: UnitCriteria,
    items_found: DashMap<ScanRoot, Arc<ItemMap>>,
    items_found_flat: ItemMap,
    members_found: DashMap<EntryKey, HashMap<CriteriaId, Vec<Member>>>,
    skipped: DashSet<EntryKey>,
    failures: Mutex<Vec<EntryFailure>>,
    search: Mutex<SearchState>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct SearchContext {
    inner: Arc<ContextInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SearchContext {
    pub fn new(criteria: UnitCriteria) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                criteria,
                items_found: DashMap::new(),
                items_found_flat: DashMap::new(),
                members_found: DashMap::new(),
                skipped: DashSet::new(),
                failures: Mutex::new(Vec::new()),
                search: Mutex::new(SearchState::Idle),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn criteria(&self) -> &UnitCriteria {
        &self.inner.criteria
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ScanError::Closed)
        } else {
            Ok(())
        }
    }

    fn root_map(&self, root: &ScanRoot) -> Arc<ItemMap> {
        let entry = self
            .inner
            .items_found
            .entry(root.clone())
            .or_insert_with(|| Arc::new(DashMap::new()));
        Arc::clone(entry.value())
    }

    pub fn add_item_found(
        &self,
        root: &ScanRoot,
        item: FoundItem,
        members: HashMap<CriteriaId, Vec<Member>>,
    ) -> Result<()> {
        self.ensure_open()?;
        if !members.is_empty() {
            self.inner.members_found.insert(item.key.clone(), members);
        }
        self.root_map(root).insert(item.key.clone(), item.clone());
        self.inner.items_found_flat.insert(item.key.clone(), item);
        Ok(())
    }

    pub fn add_all_items_found<I>(&self, root: &ScanRoot, items: I) -> Result<()>
    where
        I: IntoIterator<Item = FoundItem>,
    {
        self.ensure_open()?;
        let map = self.root_map(root);
        for item in items {
            map.insert(item.key.clone(), item.clone());
            self.inner.items_found_flat.insert(item.key.clone(), item);
        }
        Ok(())
    }

    pub fn record_failures<I>(&self, failures: I) -> Result<()>
    where
        I: IntoIterator<Item = EntryFailure>,
    {
        self.ensure_open()?;
        let mut recorded = lock(&self.inner.failures);
        for failure in failures {
            self.inner.skipped.insert(EntryKey::file(failure.key.clone()));
            recorded.push(failure);
        }
        Ok(())
    }

    /// Every found item, ordered by key.
    pub fn get_items_found(&self) -> Vec<FoundItem> {
        let mut items: Vec<FoundItem> = self
            .inner
            .items_found_flat
            .iter()
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn items_found_for(&self, root: &ScanRoot) -> HashMap<EntryKey, FoundItem> {
        self.inner
            .items_found
            .get(root)
            .map(|map| {
                map.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members matched by `criteria` during the search. When the search never
    /// evaluated `criteria` itself, every member matched by any member
    /// criteria of the query is re-tested with it.
    pub fn get_members_found_by(&self, criteria: &MemberCriteria) -> Vec<Member> {
        let mut stored = Vec::new();
        for entry in self.inner.members_found.iter() {
            if let Some(members) = entry.value().get(&criteria.id()) {
                stored.extend(members.iter().cloned());
            }
        }
        if !stored.is_empty() {
            sort_members(&mut stored);
            return stored;
        }

        let mut seen = HashSet::new();
        let mut retested = Vec::new();
        for entry in self.inner.members_found.iter() {
            for member in entry.value().values().flatten() {
                if criteria.accepts(member) && seen.insert(member.clone()) {
                    retested.push(member.clone());
                }
            }
        }
        sort_members(&mut retested);
        retested
    }

    /// Members that `criteria` accepted while matching the unit at `key`.
    pub fn members_found_for(&self, key: &EntryKey, criteria: &MemberCriteria) -> Vec<Member> {
        let mut found = self
            .inner
            .members_found
            .get(key)
            .and_then(|entry| entry.value().get(&criteria.id()).cloned())
            .unwrap_or_default();
        sort_members(&mut found);
        found
    }

    pub fn get_skipped_keys(&self) -> BTreeSet<EntryKey> {
        self.inner.skipped.iter().map(|k| k.key().clone()).collect()
    }

    pub fn get_failures(&self) -> Vec<EntryFailure> {
        lock(&self.inner.failures).clone()
    }

    /// Directories and archives holding the found units.
    pub fn get_class_paths(&self) -> BTreeSet<String> {
        self.inner
            .items_found_flat
            .iter()
            .map(|e| e.value().class_path())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.items_found_flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `task` inline when `wait` is set, otherwise on a background
    /// thread. A background outcome is collected by `wait_for_search_ending`.
    pub fn execute_search<F>(&self, wait: bool, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        let mut state = lock(&self.inner.search);
        if matches!(*state, SearchState::Running(_)) {
            return Err(ScanError::Concurrency(
                "a search is already running on this context".to_string(),
            ));
        }

        if wait {
            *state = SearchState::Finished;
            drop(state);
            return task();
        }

        let handle = std::thread::Builder::new()
            .name("unit-search".to_string())
            .spawn(task)
            .map_err(|e| ScanError::Concurrency(e.to_string()))?;
        *state = SearchState::Running(handle);
        Ok(())
    }

    /// Blocks until a background search has ended and returns its outcome.
    /// Returns `Ok` right away when the search ran inline or was already
    /// collected.
    pub fn wait_for_search_ending(&self) -> Result<()> {
        let mut state = lock(&self.inner.search);
        match std::mem::replace(&mut *state, SearchState::Finished) {
            SearchState::Running(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(payload) => Err(ScanError::Concurrency(panic_message(&payload))),
            },
            SearchState::Idle | SearchState::Finished => Ok(()),
        }
    }

    /// Clears every collection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.items_found.clear();
        self.inner.items_found_flat.clear();
        self.inner.members_found.clear();
        self.inner.skipped.clear();
        lock(&self.inner.failures).clear();
        debug!("search context closed");
    }
}

fn sort_members(members: &mut [Member]) {
    members.sort_by(|a, b| {
        (&a.owner, &a.name, &a.signature).cmp(&(&b.owner, &b.name, &b.signature))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::unit::{MemberKind, UnitDescriptor, UnitKind};

    fn item(key: &str, name: &str) -> FoundItem {
        FoundItem::new(
            EntryKey::file(key),
            UnitDescriptor::new(name, UnitKind::Class),
            name.as_bytes(),
        )
    }

    #[test]
    fn items_are_grouped_by_root_and_flattened() {
        let ctx = SearchContext::new(UnitCriteria::create());
        let r1 = ScanRoot::from_normalized("/r1");
        let r2 = ScanRoot::from_normalized("/r2");
        ctx.add_item_found(&r1, item("/r1/a/A.java", "a.A"), HashMap::new())
            .unwrap();
        ctx.add_all_items_found(&r2, vec![item("/r2/B.java", "B"), item("/r2/C.java", "C")])
            .unwrap();

        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.items_found_for(&r1).len(), 1);
        assert_eq!(ctx.items_found_for(&r2).len(), 2);
        assert!(ctx.items_found_for(&ScanRoot::from_normalized("/none")).is_empty());
        let names: Vec<String> = ctx
            .get_items_found()
            .iter()
            .map(|i| i.key.file_name().to_string())
            .collect();
        assert_eq!(names, vec!["A.java", "B.java", "C.java"]);
        assert_eq!(
            ctx.get_class_paths().into_iter().collect::<Vec<_>>(),
            vec!["/r1".to_string(), "/r2".to_string()]
        );
    }

    #[test]
    fn members_are_looked_up_by_id_with_retest_fallback() {
        let methods = MemberCriteria::create().of_kind(MemberKind::Method);
        let ctx = SearchContext::new(UnitCriteria::create().by_members(methods.clone()));
        let run = Member::new("a.A", MemberKind::Method, "run");
        let stop = Member::new("a.A", MemberKind::Method, "stop");
        let mut members = HashMap::new();
        members.insert(methods.id(), vec![run.clone(), stop.clone()]);
        ctx.add_item_found(&ScanRoot::from_normalized("/r"), item("/r/A.java", "a.A"), members)
            .unwrap();

        assert_eq!(ctx.get_members_found_by(&methods), vec![run.clone(), stop]);
        assert_eq!(ctx.get_members_found_by(&methods.create_copy()).len(), 2);
        assert_eq!(ctx.members_found_for(&EntryKey::file("/r/A.java"), &methods).len(), 2);
        assert!(ctx.members_found_for(&EntryKey::file("/r/B.java"), &methods).is_empty());

        let only_run = MemberCriteria::create().by_name(|n| n == "run");
        assert_eq!(ctx.get_members_found_by(&only_run), vec![run]);
    }

    #[test]
    fn close_clears_and_rejects_mutation() {
        let ctx = SearchContext::new(UnitCriteria::create());
        let root = ScanRoot::from_normalized("/r");
        ctx.add_item_found(&root, item("/r/A.java", "A"), HashMap::new())
            .unwrap();
        ctx.record_failures(vec![EntryFailure::new("/r/B.java", FailureKind::Parse, "bad")])
            .unwrap();
        assert_eq!(ctx.get_skipped_keys().len(), 1);

        ctx.close();
        ctx.close();
        assert!(ctx.is_closed());
        assert!(ctx.is_empty());
        assert!(ctx.get_failures().is_empty());
        assert!(ctx.get_skipped_keys().is_empty());
        assert!(matches!(
            ctx.add_item_found(&root, item("/r/A.java", "A"), HashMap::new()),
            Err(ScanError::Closed)
        ));
        assert!(matches!(ctx.execute_search(true, || Ok(())), Err(ScanError::Closed)));
    }

    #[test]
    fn background_search_is_joined() {
        let ctx = SearchContext::new(UnitCriteria::create());
        let writer = ctx.clone();
        ctx.execute_search(false, move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            writer.add_item_found(
                &ScanRoot::from_normalized("/r"),
                item("/r/A.java", "A"),
                HashMap::new(),
            )
        })
        .unwrap();

        ctx.wait_for_search_ending().unwrap();
        assert_eq!(ctx.len(), 1);
        ctx.wait_for_search_ending().unwrap();
    }

    #[test]
    fn background_failures_surface_on_wait() {
        let ctx = SearchContext::new(UnitCriteria::create());
        ctx.execute_search(false, || Err(ScanError::config_error("nope")))
            .unwrap();
        assert!(matches!(ctx.wait_for_search_ending(), Err(ScanError::Config(_))));

        let panicking = SearchContext::new(UnitCriteria::create());
        panicking.execute_search(false, || panic!("lost")).unwrap();
        assert!(matches!(
            panicking.wait_for_search_ending(),
            Err(ScanError::Concurrency(ref m)) if m.contains("lost")
        ));
    }

    #[test]
    fn inline_search_returns_outcome_directly() {
        let ctx = SearchContext::new(UnitCriteria::create());
        assert!(ctx.execute_search(true, || Err(ScanError::Closed)).is_err());
        ctx.wait_for_search_ending().unwrap();
    }
}
