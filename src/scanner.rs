//! Query façade: reconciles requested roots with the path cache, walks only
//! what is missing and feeds every query its own [`SearchContext`].
//!
//! Cache publication is all-or-nothing per root. A root's harvest (every
//! unit parsed below it, matching or not) is published only when its walk
//! completed; stopped or failed roots leave the cache untouched.

use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{ContainmentReport, PathCache};
use crate::config::ScannerSettings;
use crate::context::SearchContext;
use crate::criteria::UnitCriteria;
use crate::error::{EntryFailure, FailureKind, Result, ScanError};
use crate::hierarchy::TypeIndex;
use crate::path::{ScanRoot, is_within};
use crate::snapshot::Snapshot;
use crate::unit::{FoundItem, UnitParser};
use crate::walker::{
    CandidateEntry, ContainerWalker, Directive, RootOutcome, RootReport, WalkConfig, has_extension,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Idle,
    Scanning,
    /// The last query was served from the cache alone.
    Cached,
    /// The last query walked roots that partially overlapped the cache.
    Partial,
    Completed,
    Closed,
}

#[derive(Clone)]
pub struct SearchConfig {
    paths: Vec<PathBuf>,
    criteria: UnitCriteria,
    max_parallel: Option<usize>,
    wait: bool,
    stop_at_first_match: bool,
}

impl SearchConfig {
    pub fn for_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            paths: paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
            criteria: UnitCriteria::create(),
            max_parallel: None,
            wait: true,
            stop_at_first_match: false,
        }
    }

    pub fn add_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.paths
            .extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    pub fn by(mut self, criteria: UnitCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn max_parallel_tasks_per_root(mut self, max: usize) -> Self {
        self.max_parallel = Some(max.max(1));
        self
    }

    /// When false, `find_by` returns at once and the walk runs in the
    /// background until `SearchContext::wait_for_search_ending`.
    pub fn wait_for_search_ending(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Skips the rest of an archive after its first match. Roots walked this
    /// way are never cached.
    pub fn stop_at_first_match_per_container(mut self, stop: bool) -> Self {
        self.stop_at_first_match = stop;
        self
    }
}

type SharedErrors = Arc<Mutex<Vec<ScanError>>>;

struct Query {
    roots: Vec<ScanRoot>,
    criteria: UnitCriteria,
    max_parallel: usize,
    stop_at_first_match: bool,
}

struct ScannerCore {
    cache: PathCache,
    parser: Arc<dyn UnitParser>,
    settings: ScannerSettings,
    state: Mutex<ScannerState>,
    load_lock: Mutex<()>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct UnitScanner {
    core: Arc<ScannerCore>,
}

impl UnitScanner {
    pub fn new(parser: Arc<dyn UnitParser>, settings: ScannerSettings) -> Self {
        Self {
            core: Arc::new(ScannerCore {
                cache: PathCache::new(),
                parser,
                settings,
                state: Mutex::new(ScannerState::Idle),
                load_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ScannerState {
        *lock(&self.core.state)
    }

    pub fn cache(&self) -> &PathCache {
        &self.core.cache
    }

    pub fn settings(&self) -> &ScannerSettings {
        &self.core.settings
    }

    fn ensure_open(&self) -> Result<()> {
        self.core.ensure_open()
    }

    pub fn find_by(&self, config: SearchConfig) -> Result<SearchContext> {
        self.ensure_open()?;
        let roots = config
            .paths
            .iter()
            .map(|p| ScanRoot::new(p))
            .collect::<Result<Vec<_>>>()?;

        let context = SearchContext::new(config.criteria.create_copy());
        let query = Query {
            roots,
            criteria: config.criteria,
            max_parallel: config
                .max_parallel
                .unwrap_or(self.core.settings.max_parallel_tasks),
            stop_at_first_match: config.stop_at_first_match,
        };

        let core = Arc::clone(&self.core);
        let sink = context.clone();
        context.execute_search(config.wait, move || core.run(query, &sink))?;
        Ok(context)
    }

    /// Scans `paths` into the cache without keeping any query results.
    pub fn load_cache<I, P>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let context = self.find_by(SearchConfig::for_paths(paths))?;
        let loaded = context.len();
        context.close();
        Ok(loaded)
    }

    pub fn save_snapshot(&self, db_path: impl Into<PathBuf>) -> Result<usize> {
        self.ensure_open()?;
        Snapshot::open(db_path)?.save(&self.core.cache)
    }

    pub fn load_snapshot(&self, db_path: impl Into<PathBuf>) -> Result<usize> {
        self.ensure_open()?;
        let _guard = lock(&self.core.load_lock);
        Snapshot::open(db_path)?.load_into(&self.core.cache)
    }

    /// Drops the cache. Every later operation fails with `Closed`, and a
    /// query still running in the background publishes nothing more.
    pub fn close(&self) {
        let mut state = lock(&self.core.state);
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.cache.clear();
        *state = ScannerState::Closed;
        debug!("scanner closed");
    }
}

impl ScannerCore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ScanError::Closed)
        } else {
            Ok(())
        }
    }

    /// Publishes under the state lock so that `close` cannot interleave.
    fn publish(&self, root: ScanRoot, items: Vec<FoundItem>) -> Result<()> {
        let _state = lock(&self.state);
        self.ensure_open()?;
        self.cache.publish(root, items);
        Ok(())
    }

    fn set_state(&self, state: ScannerState) {
        let mut current = lock(&self.state);
        if *current != ScannerState::Closed {
            *current = state;
        }
    }

    fn run(self: &Arc<Self>, query: Query, ctx: &SearchContext) -> Result<()> {
        self.set_state(ScannerState::Scanning);
        let errors: SharedErrors = Arc::new(Mutex::new(Vec::new()));

        let (hits, missing): (Vec<ScanRoot>, Vec<ScanRoot>) = query
            .roots
            .iter()
            .cloned()
            .partition(|root| self.cache.contains(root));
        for root in &hits {
            if let Some(items) = self.cache.get(root) {
                serve(ctx, root, items, &query.criteria, &errors)?;
            }
        }

        let mut final_state = ScannerState::Cached;
        if !missing.is_empty() {
            let _guard = lock(&self.load_lock);

            // another query may have published while we waited for the lock
            let mut residual = Vec::new();
            for root in missing {
                match self.cache.get(&root) {
                    Some(items) => serve(ctx, &root, items, &query.criteria, &errors)?,
                    None => residual.push(root),
                }
            }

            let report = self.cache.check(&residual);
            for (cached_root, inner_roots) in &report.covered {
                for inner in inner_roots {
                    let items = self.cache.items_within(cached_root, inner.as_str());
                    debug!(root = %inner, cached = %cached_root, items = items.len(), "served from covering root");
                    self.publish(inner.clone(), items.clone())?;
                    serve(ctx, inner, items, &query.criteria, &errors)?;
                }
            }

            let to_scan = report.roots_to_scan();
            if !to_scan.is_empty() {
                let partial = !report.partially_contained_directories.is_empty()
                    || !report.partially_contained_files.is_empty();
                final_state = if partial {
                    ScannerState::Partial
                } else {
                    ScannerState::Completed
                };
                self.scan(&query, to_scan, Arc::new(report), ctx, &errors)?;
            }
        }

        // closing mid-query voids whatever the walk produced
        self.ensure_open()?;
        let errors = std::mem::take(&mut *lock(&errors));
        self.set_state(final_state);
        info!(
            roots = query.roots.len(),
            found = ctx.len(),
            errors = errors.len(),
            "query finished"
        );
        match ScanError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn scan(
        self: &Arc<Self>,
        query: &Query,
        roots: Vec<ScanRoot>,
        report: Arc<ContainmentReport>,
        ctx: &SearchContext,
        errors: &SharedErrors,
    ) -> Result<()> {
        let excluded: Arc<Vec<String>> = Arc::new(
            roots
                .iter()
                .flat_map(|r| report.cached_inside(r))
                .map(|r| r.as_str().to_string())
                .collect(),
        );
        let harvest: Arc<DashMap<ScanRoot, Vec<FoundItem>>> = Arc::new(DashMap::new());
        let handler = Arc::new(CandidateHandler {
            parser: Arc::clone(&self.parser),
            criteria: query.criteria.clone(),
            ctx: ctx.clone(),
            harvest: Arc::clone(&harvest),
            errors: Arc::clone(errors),
            stop_at_first_match: query.stop_at_first_match,
        });

        let mut walk = WalkConfig::for_roots(roots).max_parallel_tasks(query.max_parallel);
        if self.settings.scan_strictly {
            walk = walk.scan_strictly_roots();
        }

        let dir_excluded = Arc::clone(&excluded);
        let archive_excluded = Arc::clone(&excluded);
        let file_excluded = Arc::clone(&excluded);
        let extensions = self.settings.archive_extensions.clone();
        let file_parser = Arc::clone(&self.parser);
        let entry_parser = Arc::clone(&self.parser);
        let file_handler = Arc::clone(&handler);
        let entry_handler = Arc::clone(&handler);

        let publisher = RootPublisher {
            core: Arc::clone(self),
            criteria: query.criteria.clone(),
            ctx: ctx.clone(),
            harvest,
            report,
            errors: Arc::clone(errors),
            stop_at_first_match: query.stop_at_first_match,
        };

        let walk = walk
            .descend_into_directories_that(move |dir| !is_excluded(dir, &dir_excluded))
            .open_archives_that(move |key| {
                has_extension(key, &extensions) && !is_excluded(key, &archive_excluded)
            })
            .on_file_that(
                move |key| {
                    file_parser.accepts(key.file_name()) && !is_excluded(key.as_str(), &file_excluded)
                },
                move |candidate| file_handler.handle(candidate),
            )
            .on_archive_entry_that(
                move |key| entry_parser.accepts(key.file_name()),
                move |candidate| entry_handler.handle(candidate),
            )
            .after_root(move |root_report| publisher.finish_root(root_report));

        let walk_report = ContainerWalker::new(walk).walk();
        debug!(visited = walk_report.entries_visited(), "walk finished");

        for root_report in walk_report.roots {
            if !root_report.failures.is_empty() {
                warn!(
                    root = %root_report.root,
                    skipped = root_report.failures.len(),
                    "entries skipped"
                );
                ctx.record_failures(root_report.failures)?;
            }
            match root_report.outcome {
                RootOutcome::Failed(e) => {
                    warn!(root = %root_report.root, error = %e, "root aborted, not cached");
                    lock(errors).push(ScanError::root_aborted(root_report.root.as_str(), e));
                }
                RootOutcome::Incomplete => {
                    warn!(root = %root_report.root, "containers unreadable, root not cached");
                }
                RootOutcome::Completed | RootOutcome::Stopped => {}
            }
        }
        Ok(())
    }
}

fn is_excluded(key: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|cached| is_within(key, cached))
}

/// Tests cached items against the query.
fn serve(
    ctx: &SearchContext,
    root: &ScanRoot,
    items: Vec<FoundItem>,
    criteria: &UnitCriteria,
    errors: &SharedErrors,
) -> Result<()> {
    if criteria.has_no_predicate() {
        return ctx.add_all_items_found(root, items);
    }
    for item in items {
        offer(ctx, root, item, criteria, errors)?;
    }
    Ok(())
}

/// Adds `item` to the context when it matches. Returns whether it did.
fn offer(
    ctx: &SearchContext,
    root: &ScanRoot,
    item: FoundItem,
    criteria: &UnitCriteria,
    errors: &SharedErrors,
) -> Result<bool> {
    let result = criteria.test(&item.unit);
    if let Some(e) = result.evaluation_error(&item.key) {
        ctx.record_failures([EntryFailure::new(
            item.key.as_str(),
            FailureKind::Criterion,
            &e,
        )])?;
        lock(errors).push(e);
    }
    if !result.matched {
        return Ok(false);
    }
    ctx.add_item_found(root, item, result.matched_members)?;
    Ok(true)
}

struct CandidateHandler {
    parser: Arc<dyn UnitParser>,
    criteria: UnitCriteria,
    ctx: SearchContext,
    harvest: Arc<DashMap<ScanRoot, Vec<FoundItem>>>,
    errors: SharedErrors,
    stop_at_first_match: bool,
}

impl CandidateHandler {
    /// Harvests the candidate. Criteria run once the root is linked, except
    /// when a match has to stop the container right away.
    fn handle(&self, candidate: &CandidateEntry) -> Result<Directive> {
        let bytes = candidate.source.open()?;
        let unit = self.parser.parse(&candidate.key, &bytes)?;
        let item = FoundItem::new(candidate.key.clone(), unit, &bytes);
        self.harvest
            .entry(candidate.root.clone())
            .or_default()
            .push(item.clone());

        if !self.stop_at_first_match {
            return Ok(Directive::Continue);
        }
        let matched = offer(&self.ctx, &candidate.root, item, &self.criteria, &self.errors)?;
        if matched && candidate.key.container().is_some() {
            return Ok(Directive::StopIteration);
        }
        Ok(Directive::Continue)
    }
}

/// Runs once per walked root: reuses cached sub-roots, links supertypes,
/// tests the harvest, publishes complete roots and derives the results of
/// redundant inner roots.
struct RootPublisher {
    core: Arc<ScannerCore>,
    criteria: UnitCriteria,
    ctx: SearchContext,
    harvest: Arc<DashMap<ScanRoot, Vec<FoundItem>>>,
    report: Arc<ContainmentReport>,
    errors: SharedErrors,
    stop_at_first_match: bool,
}

impl RootPublisher {
    fn finish_root(&self, root_report: &RootReport) {
        if let Err(e) = self.try_finish_root(root_report) {
            lock(&self.errors).push(e);
        }
    }

    fn try_finish_root(&self, root_report: &RootReport) -> Result<()> {
        let root = &root_report.root;
        let fresh = self
            .harvest
            .remove(root)
            .map(|(_, items)| items)
            .unwrap_or_default();

        let reused: Vec<FoundItem> = self
            .report
            .cached_inside(root)
            .iter()
            .filter_map(|cached| self.core.cache.get(cached))
            .flatten()
            .collect();
        debug!(root = %root, fresh = fresh.len(), reused = reused.len(), "root harvested");

        let fresh_count = fresh.len();
        let mut all = fresh;
        all.extend(reused);
        let mut index = TypeIndex::new();
        index.extend(all.iter().map(|item| Arc::clone(&item.unit)));
        index.extend(self.core.cache.units());
        let all = index.link_items(all);

        // fresh units were already tested while the walk could still stop
        let untested = if self.stop_at_first_match {
            &all[fresh_count..]
        } else {
            &all[..]
        };
        serve(&self.ctx, root, untested.to_vec(), &self.criteria, &self.errors)?;

        let redundant = self.report.redundant.get(root).cloned().unwrap_or_default();
        if root_report.is_completed() {
            let inner_items: Vec<(ScanRoot, Vec<FoundItem>)> = redundant
                .iter()
                .map(|inner| {
                    let items = all
                        .iter()
                        .filter(|item| item.key.is_within(inner.as_str()))
                        .cloned()
                        .collect();
                    (inner.clone(), items)
                })
                .collect();
            self.core.publish(root.clone(), all)?;
            for (inner, items) in inner_items {
                self.core.publish(inner, items)?;
            }
        }

        let found = self.ctx.items_found_for(root);
        for inner in &redundant {
            let derived: Vec<FoundItem> = found
                .values()
                .filter(|item| item.key.is_within(inner.as_str()))
                .cloned()
                .collect();
            self.ctx.add_all_items_found(inner, derived)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::EntryKey;
    use crate::unit::{UnitDescriptor, UnitKind};
    use std::fs;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        p.push(format!(
            "unit-hunter-scanner-{}-{}-{}",
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

    /// `.u` files hold a unit name on the first line; `!` makes them unparseable.
    #[derive(Default)]
    struct LineParser {
        parsed: AtomicUsize,
    }

    impl UnitParser for LineParser {
        fn accepts(&self, file_name: &str) -> bool {
            file_name.ends_with(".u")
        }

        fn parse(&self, key: &EntryKey, content: &[u8]) -> Result<UnitDescriptor> {
            self.parsed.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8_lossy(content);
            let name = text.lines().next().unwrap_or("").trim();
            if name.is_empty() || name.starts_with('!') {
                return Err(ScanError::parse(key.as_str(), "bad unit"));
            }
            Ok(UnitDescriptor::new(name, UnitKind::Class))
        }
    }

    fn scanner() -> (UnitScanner, Arc<LineParser>) {
        let parser = Arc::new(LineParser::default());
        let scanner = UnitScanner::new(
            parser.clone(),
            ScannerSettings::default().with_max_parallel_tasks(2),
        );
        (scanner, parser)
    }

    #[test]
    fn second_query_is_served_from_cache() {
        let dir = temp_dir();
        fs::write(dir.join("A.u"), "a.A").unwrap();
        fs::write(dir.join("B.u"), "!broken").unwrap();
        let (scanner, parser) = scanner();

        let first = scanner.find_by(SearchConfig::for_paths([&dir])).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.get_skipped_keys().len(), 1);
        assert_eq!(scanner.state(), ScannerState::Completed);
        assert_eq!(parser.parsed.load(Ordering::SeqCst), 2);

        let second = scanner.find_by(SearchConfig::for_paths([&dir])).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(scanner.state(), ScannerState::Cached);
        assert_eq!(parser.parsed.load(Ordering::SeqCst), 2);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn closed_scanner_rejects_queries() {
        let dir = temp_dir();
        let (scanner, _) = scanner();
        scanner.close();
        scanner.close();
        assert_eq!(scanner.state(), ScannerState::Closed);
        assert!(matches!(
            scanner.find_by(SearchConfig::for_paths([&dir])),
            Err(ScanError::Closed)
        ));
        assert!(matches!(scanner.load_cache([&dir]), Err(ScanError::Closed)));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn criterion_failures_surface_as_query_errors() {
        let dir = temp_dir();
        fs::write(dir.join("A.u"), "a.A").unwrap();
        let (scanner, _) = scanner();

        let criteria = UnitCriteria::create().try_all_that(|_| Err("unavailable".into()));
        let err = scanner
            .find_by(SearchConfig::for_paths([&dir]).by(criteria))
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::CriterionEvaluation { .. }));
        // the harvest is still cached: the walk itself completed
        assert_eq!(scanner.cache().item_count(), 1);

        fs::remove_dir_all(&dir).ok();
    }
}
