//! Depth-first traversal of directories and (nested) archives.
//!
//! Every directory, archive and nested archive is one branch on the walk's
//! [`TaskManager`]. Inside one archive entries are visited in the archive's
//! own order; across branches there is no ordering at all.

use ignore::WalkBuilder;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use zip::ZipArchive;

use crate::error::{EntryFailure, FailureKind, Result, ScanError};
use crate::path::{EntryKey, ScanRoot, clean};
use crate::tasks::TaskManager;

pub const DEFAULT_ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar", "war", "ear", "jmod"];

/// What a callback wants the walker to do with the rest of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    StopIteration,
}

/// Where a candidate's bytes live. Nothing is read until [`ByteSource::open`].
#[derive(Debug, Clone)]
pub enum ByteSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ByteSource {
    pub fn open(&self) -> Result<SourceBytes> {
        match self {
            Self::File(path) => {
                let file = File::open(path)
                    .map_err(|e| ScanError::io(path.to_string_lossy(), e))?;
                let len = file
                    .metadata()
                    .map_err(|e| ScanError::io(path.to_string_lossy(), e))?
                    .len();
                if len == 0 {
                    return Ok(SourceBytes::Owned(Arc::from(Vec::new())));
                }
                let mmap = unsafe {
                    Mmap::map(&file).map_err(|e| ScanError::io(path.to_string_lossy(), e))?
                };
                Ok(SourceBytes::Mapped(mmap))
            }
            Self::Memory(bytes) => Ok(SourceBytes::Owned(Arc::clone(bytes))),
        }
    }
}

pub enum SourceBytes {
    Mapped(Mmap),
    Owned(Arc<[u8]>),
}

impl Deref for SourceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => &mmap[..],
            Self::Owned(bytes) => bytes,
        }
    }
}

/// One discovered leaf: a plain file or an entry of an archive.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub root: ScanRoot,
    pub key: EntryKey,
    pub source: ByteSource,
}

pub type PathPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type CandidateTest = Arc<dyn Fn(&EntryKey) -> bool + Send + Sync>;
pub type CandidateAction = Arc<dyn Fn(&CandidateEntry) -> Result<Directive> + Send + Sync>;
pub type RootHook = Arc<dyn Fn(&RootReport) + Send + Sync>;

#[derive(Clone)]
struct Handler {
    test: CandidateTest,
    apply: CandidateAction,
}

#[derive(Clone)]
pub struct WalkConfig {
    roots: Vec<ScanRoot>,
    recursive: bool,
    descend_into_directory: PathPredicate,
    open_archive: PathPredicate,
    descend_into_entry: PathPredicate,
    on_file: Option<Handler>,
    on_archive_entry: Option<Handler>,
    after_root: Option<RootHook>,
    max_parallel: usize,
}

impl WalkConfig {
    pub fn for_roots(roots: impl IntoIterator<Item = ScanRoot>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            recursive: true,
            descend_into_directory: Arc::new(|_| true),
            open_archive: archive_extension_predicate(DEFAULT_ARCHIVE_EXTENSIONS),
            descend_into_entry: Arc::new(|_| true),
            on_file: None,
            on_archive_entry: None,
            after_root: None,
            max_parallel: default_parallelism(),
        }
    }

    pub fn roots(&self) -> &[ScanRoot] {
        &self.roots
    }

    pub fn descend_into_directories_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.descend_into_directory = Arc::new(predicate);
        self
    }

    /// Visits only the direct children of root directories.
    pub fn scan_strictly_roots(mut self) -> Self {
        self.recursive = false;
        self
    }

    pub fn open_archives_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.open_archive = Arc::new(predicate);
        self
    }

    /// Decides whether an archive found inside another archive is opened.
    pub fn descend_into_entries_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.descend_into_entry = Arc::new(predicate);
        self
    }

    pub fn on_file_that<T, A>(mut self, test: T, apply: A) -> Self
    where
        T: Fn(&EntryKey) -> bool + Send + Sync + 'static,
        A: Fn(&CandidateEntry) -> Result<Directive> + Send + Sync + 'static,
    {
        self.on_file = Some(Handler {
            test: Arc::new(test),
            apply: Arc::new(apply),
        });
        self
    }

    pub fn on_archive_entry_that<T, A>(mut self, test: T, apply: A) -> Self
    where
        T: Fn(&EntryKey) -> bool + Send + Sync + 'static,
        A: Fn(&CandidateEntry) -> Result<Directive> + Send + Sync + 'static,
    {
        self.on_archive_entry = Some(Handler {
            test: Arc::new(test),
            apply: Arc::new(apply),
        });
        self
    }

    pub fn after_root<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RootReport) + Send + Sync + 'static,
    {
        self.after_root = Some(Arc::new(hook));
        self
    }

    pub fn max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Matches keys whose last extension is one of `extensions`, ignoring case.
pub fn archive_extension_predicate(extensions: &[&str]) -> PathPredicate {
    let extensions: Vec<String> = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
    Arc::new(move |key: &str| has_extension(key, &extensions))
}

pub(crate) fn has_extension(key: &str, extensions: &[String]) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

#[derive(Debug)]
pub enum RootOutcome {
    /// Every entry of the root was visited.
    Completed,
    /// A callback asked to stop; some entries were skipped.
    Stopped,
    /// A directory, archive or entry below the root could not be read. What
    /// was readable has been visited.
    Incomplete,
    Failed(ScanError),
}

#[derive(Debug)]
pub struct RootReport {
    pub root: ScanRoot,
    pub outcome: RootOutcome,
    pub entries_visited: usize,
    pub failures: Vec<EntryFailure>,
}

impl RootReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RootOutcome::Completed)
    }
}

#[derive(Debug, Default)]
pub struct WalkReport {
    pub roots: Vec<RootReport>,
}

impl WalkReport {
    pub fn entries_visited(&self) -> usize {
        self.roots.iter().map(|r| r.entries_visited).sum()
    }
}

pub struct ContainerWalker {
    config: Arc<WalkConfig>,
}

impl ContainerWalker {
    pub fn new(config: WalkConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Walks every root in order. Roots never abort each other: a failed root
    /// is reported and the next one is walked.
    pub fn walk(&self) -> WalkReport {
        let mut report = WalkReport::default();
        let manager = TaskManager::new(self.config.max_parallel);

        for root in &self.config.roots {
            let root_report = match &manager {
                Ok(manager) => self.walk_root(manager, root),
                Err(e) => RootReport {
                    root: root.clone(),
                    outcome: RootOutcome::Failed(ScanError::Concurrency(e.to_string())),
                    entries_visited: 0,
                    failures: Vec::new(),
                },
            };
            debug!(
                root = %root,
                visited = root_report.entries_visited,
                failures = root_report.failures.len(),
                outcome = ?root_report.outcome,
                "root walked"
            );
            if let Some(hook) = &self.config.after_root {
                hook(&root_report);
            }
            report.roots.push(root_report);
        }

        report
    }

    fn walk_root(&self, manager: &TaskManager, root: &ScanRoot) -> RootReport {
        let branch = Arc::new(Branch {
            config: Arc::clone(&self.config),
            root: root.clone(),
            manager: manager.clone(),
            visited: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            incomplete: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        });

        let started = start_root(&branch);
        let waited = manager.wait_for_completion();

        let outcome = match started.and(waited) {
            Err(e) => RootOutcome::Failed(e),
            Ok(()) if branch.stopped.load(Ordering::SeqCst) => RootOutcome::Stopped,
            Ok(()) if branch.incomplete.load(Ordering::SeqCst) => RootOutcome::Incomplete,
            Ok(()) => RootOutcome::Completed,
        };

        let failures = std::mem::take(
            &mut *branch
                .failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        RootReport {
            root: root.clone(),
            outcome,
            entries_visited: branch.visited.load(Ordering::SeqCst),
            failures,
        }
    }
}

/// State shared by every branch of one root.
struct Branch {
    config: Arc<WalkConfig>,
    root: ScanRoot,
    manager: TaskManager,
    visited: AtomicUsize,
    stopped: AtomicBool,
    incomplete: AtomicBool,
    failures: Mutex<Vec<EntryFailure>>,
}

impl Branch {
    /// Unreadable content leaves the root incomplete; content that was read
    /// but rejected by a callback does not.
    fn record(&self, key: &str, error: &ScanError) {
        debug!(key, error = %error, "entry failed");
        if error.failure_kind() == FailureKind::Io {
            self.incomplete.store(true, Ordering::SeqCst);
        }
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(EntryFailure::new(key, error.failure_kind(), error));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Runs a candidate through `handler`. Only candidates that pass the test
    /// count as visited.
    fn visit(&self, handler: &Handler, candidate: CandidateEntry) -> Directive {
        self.visited.fetch_add(1, Ordering::SeqCst);
        match (handler.apply)(&candidate) {
            Ok(Directive::StopIteration) => {
                self.stop();
                Directive::StopIteration
            }
            Ok(Directive::Continue) => Directive::Continue,
            Err(e) => {
                self.record(candidate.key.as_str(), &e);
                Directive::Continue
            }
        }
    }
}

fn start_root(branch: &Arc<Branch>) -> Result<()> {
    let path = branch.root.as_path().to_path_buf();
    let metadata = fs::metadata(&path).map_err(|e| ScanError::io(branch.root.as_str(), e))?;

    if metadata.is_dir() {
        let task = Arc::clone(branch);
        branch
            .manager
            .submit(move || visit_directory(&task, path, true));
        return Ok(());
    }

    let key = branch.root.as_str().to_string();
    if (branch.config.open_archive)(&key) {
        let task = Arc::clone(branch);
        branch
            .manager
            .submit(move || visit_archive_file(&task, path, key, true));
    } else {
        let task = Arc::clone(branch);
        branch.manager.submit(move || {
            visit_file(&task, path, key);
            Ok(())
        });
    }
    Ok(())
}

/// Lists one directory level; subdirectories become tasks of their own.
fn visit_directory(branch: &Arc<Branch>, dir: PathBuf, is_root: bool) -> Result<()> {
    let dir_key = clean(&dir.to_string_lossy());
    let listing = WalkBuilder::new(&dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .follow_links(false)
        .build();

    let mut listed = false;
    for entry in listing {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let error = ScanError::io(&dir_key, std::io::Error::other(e));
                if is_root && !listed {
                    return Err(error);
                }
                branch.record(&dir_key, &error);
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        listed = true;
        let path = entry.path().to_path_buf();
        let key = clean(&path.to_string_lossy());

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        // Symlinked directories are not followed; symlinked files are.
        let is_dir = file_type.is_dir();
        if !is_dir && file_type.is_symlink() && fs::metadata(&path).is_ok_and(|m| m.is_dir()) {
            continue;
        }

        if is_dir {
            if !branch.config.recursive || !(branch.config.descend_into_directory)(&key) {
                continue;
            }
            let task = Arc::clone(branch);
            branch
                .manager
                .submit(move || visit_directory(&task, path, false));
        } else if (branch.config.open_archive)(&key) {
            let task = Arc::clone(branch);
            branch
                .manager
                .submit(move || visit_archive_file(&task, path, key, false));
        } else if visit_file(branch, path, key) == Directive::StopIteration {
            break;
        }
    }

    Ok(())
}

fn visit_file(branch: &Branch, path: PathBuf, key: String) -> Directive {
    let Some(handler) = &branch.config.on_file else {
        return Directive::Continue;
    };
    let key = EntryKey::file(key);
    if !(handler.test)(&key) {
        return Directive::Continue;
    }
    let candidate = CandidateEntry {
        root: branch.root.clone(),
        key,
        source: ByteSource::File(path),
    };
    branch.visit(handler, candidate)
}

fn visit_archive_file(branch: &Arc<Branch>, path: PathBuf, key: String, is_root: bool) -> Result<()> {
    match open_archive(&path, &key) {
        Ok(mmap) => match ZipArchive::new(Cursor::new(&mmap[..])) {
            Ok(mut archive) => {
                iterate_archive(branch, &mut archive, &key);
                Ok(())
            }
            Err(e) => fail_archive(branch, &key, ScanError::archive(&key, e), is_root),
        },
        Err(error) => fail_archive(branch, &key, error, is_root),
    }
}

fn open_archive(path: &Path, key: &str) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| ScanError::io(key, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| ScanError::io(key, e))? };
    Ok(mmap)
}

fn fail_archive(branch: &Branch, key: &str, error: ScanError, is_root: bool) -> Result<()> {
    if is_root {
        return Err(error);
    }
    branch.record(key, &error);
    Ok(())
}

fn visit_nested_archive(branch: &Arc<Branch>, key: EntryKey, bytes: Arc<[u8]>) -> Result<()> {
    match ZipArchive::new(Cursor::new(&bytes[..])) {
        Ok(mut archive) => iterate_archive(branch, &mut archive, key.as_str()),
        Err(e) => branch.record(key.as_str(), &ScanError::archive(key.as_str(), e)),
    }
    Ok(())
}

fn iterate_archive<R: Read + Seek>(branch: &Arc<Branch>, archive: &mut ZipArchive<R>, container: &str) {
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                let key = format!("{container}!/#{i}");
                branch.record(&key, &ScanError::archive(&key, e));
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let key = EntryKey::entry(container, entry.name());

        if (branch.config.open_archive)(key.as_str())
            && (branch.config.descend_into_entry)(key.as_str())
        {
            match read_entry(&mut entry, &key) {
                Ok(bytes) => {
                    let task = Arc::clone(branch);
                    branch
                        .manager
                        .submit(move || visit_nested_archive(&task, key, bytes));
                }
                Err(e) => branch.record(key.as_str(), &e),
            }
            continue;
        }

        let Some(handler) = &branch.config.on_archive_entry else {
            continue;
        };
        if !(handler.test)(&key) {
            continue;
        }
        let bytes = match read_entry(&mut entry, &key) {
            Ok(bytes) => bytes,
            Err(e) => {
                branch.record(key.as_str(), &e);
                continue;
            }
        };
        let candidate = CandidateEntry {
            root: branch.root.clone(),
            key,
            source: ByteSource::Memory(bytes),
        };
        if branch.visit(handler, candidate) == Directive::StopIteration {
            break;
        }
    }
}

fn read_entry(entry: &mut impl Read, key: &EntryKey) -> Result<Arc<[u8]>> {
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|e| ScanError::io(key.as_str(), e))?;
    Ok(Arc::from(buf))
}
