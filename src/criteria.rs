//! Composable unit predicates.
//!
//! A criteria object is a boolean expression built left to right. `and()`
//! binds tighter than `or()`: `a.and().b.or().c` means `(a && b) || c`, and an
//! AND chain stops at its first false term. Evaluators are shared immutable
//! closures; every bit of evaluation state lives in the [`Evaluation`] of a
//! single `test` call, so one criteria value can be tested from many threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{BoxError, ScanError};
use crate::member::MemberCriteria;
use crate::path::EntryKey;
use crate::unit::{Member, UnitDescriptor};

pub type Predicate<T> = Arc<dyn Fn(&T) -> Result<bool, BoxError> + Send + Sync>;

/// Identity of a criteria value. Copies keep the identity of their source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CriteriaId(u64);

impl CriteriaId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct Leaf<T> {
    pub(crate) label: String,
    pub(crate) predicate: Predicate<T>,
}

impl<T> Clone for Leaf<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<T: 'static> Leaf<T> {
    pub(crate) fn infallible<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(move |value: &T| -> Result<bool, BoxError> { Ok(predicate(value)) }),
        }
    }

    pub(crate) fn fallible<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub(crate) fn test(&self, value: &T, eval: &mut Evaluation) -> bool {
        eval.attempted += 1;
        match (self.predicate)(value) {
            Ok(true) => true,
            Ok(false) => {
                eval.rejected_by = Some(self.label.clone());
                false
            }
            Err(e) => {
                debug!(predicate = %self.label, error = %e, "predicate failed");
                eval.failed += 1;
                eval.failures.push(format!("{}: {e}", self.label));
                eval.rejected_by = Some(self.label.clone());
                false
            }
        }
    }
}

/// OR of AND chains, in the order they were written.
pub(crate) struct Chain<T> {
    pub(crate) groups: Vec<Vec<T>>,
    pending_or: bool,
}

impl<T: Clone> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
            pending_or: self.pending_or,
        }
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            pending_or: false,
        }
    }
}

impl<T> Chain<T> {
    pub(crate) fn push(&mut self, term: T) {
        if self.pending_or || self.groups.is_empty() {
            self.groups.push(Vec::new());
            self.pending_or = false;
        }
        if let Some(group) = self.groups.last_mut() {
            group.push(term);
        }
    }

    pub(crate) fn or(&mut self) {
        if !self.groups.is_empty() {
            self.pending_or = true;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

pub(crate) type MemberMap = HashMap<CriteriaId, Vec<Member>>;

/// Mutable state of one evaluation.
#[derive(Debug, Default)]
pub(crate) struct Evaluation {
    pub(crate) attempted: usize,
    pub(crate) failed: usize,
    pub(crate) failures: Vec<String>,
    pub(crate) rejected_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub matched: bool,
    /// Members accepted by each member criteria of the matching branch.
    pub matched_members: HashMap<CriteriaId, Vec<Member>>,
    /// Label of the last predicate that returned false. Diagnostic only.
    pub rejected_by: Option<String>,
    /// Errors returned by fallible predicates; each counted as false.
    pub failures: Vec<String>,
    all_failed: bool,
}

impl TestResult {
    /// The item could not be evaluated at all: every predicate attempted for
    /// it returned an error.
    pub fn evaluation_error(&self, key: &EntryKey) -> Option<ScanError> {
        self.all_failed.then(|| ScanError::CriterionEvaluation {
            key: key.to_string(),
            failures: self.failures.clone(),
        })
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.matched_members.values().flatten()
    }
}

#[derive(Clone)]
enum UnitTerm {
    Leaf(Leaf<UnitDescriptor>),
    Members(MemberCriteria),
    Nested(Box<UnitCriteria>),
}

#[derive(Clone)]
pub struct UnitCriteria {
    id: CriteriaId,
    chain: Chain<UnitTerm>,
}

impl Default for UnitCriteria {
    fn default() -> Self {
        Self::create()
    }
}

impl std::fmt::Debug for UnitCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitCriteria")
            .field("id", &self.id)
            .field("branches", &self.chain.groups.len())
            .finish()
    }
}

impl UnitCriteria {
    pub fn create() -> Self {
        Self {
            id: CriteriaId::next(),
            chain: Chain::default(),
        }
    }

    pub fn id(&self) -> CriteriaId {
        self.id
    }

    /// An independent copy with the same identity.
    pub fn create_copy(&self) -> Self {
        self.clone()
    }

    /// True for the empty expression, which matches everything.
    pub fn has_no_predicate(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn all_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UnitDescriptor) -> bool + Send + Sync + 'static,
    {
        self.chain.push(UnitTerm::Leaf(Leaf::infallible("all_that", predicate)));
        self
    }

    pub fn try_all_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UnitDescriptor) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.chain.push(UnitTerm::Leaf(Leaf::fallible("try_all_that", predicate)));
        self
    }

    pub fn by_name<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.chain.push(UnitTerm::Leaf(Leaf::infallible(
            "by_name",
            move |unit: &UnitDescriptor| predicate(&unit.name),
        )));
        self
    }

    pub fn subtype_of(mut self, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        self.chain.push(UnitTerm::Leaf(Leaf::infallible(
            format!("subtype_of({type_name})"),
            move |unit: &UnitDescriptor| unit.is_subtype_of(&type_name),
        )));
        self
    }

    pub fn annotated_with(mut self, annotation: impl Into<String>) -> Self {
        let annotation = annotation.into();
        self.chain.push(UnitTerm::Leaf(Leaf::infallible(
            format!("annotated_with({annotation})"),
            move |unit: &UnitDescriptor| unit.is_annotated_with(&annotation),
        )));
        self
    }

    pub fn in_package(mut self, package: impl Into<String>) -> Self {
        let package = package.into();
        self.chain.push(UnitTerm::Leaf(Leaf::infallible(
            format!("in_package({package})"),
            move |unit: &UnitDescriptor| {
                unit.package == package || unit.package.starts_with(&format!("{package}."))
            },
        )));
        self
    }

    pub fn by_members(mut self, criteria: MemberCriteria) -> Self {
        self.chain.push(UnitTerm::Members(criteria));
        self
    }

    /// No-op connector; terms are AND-ed unless `or()` is called.
    pub fn and(self) -> Self {
        self
    }

    pub fn or(mut self) -> Self {
        self.chain.or();
        self
    }

    pub fn and_criteria(mut self, other: UnitCriteria) -> Self {
        self.chain.push(UnitTerm::Nested(Box::new(other)));
        self
    }

    pub fn or_criteria(mut self, other: UnitCriteria) -> Self {
        self.chain.or();
        self.chain.push(UnitTerm::Nested(Box::new(other)));
        self
    }

    /// Member criteria reachable from this expression, nested ones included.
    pub fn member_criteria(&self) -> Vec<&MemberCriteria> {
        let mut found = Vec::new();
        for term in self.chain.groups.iter().flatten() {
            match term {
                UnitTerm::Members(mc) => found.push(mc),
                UnitTerm::Nested(nested) => found.extend(nested.member_criteria()),
                UnitTerm::Leaf(_) => {}
            }
        }
        found
    }

    pub fn test(&self, unit: &UnitDescriptor) -> TestResult {
        let mut eval = Evaluation::default();
        let mut members = MemberMap::new();
        let matched = self.evaluate(unit, &mut eval, &mut members);
        TestResult {
            matched,
            matched_members: if matched { members } else { HashMap::new() },
            rejected_by: if matched { None } else { eval.rejected_by },
            all_failed: eval.failed > 0 && eval.failed == eval.attempted,
            failures: eval.failures,
        }
    }

    fn evaluate(&self, unit: &UnitDescriptor, eval: &mut Evaluation, accepted: &mut MemberMap) -> bool {
        if self.chain.is_empty() {
            return true;
        }
        for group in &self.chain.groups {
            let mut branch = MemberMap::new();
            let ok = group
                .iter()
                .all(|term| evaluate_term(term, unit, eval, &mut branch));
            if ok {
                for (id, members) in branch {
                    accepted.entry(id).or_default().extend(members);
                }
                return true;
            }
        }
        false
    }
}

fn evaluate_term(
    term: &UnitTerm,
    unit: &UnitDescriptor,
    eval: &mut Evaluation,
    accepted: &mut MemberMap,
) -> bool {
    match term {
        UnitTerm::Leaf(leaf) => leaf.test(unit, eval),
        UnitTerm::Nested(nested) => nested.evaluate(unit, eval, accepted),
        UnitTerm::Members(mc) => match mc.search(unit, eval) {
            Some(members) => {
                accepted.entry(mc.id()).or_default().extend(members);
                true
            }
            None => {
                eval.rejected_by = Some("by_members".to_string());
                false
            }
        },
    }
}
