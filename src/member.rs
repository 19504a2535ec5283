//! Member criteria: predicates over methods, constructors and fields that are
//! searched across a unit's ancestor chain.
//!
//! The search starts at the unit itself and walks up its superclasses.
//! `skip` leaves one level out, `by_scan_up_to` ends the walk after the first
//! level that satisfies it, and `result` gets the last word on the collected
//! members (by default: at least one).

use std::sync::Arc;

use crate::criteria::{Chain, CriteriaId, Evaluation, Leaf};
use crate::error::BoxError;
use crate::unit::{Member, MemberKind, UnitDescriptor, type_names_match};

/// `(initial unit, examined ancestor level)`.
pub type LevelPredicate = Arc<dyn Fn(&UnitDescriptor, &UnitDescriptor) -> bool + Send + Sync>;
pub type AggregatePredicate = Arc<dyn Fn(&[Member]) -> bool + Send + Sync>;

#[derive(Clone)]
enum MemberTerm {
    Leaf(Leaf<Member>),
    Nested(Box<MemberCriteria>),
}

#[derive(Clone)]
pub struct MemberCriteria {
    id: CriteriaId,
    chain: Chain<MemberTerm>,
    skip: Option<LevelPredicate>,
    scan_up_to: Option<LevelPredicate>,
    result: Option<AggregatePredicate>,
}

impl Default for MemberCriteria {
    fn default() -> Self {
        Self::create()
    }
}

impl std::fmt::Debug for MemberCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberCriteria")
            .field("id", &self.id)
            .field("branches", &self.chain.groups.len())
            .field("skip", &self.skip.is_some())
            .field("scan_up_to", &self.scan_up_to.is_some())
            .field("result", &self.result.is_some())
            .finish()
    }
}

impl MemberCriteria {
    pub fn create() -> Self {
        Self {
            id: CriteriaId::next(),
            chain: Chain::default(),
            skip: None,
            scan_up_to: None,
            result: None,
        }
    }

    pub fn id(&self) -> CriteriaId {
        self.id
    }

    pub fn create_copy(&self) -> Self {
        self.clone()
    }

    pub fn has_no_predicate(&self) -> bool {
        self.chain.is_empty()
            && self.skip.is_none()
            && self.scan_up_to.is_none()
            && self.result.is_none()
    }

    pub fn all_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Member) -> bool + Send + Sync + 'static,
    {
        self.chain.push(MemberTerm::Leaf(Leaf::infallible("all_that", predicate)));
        self
    }

    pub fn try_all_that<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Member) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.chain.push(MemberTerm::Leaf(Leaf::fallible("try_all_that", predicate)));
        self
    }

    pub fn by_name<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.chain.push(MemberTerm::Leaf(Leaf::infallible(
            "by_name",
            move |member: &Member| predicate(&member.name),
        )));
        self
    }

    /// Called with the parameter type list and the index of each parameter;
    /// matches when it accepts any of them. Never called for members without
    /// parameters.
    pub fn by_parameter_type<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[String], usize) -> bool + Send + Sync + 'static,
    {
        self.chain.push(MemberTerm::Leaf(Leaf::infallible(
            "by_parameter_type",
            move |member: &Member| {
                (0..member.parameter_types.len()).any(|i| predicate(&member.parameter_types, i))
            },
        )));
        self
    }

    pub fn of_kind(mut self, kind: MemberKind) -> Self {
        self.chain.push(MemberTerm::Leaf(Leaf::infallible(
            format!("of_kind({kind:?})"),
            move |member: &Member| member.kind == kind,
        )));
        self
    }

    pub fn annotated_with(mut self, annotation: impl Into<String>) -> Self {
        let annotation = annotation.into();
        self.chain.push(MemberTerm::Leaf(Leaf::infallible(
            format!("annotated_with({annotation})"),
            move |member: &Member| member.is_annotated_with(&annotation),
        )));
        self
    }

    pub fn and(self) -> Self {
        self
    }

    pub fn or(mut self) -> Self {
        self.chain.or();
        self
    }

    /// AND-s the member expression of `other`; its level and aggregate
    /// predicates are ignored.
    pub fn and_criteria(mut self, other: MemberCriteria) -> Self {
        self.chain.push(MemberTerm::Nested(Box::new(other)));
        self
    }

    /// OR-s the member expression of `other`; its level and aggregate
    /// predicates are ignored.
    pub fn or_criteria(mut self, other: MemberCriteria) -> Self {
        self.chain.or();
        self.chain.push(MemberTerm::Nested(Box::new(other)));
        self
    }

    pub fn skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UnitDescriptor, &UnitDescriptor) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    pub fn by_scan_up_to<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UnitDescriptor, &UnitDescriptor) -> bool + Send + Sync + 'static,
    {
        self.scan_up_to = Some(Arc::new(predicate));
        self
    }

    pub fn result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[Member]) -> bool + Send + Sync + 'static,
    {
        self.result = Some(Arc::new(predicate));
        self
    }

    /// Tests a single member against the member expression alone.
    pub fn accepts(&self, member: &Member) -> bool {
        self.evaluate(member, &mut Evaluation::default())
    }

    /// Members of `unit` and its ancestors accepted by this criteria, or
    /// `None` when the aggregate rejects the collection.
    pub fn find_in(&self, unit: &UnitDescriptor) -> Option<Vec<Member>> {
        self.search(unit, &mut Evaluation::default())
    }

    pub(crate) fn search(&self, unit: &UnitDescriptor, eval: &mut Evaluation) -> Option<Vec<Member>> {
        let mut found = Vec::new();
        for level in unit.hierarchy() {
            let skipped = self.skip.as_ref().is_some_and(|skip| skip(unit, level));
            if !skipped {
                for member in &level.members {
                    if self.evaluate(member, eval) {
                        found.push(member.clone());
                    }
                }
            }
            if self.scan_up_to.as_ref().is_some_and(|limit| limit(unit, level)) {
                break;
            }
        }

        let accepted = match &self.result {
            Some(result) => result(&found),
            None => !found.is_empty(),
        };
        accepted.then_some(found)
    }

    fn evaluate(&self, member: &Member, eval: &mut Evaluation) -> bool {
        if self.chain.is_empty() {
            return true;
        }
        self.chain.groups.iter().any(|group| {
            group.iter().all(|term| match term {
                MemberTerm::Leaf(leaf) => leaf.test(member, eval),
                MemberTerm::Nested(nested) => nested.evaluate(member, eval),
            })
        })
    }
}

/// Level predicate matching the ancestor named `type_name`.
pub fn level_named(type_name: &str) -> impl Fn(&UnitDescriptor, &UnitDescriptor) -> bool + use<> {
    let type_name = type_name.to_string();
    move |_initial: &UnitDescriptor, examined: &UnitDescriptor| {
        type_names_match(&examined.name, &type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::UnitCriteria;
    use crate::unit::UnitKind;

    fn method(owner: &str, name: &str, params: &[&str]) -> Member {
        Member::new(owner, MemberKind::Method, name).with_parameters(params.iter().copied())
    }

    /// Impl -> Base -> java.lang.Object, each declaring methods.
    fn hierarchy() -> UnitDescriptor {
        let object = UnitDescriptor::new("java.lang.Object", UnitKind::Class).with_members(vec![
            method("java.lang.Object", "toString", &[]),
            method("java.lang.Object", "equals", &["Object"]),
        ]);
        let base = UnitDescriptor::new("org.a.Base", UnitKind::Class)
            .with_superclass(object)
            .with_members(vec![
                method("org.a.Base", "run", &[]),
                method("org.a.Base", "apply", &["String", "int"]),
            ]);
        UnitDescriptor::new("org.a.Impl", UnitKind::Class)
            .with_superclass(base)
            .with_members(vec![
                method("org.a.Impl", "run", &[]),
                Member::new("org.a.Impl", MemberKind::Field, "count").with_value_type("int"),
            ])
    }

    fn names(members: &[Member]) -> Vec<String> {
        members
            .iter()
            .map(|m| format!("{}.{}", m.owner.rsplit('.').next().unwrap(), m.name))
            .collect()
    }

    #[test]
    fn searches_whole_hierarchy_by_default() {
        let found = MemberCriteria::create()
            .of_kind(MemberKind::Method)
            .find_in(&hierarchy())
            .unwrap();
        assert_eq!(
            names(&found),
            vec!["Impl.run", "Base.run", "Base.apply", "Object.toString", "Object.equals"]
        );
    }

    #[test]
    fn skip_excludes_one_level_and_keeps_walking() {
        let found = MemberCriteria::create()
            .of_kind(MemberKind::Method)
            .skip(level_named("org.a.Base"))
            .find_in(&hierarchy())
            .unwrap();
        assert_eq!(names(&found), vec!["Impl.run", "Object.toString", "Object.equals"]);
    }

    #[test]
    fn scan_limit_examines_limiting_level_then_stops() {
        let found = MemberCriteria::create()
            .of_kind(MemberKind::Method)
            .by_scan_up_to(level_named("org.a.Base"))
            .find_in(&hierarchy())
            .unwrap();
        assert_eq!(names(&found), vec!["Impl.run", "Base.run", "Base.apply"]);

        // stopping at the unit itself leaves only its own members
        let own = MemberCriteria::create()
            .by_scan_up_to(|initial, examined| initial.name == examined.name)
            .find_in(&hierarchy())
            .unwrap();
        assert_eq!(names(&own), vec!["Impl.run", "Impl.count"]);
    }

    #[test]
    fn aggregate_can_reject_collection() {
        let at_least_three = MemberCriteria::create()
            .by_name(|n| n == "run")
            .result(|found| found.len() >= 3);
        assert!(at_least_three.find_in(&hierarchy()).is_none());

        let criteria = UnitCriteria::create().by_members(at_least_three);
        let result = criteria.test(&hierarchy());
        assert!(!result.matched);
        assert_eq!(result.rejected_by.as_deref(), Some("by_members"));

        let none_wanted = MemberCriteria::create()
            .by_name(|n| n == "missing")
            .result(|found| found.is_empty());
        assert_eq!(none_wanted.find_in(&hierarchy()), Some(Vec::new()));
    }

    #[test]
    fn parameter_type_predicate_sees_every_position() {
        let found = MemberCriteria::create()
            .by_parameter_type(|types, i| i == 1 && types[i] == "int")
            .find_in(&hierarchy())
            .unwrap();
        assert_eq!(names(&found), vec!["Base.apply"]);
    }

    #[test]
    fn or_and_nested_member_expressions() {
        let fields = MemberCriteria::create().of_kind(MemberKind::Field);
        let criteria = MemberCriteria::create()
            .by_name(|n| n == "equals")
            .or_criteria(fields);
        let found = criteria.find_in(&hierarchy()).unwrap();
        assert_eq!(names(&found), vec!["Impl.count", "Object.equals"]);

        let chained = MemberCriteria::create()
            .of_kind(MemberKind::Method)
            .and()
            .by_name(|n| n.starts_with("to"))
            .or()
            .by_name(|n| n == "count");
        assert!(chained.accepts(&method("x.X", "toString", &[])));
        assert!(chained.accepts(&Member::new("x.X", MemberKind::Field, "count")));
        assert!(!chained.accepts(&method("x.X", "run", &[])));
    }

    #[test]
    fn empty_member_criteria() {
        let empty = MemberCriteria::create();
        assert!(empty.has_no_predicate());
        assert!(!empty.clone().skip(|_, _| false).has_no_predicate());
        assert_eq!(empty.find_in(&hierarchy()).unwrap().len(), 6);
    }
}
