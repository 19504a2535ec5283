//! Links parsed units to the supertypes found alongside them.
//!
//! A parser only knows its own file, so a superclass starts out as an
//! unresolved placeholder. Once a root is harvested its units are indexed by
//! qualified name and every placeholder that names an indexed unit is
//! replaced by that unit's own (linked) chain. Member criteria then see
//! inherited members, and `skip` / `by_scan_up_to` have real levels to act on.

use std::collections::HashMap;
use std::sync::Arc;

use crate::unit::{FoundItem, UnitDescriptor, UnitKind};

#[derive(Debug, Default)]
pub struct TypeIndex {
    units: HashMap<String, Arc<UnitDescriptor>>,
}

impl TypeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `units`; a name already present keeps its first unit.
    pub fn extend<I>(&mut self, units: I)
    where
        I: IntoIterator<Item = Arc<UnitDescriptor>>,
    {
        for unit in units {
            if unit.kind == UnitKind::Unresolved {
                continue;
            }
            self.units.entry(unit.name.clone()).or_insert(unit);
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// A supertype named `name` as seen from `package`: qualified names are
    /// looked up as they are, simple names in the referring package first.
    pub fn resolve(&self, name: &str, package: &str) -> Option<&Arc<UnitDescriptor>> {
        if !name.contains('.') && !package.is_empty() {
            if let Some(unit) = self.units.get(&format!("{package}.{name}")) {
                return Some(unit);
            }
        }
        self.units.get(name)
    }

    /// `unit` with every resolvable placeholder in its chain replaced. Cycles
    /// end at the placeholder that would close them.
    pub fn link(&self, unit: &UnitDescriptor) -> UnitDescriptor {
        self.link_chain(unit, &mut vec![unit.name.clone()])
    }

    fn link_chain(&self, unit: &UnitDescriptor, seen: &mut Vec<String>) -> UnitDescriptor {
        let mut linked = unit.clone();
        linked.superclass = unit.superclass.as_deref().map(|parent| {
            let target = match parent.kind {
                UnitKind::Unresolved => self
                    .resolve(&parent.name, &unit.package)
                    .map(Arc::as_ref)
                    .filter(|found| !seen.contains(&found.name)),
                _ => Some(parent),
            };
            match target {
                Some(target) => {
                    seen.push(target.name.clone());
                    Box::new(self.link_chain(target, seen))
                }
                None => Box::new(parent.clone()),
            }
        });
        linked
    }

    /// Links every item, keeping items whose chain did not change as they are.
    pub fn link_items(&self, items: Vec<FoundItem>) -> Vec<FoundItem> {
        items
            .into_iter()
            .map(|item| {
                let linked = self.link(&item.unit);
                if linked == *item.unit {
                    item
                } else {
                    FoundItem {
                        unit: Arc::new(linked),
                        ..item
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberCriteria;
    use crate::path::EntryKey;
    use crate::unit::{Member, MemberKind};

    fn class(name: &str, parent: &str, methods: &[&str]) -> UnitDescriptor {
        let members = methods
            .iter()
            .map(|m| Member::new(name, MemberKind::Method, *m))
            .collect();
        let mut placeholder = UnitDescriptor::unresolved(parent);
        if parent != "java.lang.Object" {
            placeholder = placeholder.with_superclass(UnitDescriptor::unresolved("java.lang.Object"));
        }
        UnitDescriptor::new(name, UnitKind::Class)
            .with_superclass(placeholder)
            .with_members(members)
    }

    fn index(units: Vec<UnitDescriptor>) -> TypeIndex {
        let mut index = TypeIndex::new();
        index.extend(units.into_iter().map(Arc::new));
        index
    }

    fn chain(unit: &UnitDescriptor) -> Vec<(String, UnitKind)> {
        unit.hierarchy().map(|u| (u.name.clone(), u.kind)).collect()
    }

    #[test]
    fn simple_names_resolve_in_own_package() {
        let base = class("demo.Base", "java.lang.Object", &["stop"]);
        let worker = class("demo.Worker", "Base", &["run"]);
        let idx = index(vec![base, worker.clone()]);

        let linked = idx.link(&worker);
        assert_eq!(
            chain(&linked),
            vec![
                ("demo.Worker".to_string(), UnitKind::Class),
                ("demo.Base".to_string(), UnitKind::Class),
                ("java.lang.Object".to_string(), UnitKind::Unresolved),
            ]
        );

        let stop = MemberCriteria::create().by_name(|n| n == "stop");
        let found = stop.find_in(&linked).unwrap();
        assert_eq!(found[0].owner, "demo.Base");
        assert!(stop.find_in(&worker).is_none());
    }

    #[test]
    fn multi_level_chains_and_unknown_parents() {
        let top = class("a.Top", "b.Missing", &[]);
        let mid = class("a.Mid", "a.Top", &[]);
        let low = class("a.Low", "Mid", &[]);
        let idx = index(vec![top, mid, low.clone()]);

        let names: Vec<String> = chain(&idx.link(&low)).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.Low", "a.Mid", "a.Top", "b.Missing", "java.lang.Object"]);
    }

    #[test]
    fn cycles_stop_at_placeholder() {
        let a = class("x.A", "x.B", &[]);
        let b = class("x.B", "x.A", &[]);
        let idx = index(vec![a.clone(), b]);

        let linked = idx.link(&a);
        let levels = chain(&linked);
        assert_eq!(levels[0].0, "x.A");
        assert_eq!(levels[1], ("x.B".to_string(), UnitKind::Class));
        assert_eq!(levels[2], ("x.A".to_string(), UnitKind::Unresolved));
    }

    #[test]
    fn unchanged_items_are_kept() {
        let lone = class("z.Lone", "z.Nowhere", &[]);
        let item = FoundItem::new(EntryKey::file("/r/z/Lone.java"), lone.clone(), b"z");
        let idx = index(vec![lone]);
        let linked = idx.link_items(vec![item.clone()]);
        assert!(Arc::ptr_eq(&linked[0].unit, &item.unit));
        assert_eq!(idx.len(), 1);
    }
}
