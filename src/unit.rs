//! Parsed structure of a compilation unit and the parser seam.
//!
//! The scanner never interprets raw bytes itself: a [`UnitParser`] turns a
//! candidate's content into a [`UnitDescriptor`], and criteria only ever see
//! descriptors. Descriptors link to their superclass, which gives criteria an
//! ancestor chain to walk.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::Result;
use crate::path::EntryKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
    /// A supertype known only by name.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Method,
    Constructor,
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Fully qualified name of the declaring unit.
    pub owner: String,
    pub kind: MemberKind,
    pub name: String,
    pub parameter_types: Vec<String>,
    /// Return type of a method, declared type of a field.
    pub value_type: Option<String>,
    pub modifiers: Vec<String>,
    pub annotations: Vec<String>,
    pub signature: String,
}

impl Member {
    pub fn new(owner: impl Into<String>, kind: MemberKind, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            owner: owner.into(),
            kind,
            signature: name.clone(),
            name,
            parameter_types: Vec::new(),
            value_type: None,
            modifiers: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn with_parameters<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_value_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = Some(value_type.into());
        self
    }

    pub fn is_annotated_with(&self, annotation: &str) -> bool {
        self.annotations.iter().any(|a| type_names_match(a, annotation))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    /// Fully qualified name.
    pub name: String,
    pub package: String,
    pub kind: UnitKind,
    pub modifiers: Vec<String>,
    pub annotations: Vec<String>,
    pub imports: Vec<String>,
    pub interfaces: Vec<String>,
    pub superclass: Option<Box<UnitDescriptor>>,
    pub members: Vec<Member>,
}

impl UnitDescriptor {
    pub fn new(name: impl Into<String>, kind: UnitKind) -> Self {
        let name = name.into();
        let package = name
            .rsplit_once('.')
            .map(|(pkg, _)| pkg.to_string())
            .unwrap_or_default();
        Self {
            name,
            package,
            kind,
            modifiers: Vec::new(),
            annotations: Vec::new(),
            imports: Vec::new(),
            interfaces: Vec::new(),
            superclass: None,
            members: Vec::new(),
        }
    }

    /// A placeholder for a supertype that was referenced but not parsed.
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self::new(name, UnitKind::Unresolved)
    }

    pub fn with_superclass(mut self, superclass: UnitDescriptor) -> Self {
        self.superclass = Some(Box::new(superclass));
        self
    }

    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Relative source path of the unit, e.g. `org/a/A.java`.
    pub fn source_path(&self, extension: &str) -> String {
        format!("{}.{extension}", self.name.replace('.', "/"))
    }

    /// The unit itself followed by its ancestors, nearest first.
    pub fn hierarchy(&self) -> Hierarchy<'_> {
        Hierarchy { next: Some(self) }
    }

    /// True when this unit, one of its ancestors, or an interface declared
    /// anywhere in the chain is named `type_name` (simple or qualified).
    pub fn is_subtype_of(&self, type_name: &str) -> bool {
        self.hierarchy().any(|level| {
            type_names_match(&level.name, type_name)
                || level.interfaces.iter().any(|i| type_names_match(i, type_name))
        })
    }

    pub fn is_annotated_with(&self, annotation: &str) -> bool {
        self.annotations.iter().any(|a| type_names_match(a, annotation))
    }
}

pub struct Hierarchy<'a> {
    next: Option<&'a UnitDescriptor>,
}

impl<'a> Iterator for Hierarchy<'a> {
    type Item = &'a UnitDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.superclass.as_deref();
        Some(current)
    }
}

/// `org.a.Foo` matches `org.a.Foo` and `Foo`; `Foo` matches `x.Foo`.
pub fn type_names_match(declared: &str, wanted: &str) -> bool {
    if declared == wanted {
        return true;
    }
    let simple = |s: &str| s.rsplit('.').next().unwrap_or(s).to_string();
    if !declared.contains('.') || !wanted.contains('.') {
        return simple(declared) == simple(wanted);
    }
    false
}

/// A unit found during a scan together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundItem {
    pub key: EntryKey,
    pub unit: Arc<UnitDescriptor>,
    pub content_hash: String,
}

impl FoundItem {
    pub fn new(key: EntryKey, unit: UnitDescriptor, content: &[u8]) -> Self {
        Self {
            key,
            unit: Arc::new(unit),
            content_hash: hash_content(content),
        }
    }

    /// Directory or archive the unit would be loaded from.
    pub fn class_path(&self) -> String {
        let extension = self
            .key
            .file_name()
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("java");
        self.key.class_path(&self.unit.source_path(extension))
    }
}

/// Turns raw candidate content into a unit descriptor.
pub trait UnitParser: Send + Sync {
    /// Whether a file or entry with this name is a candidate at all. Tested
    /// before any bytes are read.
    fn accepts(&self, file_name: &str) -> bool;

    fn parse(&self, key: &EntryKey, content: &[u8]) -> Result<UnitDescriptor>;
}

pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    hex::encode(digest)
}
