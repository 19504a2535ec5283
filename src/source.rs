//! Java source parsing with tree-sitter.
//!
//! Only the first top-level type declaration of a file becomes a unit.
//! Supertype names are qualified through the file's imports when possible and
//! enter the ancestor chain as unresolved placeholders, which the scanner
//! later links to harvested units. Every class without an explicit `extends`
//! gets `java.lang.Object` as its root.

use tree_sitter::{Node, Parser};

use crate::error::{Result, ScanError};
use crate::path::EntryKey;
use crate::unit::{Member, MemberKind, UnitDescriptor, UnitKind, UnitParser};

#[derive(Debug, Clone)]
pub struct JavaSourceParser {
    extensions: Vec<String>,
}

impl Default for JavaSourceParser {
    fn default() -> Self {
        Self {
            extensions: vec!["java".to_string()],
        }
    }
}

impl JavaSourceParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnitParser for JavaSourceParser {
    fn accepts(&self, file_name: &str) -> bool {
        file_name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.iter().any(|e| e == ext))
    }

    fn parse(&self, key: &EntryKey, content: &[u8]) -> Result<UnitDescriptor> {
        let source =
            std::str::from_utf8(content).map_err(|e| ScanError::parse(key.as_str(), e))?;
        parse_unit(source)
            .ok_or_else(|| ScanError::parse(key.as_str(), "no type declaration found"))
    }
}

pub fn parse_unit(source: &str) -> Option<UnitDescriptor> {
    if source.trim().is_empty() {
        return None;
    }

    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_java::LANGUAGE.into())
        .ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let mut package = String::new();
    let mut imports = Vec::new();
    let mut declaration = None;

    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        match child.kind() {
            "package_declaration" => {
                package = extract_package(&child, bytes);
            }
            "import_declaration" => {
                if let Some(imp) = extract_import(&child, bytes) {
                    imports.push(imp);
                }
            }
            "class_declaration"
            | "interface_declaration"
            | "enum_declaration"
            | "record_declaration"
            | "annotation_type_declaration" => {
                if declaration.is_none() {
                    declaration = Some(child);
                }
            }
            _ => {}
        }
    }

    let decl = declaration?;
    let kind = match decl.kind() {
        "interface_declaration" => UnitKind::Interface,
        "enum_declaration" => UnitKind::Enum,
        "record_declaration" => UnitKind::Record,
        "annotation_type_declaration" => UnitKind::Annotation,
        _ => UnitKind::Class,
    };
    let simple_name = node_text(&decl.child_by_field_name("name")?, bytes).to_string();
    let name = if package.is_empty() {
        simple_name
    } else {
        format!("{package}.{simple_name}")
    };

    let mut unit = UnitDescriptor::new(name, kind);
    unit.package = package;
    let (modifiers, annotations) = extract_modifiers(&decl, bytes);
    unit.modifiers = modifiers;
    unit.annotations = annotations;

    let mut superclass = None;
    let mut cursor = decl.walk();
    for child in decl.children(&mut cursor) {
        match child.kind() {
            "superclass" => {
                if let Some(ty) = child.named_child(0) {
                    superclass = Some(resolve_type(node_text(&ty, bytes), &imports));
                }
            }
            "super_interfaces" | "extends_interfaces" => {
                unit.interfaces.extend(
                    extract_type_list(&child, bytes)
                        .iter()
                        .map(|t| resolve_type(t, &imports)),
                );
            }
            _ => {}
        }
    }
    let root_type = match kind {
        UnitKind::Class => Some(superclass.unwrap_or_else(|| "java.lang.Object".to_string())),
        UnitKind::Enum => Some("java.lang.Enum".to_string()),
        UnitKind::Record => Some("java.lang.Record".to_string()),
        _ => None,
    };
    if let Some(parent) = root_type {
        unit.superclass = Some(Box::new(supertype_chain(parent)));
    }

    unit.members = extract_members(&decl, bytes, &unit.name);
    unit.imports = imports;
    Some(unit)
}

fn supertype_chain(name: String) -> UnitDescriptor {
    let placeholder = UnitDescriptor::unresolved(name.clone());
    if name == "java.lang.Object" {
        placeholder
    } else {
        placeholder.with_superclass(UnitDescriptor::unresolved("java.lang.Object"))
    }
}

fn resolve_type(raw: &str, imports: &[String]) -> String {
    let name = strip_generics(raw);
    if name.contains('.') {
        return name;
    }
    let suffix = format!(".{name}");
    imports
        .iter()
        .find(|imp| imp.ends_with(&suffix))
        .cloned()
        .unwrap_or(name)
}

fn strip_generics(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    compact.split('<').next().unwrap_or(&compact).to_string()
}

fn extract_package(node: &Node, source: &[u8]) -> String {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "scoped_identifier" || child.kind() == "identifier" {
            return node_text(&child, source).to_string();
        }
    }
    String::new()
}

fn extract_import(node: &Node, source: &[u8]) -> Option<String> {
    let mut path = String::new();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "static" => {}
            "scoped_identifier" | "identifier" | "asterisk" => {
                path = node_text(&child, source).to_string();
            }
            _ => {}
        }
    }

    if path.is_empty() { None } else { Some(path) }
}

fn extract_type_list(node: &Node, source: &[u8]) -> Vec<String> {
    let mut types = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "type_list" {
            let mut inner = child.walk();
            for ty in child.named_children(&mut inner) {
                types.push(node_text(&ty, source).to_string());
            }
        }
    }
    types
}

/// Keyword modifiers and annotation names of a declaration.
fn extract_modifiers(node: &Node, source: &[u8]) -> (Vec<String>, Vec<String>) {
    let mut modifiers = Vec::new();
    let mut annotations = Vec::new();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() != "modifiers" {
            continue;
        }
        let mut inner = child.walk();
        for m in child.children(&mut inner) {
            match m.kind() {
                "marker_annotation" | "annotation" => {
                    if let Some(name) = m.child_by_field_name("name") {
                        annotations.push(node_text(&name, source).to_string());
                    }
                }
                _ => modifiers.push(node_text(&m, source).to_string()),
            }
        }
    }

    (modifiers, annotations)
}

fn extract_members(node: &Node, source: &[u8], owner: &str) -> Vec<Member> {
    let mut members = Vec::new();
    let Some(body) = find_body(node) else {
        return members;
    };

    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if child.kind() == "enum_body_declarations" {
            let mut inner_cursor = child.walk();
            for inner in child.children(&mut inner_cursor) {
                collect_member(&inner, source, owner, &mut members);
            }
        } else {
            collect_member(&child, source, owner, &mut members);
        }
    }
    members
}

fn collect_member(node: &Node, source: &[u8], owner: &str, members: &mut Vec<Member>) {
    match node.kind() {
        "method_declaration" | "constructor_declaration" | "annotation_type_element_declaration" => {
            let Some(name) = node.child_by_field_name("name") else {
                return;
            };
            let kind = if node.kind() == "constructor_declaration" {
                MemberKind::Constructor
            } else {
                MemberKind::Method
            };
            let mut member = Member::new(owner, kind, node_text(&name, source));
            if let Some(params) = node.child_by_field_name("parameters") {
                member.parameter_types = extract_parameter_types(&params, source);
            }
            if let Some(ty) = node.child_by_field_name("type") {
                member.value_type = Some(normalize_whitespace(node_text(&ty, source)));
            }
            let (modifiers, annotations) = extract_modifiers(node, source);
            member.modifiers = modifiers;
            member.annotations = annotations;
            if let Some(sig) = extract_method_signature(node, source) {
                member.signature = sig;
            }
            members.push(member);
        }
        "field_declaration" | "constant_declaration" => {
            let value_type = node
                .child_by_field_name("type")
                .map(|ty| normalize_whitespace(node_text(&ty, source)));
            let (modifiers, annotations) = extract_modifiers(node, source);
            let signature = normalize_whitespace(node_text(node, source));

            let mut cursor = node.walk();
            for declarator in node.children(&mut cursor) {
                if declarator.kind() != "variable_declarator" {
                    continue;
                }
                let Some(name) = declarator.child_by_field_name("name") else {
                    continue;
                };
                let mut member = Member::new(owner, MemberKind::Field, node_text(&name, source));
                member.value_type = value_type.clone();
                member.modifiers = modifiers.clone();
                member.annotations = annotations.clone();
                member.signature = signature.clone();
                members.push(member);
            }
        }
        "enum_constant" => {
            if let Some(name) = node.child_by_field_name("name") {
                let mut member = Member::new(owner, MemberKind::Field, node_text(&name, source));
                member.value_type = Some(owner.to_string());
                member.modifiers = vec!["public".into(), "static".into(), "final".into()];
                members.push(member);
            }
        }
        _ => {}
    }
}

fn extract_parameter_types(params: &Node, source: &[u8]) -> Vec<String> {
    let mut types = Vec::new();
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        match param.kind() {
            "formal_parameter" => {
                if let Some(ty) = param.child_by_field_name("type") {
                    types.push(normalize_whitespace(node_text(&ty, source)));
                }
            }
            "spread_parameter" => {
                let mut inner = param.walk();
                let ty = param
                    .named_children(&mut inner)
                    .find(|n| n.kind() != "modifiers" && n.kind() != "variable_declarator");
                if let Some(ty) = ty {
                    types.push(format!("{}...", normalize_whitespace(node_text(&ty, source))));
                }
            }
            _ => {}
        }
    }
    types
}

fn find_body<'a>(node: &Node<'a>) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "class_body" | "interface_body" | "enum_body" | "annotation_type_body" => {
                return Some(child);
            }
            _ => {}
        }
    }
    None
}

fn extract_method_signature(node: &Node, source: &[u8]) -> Option<String> {
    let mut result = String::new();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "block" | "constructor_body" => break,
            ";" => continue,
            _ => {
                let text = node_text(&child, source);
                if !result.is_empty() && !needs_no_leading_space(child.kind()) {
                    result.push(' ');
                }
                result.push_str(text);
            }
        }
    }

    let sig = normalize_whitespace(&result);
    if sig.is_empty() { None } else { Some(sig) }
}

fn node_text<'a>(node: &Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn needs_no_leading_space(kind: &str) -> bool {
    matches!(kind, "type_parameters" | "formal_parameters" | "type_arguments")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_class_with_hierarchy_and_members() {
        let source = r#"
package org.example;

import java.util.List;
import org.base.Bar;

@Entity
public class Foo extends Bar implements java.io.Closeable, Comparable<Foo> {
    private String name;
    private int count, total;

    public Foo(String name) {
        this.name = name;
    }

    @Override
    public void close() {}

    public void setItems(List<String> items, int limit) {
    }
}
"#;
        let unit = parse_unit(source).unwrap();
        assert_eq!(unit.name, "org.example.Foo");
        assert_eq!(unit.package, "org.example");
        assert_eq!(unit.kind, UnitKind::Class);
        assert_eq!(unit.annotations, vec!["Entity"]);
        assert!(unit.modifiers.contains(&"public".to_string()));
        assert_eq!(unit.imports, vec!["java.util.List", "org.base.Bar"]);
        assert_eq!(unit.interfaces, vec!["java.io.Closeable", "Comparable"]);

        let chain: Vec<&str> = unit.hierarchy().map(|u| u.name.as_str()).collect();
        assert_eq!(chain, vec!["org.example.Foo", "org.base.Bar", "java.lang.Object"]);

        let fields: Vec<&str> = unit
            .members
            .iter()
            .filter(|m| m.kind == MemberKind::Field)
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(fields, vec!["name", "count", "total"]);

        let ctor = unit
            .members
            .iter()
            .find(|m| m.kind == MemberKind::Constructor)
            .unwrap();
        assert_eq!(ctor.parameter_types, vec!["String"]);
        assert!(ctor.signature.contains("public Foo(String name)"));

        let close = unit.members.iter().find(|m| m.name == "close").unwrap();
        assert_eq!(close.annotations, vec!["Override"]);
        assert_eq!(close.value_type.as_deref(), Some("void"));

        let set_items = unit.members.iter().find(|m| m.name == "setItems").unwrap();
        assert_eq!(set_items.parameter_types, vec!["List<String>", "int"]);
    }

    #[test]
    fn parse_interface_has_no_superclass() {
        let source = r#"
package org.example;

public interface Service<T> extends Repository<T> {
    T find(String id);
    void save(T entity);
}
"#;
        let unit = parse_unit(source).unwrap();
        assert_eq!(unit.kind, UnitKind::Interface);
        assert!(unit.superclass.is_none());
        assert_eq!(unit.interfaces, vec!["Repository"]);
        assert_eq!(unit.members.len(), 2);
        assert_eq!(unit.members[0].name, "find");
    }

    #[test]
    fn parse_enum() {
        let source = r#"
package org.example;

public enum Color {
    RED,
    GREEN;

    private int value;

    public int getValue() {
        return value;
    }
}
"#;
        let unit = parse_unit(source).unwrap();
        assert_eq!(unit.kind, UnitKind::Enum);
        assert!(unit.is_subtype_of("java.lang.Enum"));
        assert!(unit.members.iter().any(|m| m.name == "RED"));
        assert!(unit.members.iter().any(|m| m.name == "value"));
        assert!(unit.members.iter().any(|m| m.name == "getValue"));
    }

    #[test]
    fn parser_rejects_non_java_content() {
        let parser = JavaSourceParser::new();
        assert!(parser.accepts("A.java"));
        assert!(!parser.accepts("A.class"));
        let key = EntryKey::file("/x/readme.java");
        assert!(parser.parse(&key, b"just some words").is_err());
        assert!(parser.parse(&key, &[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn parse_empty_source_returns_none() {
        assert!(parse_unit("").is_none());
    }
}
