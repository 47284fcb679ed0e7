//! CSDL (`$metadata`) parser.
//!
//! Turns an `edmx:Edmx` document into a [`Model`]. Element and attribute names are matched on
//! their local name so that every published CSDL namespace URI is accepted.

use crate::error::ParseError;
use crate::model::{
    ActionImport, ComplexType, EntityContainer, EntitySet, EntityType, EnumMember, EnumType,
    FunctionImport, Model, NavigationProperty, NavigationPropertyBinding, OnDeleteAction,
    Property, ReferentialConstraint, Singleton, TypeDefinition,
};
use roxmltree::{Document, Node};
use std::collections::HashMap;

const CORE_NAMESPACE: &str = "Org.OData.Core.V1";

/// Parse a metadata document from raw bytes (UTF-8, optional BOM).
///
/// # Errors
///
/// Returns [`ParseError::Encoding`] for non-UTF-8 input, otherwise see [`parse_metadata`].
pub fn parse_metadata_bytes(bytes: &[u8]) -> Result<Model, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)?;
    parse_metadata(text)
}

/// Parse a metadata document.
///
/// # Errors
///
/// Returns [`ParseError::Xml`] for ill-formed markup (before any structural check runs), and a
/// structural [`ParseError`] for missing required attributes, invalid attribute values,
/// duplicate declarations, unknown key properties or inheritance cycles.
pub fn parse_metadata(text: &str) -> Result<Model, ParseError> {
    let doc = Document::parse(text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "Edmx" {
        return Err(ParseError::MissingRoot("Edmx envelope"));
    }

    let mut parser = CsdlParser {
        model: Model {
            version: root.attribute("Version").unwrap_or("4.0").to_string(),
            ..Model::default()
        },
        term_aliases: HashMap::new(),
        pending_annotations: Vec::new(),
    };

    for reference in elements(root, "Reference") {
        for include in elements(reference, "Include") {
            if let (Some(ns), Some(alias)) = (include.attribute("Namespace"), include.attribute("Alias"))
            {
                parser
                    .term_aliases
                    .insert(alias.to_string(), ns.to_string());
            }
        }
    }

    let schemas: Vec<Node<'_, '_>> = elements(root, "DataServices")
        .flat_map(|ds| elements(ds, "Schema"))
        .collect();
    if schemas.is_empty() {
        return Err(ParseError::MissingRoot("Schema element"));
    }

    // Aliases first: a schema may reference types of a later schema through its alias.
    for schema in &schemas {
        let ns = required(*schema, "Namespace", "DataServices")?;
        parser.model.namespaces.insert(ns.to_string());
        if let Some(alias) = schema.attribute("Alias") {
            parser
                .model
                .aliases
                .insert(alias.to_string(), ns.to_string());
        }
    }

    for schema in schemas {
        parser.parse_schema(schema)?;
    }

    parser.apply_pending_annotations();

    let mut model = parser.model;
    model.check_inheritance()?;
    model.resolve_keys()?;

    tracing::debug!(
        version = %model.version,
        entity_types = model.entity_types.len(),
        complex_types = model.complex_types.len(),
        containers = model.containers.len(),
        "parsed metadata document"
    );

    Ok(model)
}

struct CsdlParser {
    model: Model,
    /// `edmx:Include` alias -> vocabulary namespace.
    term_aliases: HashMap<String, String>,
    /// Out-of-line `<Annotations Target=...>` blocks, applied once all types are known.
    pending_annotations: Vec<(String, Annotated)>,
}

#[derive(Debug, Default, Clone)]
struct Annotated {
    computed: bool,
    immutable: bool,
    description: Option<String>,
}

impl CsdlParser {
    fn parse_schema(&mut self, schema: Node<'_, '_>) -> Result<(), ParseError> {
        let ns = required(schema, "Namespace", "DataServices")?.to_string();

        for child in schema.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "EntityType" => {
                    let et = self.parse_entity_type(child, &ns)?;
                    let full = et.full_name();
                    if self.model.entity_types.contains_key(&full) {
                        return Err(ParseError::DuplicateName {
                            kind: "entity type",
                            name: full,
                        });
                    }
                    self.model.entity_types.insert(full, et);
                }
                "ComplexType" => {
                    let ct = self.parse_complex_type(child, &ns)?;
                    let full = ct.full_name();
                    if self.model.complex_types.contains_key(&full) {
                        return Err(ParseError::DuplicateName {
                            kind: "complex type",
                            name: full,
                        });
                    }
                    self.model.complex_types.insert(full, ct);
                }
                "EnumType" => {
                    let en = parse_enum_type(child, &ns)?;
                    self.model
                        .enum_types
                        .insert(format!("{ns}.{}", en.name), en);
                }
                "TypeDefinition" => {
                    let name = required(child, "Name", &format!("Schema '{ns}'"))?;
                    let underlying = required(child, "UnderlyingType", &describe(child, name))?;
                    self.model.type_definitions.insert(
                        format!("{ns}.{name}"),
                        TypeDefinition {
                            name: name.to_string(),
                            namespace: ns.clone(),
                            underlying_type: underlying.to_string(),
                        },
                    );
                }
                "EntityContainer" => {
                    let container = self.parse_container(child, &ns)?;
                    let full = format!("{ns}.{}", container.name);
                    if self.model.containers.contains_key(&full) {
                        return Err(ParseError::DuplicateName {
                            kind: "entity container",
                            name: full,
                        });
                    }
                    self.model.containers.insert(full, container);
                }
                "Annotations" => {
                    let target = required(child, "Target", &format!("Schema '{ns}'"))?;
                    let annotated = self.read_annotations(child);
                    self.pending_annotations
                        .push((target.to_string(), annotated));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_entity_type(&self, node: Node<'_, '_>, ns: &str) -> Result<EntityType, ParseError> {
        let name = required(node, "Name", &format!("Schema '{ns}'"))?;
        let ctx = describe(node, name);

        let mut et = EntityType {
            name: name.to_string(),
            namespace: ns.to_string(),
            base_type: node.attribute("BaseType").map(str::to_string),
            is_abstract: bool_attr(node, "Abstract", false)?,
            open_type: bool_attr(node, "OpenType", false)?,
            has_stream: bool_attr(node, "HasStream", false)?,
            description: self.read_annotations(node).description,
            ..EntityType::default()
        };

        // <Key> may come before or after the properties it names; flags are set later by
        // `Model::resolve_keys`.
        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "Key" => {
                    for pref in elements(child, "PropertyRef") {
                        et.key.push(required(pref, "Name", &ctx)?.to_string());
                    }
                }
                "Property" => et.properties.push(self.parse_property(child, &ctx)?),
                "NavigationProperty" => {
                    if let Some(nav) = parse_navigation_property(child, &ctx)? {
                        et.navigation_properties.push(nav);
                    }
                }
                _ => {}
            }
        }

        Ok(et)
    }

    fn parse_complex_type(&self, node: Node<'_, '_>, ns: &str) -> Result<ComplexType, ParseError> {
        let name = required(node, "Name", &format!("Schema '{ns}'"))?;
        let ctx = describe(node, name);

        let mut ct = ComplexType {
            name: name.to_string(),
            namespace: ns.to_string(),
            base_type: node.attribute("BaseType").map(str::to_string),
            is_abstract: bool_attr(node, "Abstract", false)?,
            open_type: bool_attr(node, "OpenType", false)?,
            description: self.read_annotations(node).description,
            ..ComplexType::default()
        };

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "Property" => ct.properties.push(self.parse_property(child, &ctx)?),
                "NavigationProperty" => {
                    if let Some(nav) = parse_navigation_property(child, &ctx)? {
                        ct.navigation_properties.push(nav);
                    }
                }
                _ => {}
            }
        }

        Ok(ct)
    }

    fn parse_property(&self, node: Node<'_, '_>, ctx: &str) -> Result<Property, ParseError> {
        let name = required(node, "Name", ctx)?;
        let type_name = required(node, "Type", &format!("{ctx}, property '{name}'"))?;
        let annotated = self.read_annotations(node);

        Ok(Property {
            name: name.to_string(),
            type_name: type_name.to_string(),
            nullable: bool_attr(node, "Nullable", true)?,
            max_length: u32_attr(node, "MaxLength", &["max"])?,
            precision: u32_attr(node, "Precision", &[])?,
            scale: u32_attr(node, "Scale", &["variable", "floating"])?,
            default_value: node.attribute("DefaultValue").map(str::to_string),
            unicode: opt_bool_attr(node, "Unicode")?,
            is_key: false,
            computed: annotated.computed,
            immutable: annotated.immutable,
            description: annotated.description,
        })
    }

    fn parse_container(
        &self,
        node: Node<'_, '_>,
        ns: &str,
    ) -> Result<EntityContainer, ParseError> {
        let name = required(node, "Name", &format!("Schema '{ns}'"))?;
        let ctx = describe(node, name);
        let mut container = EntityContainer {
            name: name.to_string(),
            namespace: ns.to_string(),
            ..EntityContainer::default()
        };

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "EntitySet" => {
                    let set_name = required(child, "Name", &ctx)?;
                    let set_ctx = describe(child, set_name);
                    container.entity_sets.push(EntitySet {
                        name: set_name.to_string(),
                        entity_type: required(child, "EntityType", &set_ctx)?.to_string(),
                        navigation_bindings: parse_bindings(child, &set_ctx)?,
                        include_in_service_document: bool_attr(
                            child,
                            "IncludeInServiceDocument",
                            true,
                        )?,
                        description: self.read_annotations(child).description,
                    });
                }
                "Singleton" => {
                    let s_name = required(child, "Name", &ctx)?;
                    let s_ctx = describe(child, s_name);
                    container.singletons.push(Singleton {
                        name: s_name.to_string(),
                        type_name: required(child, "Type", &s_ctx)?.to_string(),
                        navigation_bindings: parse_bindings(child, &s_ctx)?,
                        description: self.read_annotations(child).description,
                    });
                }
                "FunctionImport" => {
                    container.function_imports.push(FunctionImport {
                        name: required(child, "Name", &ctx)?.to_string(),
                        function: child.attribute("Function").map(str::to_string),
                        entity_set: child.attribute("EntitySet").map(str::to_string),
                        include_in_service_document: bool_attr(
                            child,
                            "IncludeInServiceDocument",
                            false,
                        )?,
                    });
                }
                "ActionImport" => {
                    let a_name = required(child, "Name", &ctx)?;
                    container.action_imports.push(ActionImport {
                        name: a_name.to_string(),
                        action: required(child, "Action", &describe(child, a_name))?.to_string(),
                        entity_set: child.attribute("EntitySet").map(str::to_string),
                    });
                }
                _ => {}
            }
        }

        Ok(container)
    }

    fn read_annotations(&self, node: Node<'_, '_>) -> Annotated {
        let mut out = Annotated::default();
        for ann in elements(node, "Annotation") {
            let Some(term) = ann.attribute("Term") else {
                continue;
            };
            if self.is_core_term(term, "Computed") {
                out.computed = annotation_bool(ann);
            } else if self.is_core_term(term, "Immutable") {
                out.immutable = annotation_bool(ann);
            } else if self.is_core_term(term, "Description")
                || (out.description.is_none() && self.is_core_term(term, "LongDescription"))
            {
                if let Some(s) = annotation_string(ann) {
                    out.description = Some(s);
                }
            }
        }
        out
    }

    fn is_core_term(&self, term: &str, local: &str) -> bool {
        let Some((prefix, name)) = term.rsplit_once('.') else {
            return false;
        };
        name == local
            && (prefix == CORE_NAMESPACE
                || prefix == "Core"
                || self.term_aliases.get(prefix).map(String::as_str) == Some(CORE_NAMESPACE))
    }

    fn apply_pending_annotations(&mut self) {
        let pending = std::mem::take(&mut self.pending_annotations);
        for (target, ann) in pending {
            match target.split_once('/') {
                Some((owner, member)) => self.annotate_member(owner, member, &ann),
                None => self.annotate_type(&target, &ann),
            }
        }
    }

    fn annotate_member(&mut self, owner: &str, member: &str, ann: &Annotated) {
        let owner = self.model.qualify(owner);

        let props = if let Some(et) = self.model.entity_types.get_mut(&owner) {
            Some(&mut et.properties)
        } else {
            self.model
                .complex_types
                .get_mut(&owner)
                .map(|ct| &mut ct.properties)
        };
        if let Some(prop) = props.and_then(|ps| ps.iter_mut().find(|p| p.name == member)) {
            prop.computed |= ann.computed;
            prop.immutable |= ann.immutable;
            if ann.description.is_some() {
                prop.description.clone_from(&ann.description);
            }
            return;
        }

        if let Some(container) = self.model.containers.get_mut(&owner) {
            if let Some(set) = container.entity_sets.iter_mut().find(|s| s.name == member) {
                if ann.description.is_some() {
                    set.description.clone_from(&ann.description);
                }
            } else if let Some(single) = container.singletons.iter_mut().find(|s| s.name == member)
                && ann.description.is_some()
            {
                single.description.clone_from(&ann.description);
            }
            return;
        }

        tracing::debug!(
            annotation_target = %format!("{owner}/{member}"),
            "annotation target not found"
        );
    }

    fn annotate_type(&mut self, target: &str, ann: &Annotated) {
        if ann.description.is_none() {
            return;
        }
        let target = self.model.qualify(target);
        if let Some(et) = self.model.entity_types.get_mut(&target) {
            et.description.clone_from(&ann.description);
        } else if let Some(ct) = self.model.complex_types.get_mut(&target) {
            ct.description.clone_from(&ann.description);
        }
    }
}

/// `None` for CSDL 2.0 navigations (`Relationship`/`ToRole` instead of `Type`); those are skipped.
fn parse_navigation_property(
    node: Node<'_, '_>,
    ctx: &str,
) -> Result<Option<NavigationProperty>, ParseError> {
    let name = required(node, "Name", ctx)?;
    let nav_ctx = format!("{ctx}, navigation property '{name}'");
    if node.attribute("Type").is_none() && node.attribute("Relationship").is_some() {
        tracing::warn!(
            context = %nav_ctx,
            relationship = node.attribute("Relationship").unwrap_or_default(),
            "skipping navigation property: association-based (CSDL 2.0) navigations are not supported"
        );
        return Ok(None);
    }
    let type_name = required(node, "Type", &nav_ctx)?;

    let mut nav = NavigationProperty {
        name: name.to_string(),
        type_name: type_name.to_string(),
        nullable: bool_attr(node, "Nullable", true)?,
        partner: node.attribute("Partner").map(str::to_string),
        contains_target: bool_attr(node, "ContainsTarget", false)?,
        referential_constraints: Vec::new(),
        on_delete: None,
    };

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "ReferentialConstraint" => {
                nav.referential_constraints.push(ReferentialConstraint {
                    property: required(child, "Property", &nav_ctx)?.to_string(),
                    referenced_property: required(child, "ReferencedProperty", &nav_ctx)?
                        .to_string(),
                });
            }
            "OnDelete" => {
                let action = required(child, "Action", &nav_ctx)?;
                let parsed = action
                    .parse::<OnDeleteAction>()
                    .map_err(|()| ParseError::InvalidAttribute {
                        element: "OnDelete".to_string(),
                        attribute: "Action",
                        value: action.to_string(),
                    })?;
                nav.on_delete = Some(parsed);
            }
            _ => {}
        }
    }

    Ok(Some(nav))
}

fn parse_enum_type(node: Node<'_, '_>, ns: &str) -> Result<EnumType, ParseError> {
    let name = required(node, "Name", &format!("Schema '{ns}'"))?;
    let ctx = describe(node, name);
    let mut members = Vec::new();
    for member in elements(node, "Member") {
        let m_name = required(member, "Name", &ctx)?;
        let value = match member.attribute("Value") {
            Some(v) => Some(v.trim().parse::<i64>().map_err(|_| {
                ParseError::InvalidAttribute {
                    element: "Member".to_string(),
                    attribute: "Value",
                    value: v.to_string(),
                }
            })?),
            None => None,
        };
        members.push(EnumMember {
            name: m_name.to_string(),
            value,
        });
    }
    Ok(EnumType {
        name: name.to_string(),
        namespace: ns.to_string(),
        underlying_type: node.attribute("UnderlyingType").map(str::to_string),
        is_flags: bool_attr(node, "IsFlags", false)?,
        members,
    })
}

fn parse_bindings(
    node: Node<'_, '_>,
    ctx: &str,
) -> Result<Vec<NavigationPropertyBinding>, ParseError> {
    elements(node, "NavigationPropertyBinding")
        .map(|b| {
            Ok(NavigationPropertyBinding {
                path: required(b, "Path", ctx)?.to_string(),
                target: required(b, "Target", ctx)?.to_string(),
            })
        })
        .collect()
}

fn elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    local_name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == local_name)
}

fn describe(node: Node<'_, '_>, name: &str) -> String {
    let pos = node.document().text_pos_at(node.range().start);
    format!("{} '{name}' (line {})", node.tag_name().name(), pos.row)
}

fn required<'a>(
    node: Node<'a, '_>,
    attribute: &'static str,
    context: &str,
) -> Result<&'a str, ParseError> {
    match node.attribute(attribute) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => {
            let pos = node.document().text_pos_at(node.range().start);
            Err(ParseError::MissingAttribute {
                element: node.tag_name().name().to_string(),
                attribute,
                context: format!("{context} (line {})", pos.row),
            })
        }
    }
}

fn opt_bool_attr(node: Node<'_, '_>, attribute: &'static str) -> Result<Option<bool>, ParseError> {
    let Some(raw) = node.attribute(attribute) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(Some(true)),
        "false" | "0" => Ok(Some(false)),
        _ => Err(ParseError::InvalidAttribute {
            element: node.tag_name().name().to_string(),
            attribute,
            value: raw.to_string(),
        }),
    }
}

fn bool_attr(node: Node<'_, '_>, attribute: &'static str, default: bool) -> Result<bool, ParseError> {
    Ok(opt_bool_attr(node, attribute)?.unwrap_or(default))
}

/// Parse an unsigned facet; any of `sentinels` (case-insensitive) means "no constraint".
fn u32_attr(
    node: Node<'_, '_>,
    attribute: &'static str,
    sentinels: &[&str],
) -> Result<Option<u32>, ParseError> {
    let Some(raw) = node.attribute(attribute) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if sentinels.iter().any(|s| trimmed.eq_ignore_ascii_case(s)) {
        return Ok(None);
    }
    trimmed
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ParseError::InvalidAttribute {
            element: node.tag_name().name().to_string(),
            attribute,
            value: raw.to_string(),
        })
}

fn annotation_bool(node: Node<'_, '_>) -> bool {
    node.attribute("Bool")
        .is_none_or(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn annotation_string(node: Node<'_, '_>) -> Option<String> {
    if let Some(s) = node.attribute("String") {
        return Some(s.to_string());
    }
    elements(node, "String")
        .next()
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORTHWIND: &str = include_str!("../../test-support/fixtures/northwind.xml");

    fn wrap(schema_body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<edmx:Edmx Version="4.0" xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx">
  <edmx:DataServices>
    <Schema Namespace="Test" xmlns="http://docs.oasis-open.org/odata/ns/edm">
      {schema_body}
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#
        )
    }

    #[test]
    fn parses_northwind_fixture() {
        let model = parse_metadata(NORTHWIND).expect("fixture parses");
        assert_eq!(model.version, "4.0");
        assert!(model.namespaces.contains("NorthwindModel"));

        let product = model.entity_type("NorthwindModel.Product").unwrap();
        assert_eq!(product.key, vec!["ProductID".to_string()]);
        let id = product
            .properties
            .iter()
            .find(|p| p.name == "ProductID")
            .unwrap();
        assert!(id.is_key);
        assert!(!id.nullable);

        let name = product.properties.iter().find(|p| p.name == "ProductName").unwrap();
        assert_eq!(name.max_length, Some(40));

        let category = product
            .navigation_properties
            .iter()
            .find(|n| n.name == "Category")
            .unwrap();
        assert!(!category.is_collection());
        assert_eq!(category.partner.as_deref(), Some("Products"));
        assert_eq!(
            category.referential_constraints,
            vec![ReferentialConstraint {
                property: "CategoryID".to_string(),
                referenced_property: "CategoryID".to_string(),
            }]
        );

        let set = model.entity_set("Products").unwrap();
        assert_eq!(set.entity_type, "NorthwindModel.Product");
        assert_eq!(set.binding_target("Category"), Some("Categories"));
    }

    #[test]
    fn optional_attributes_use_protocol_defaults() {
        let doc = wrap(
            r#"<EntityType Name="Thing">
                 <Key><PropertyRef Name="Id"/></Key>
                 <Property Name="Id" Type="Edm.Int32" Nullable="false"/>
                 <Property Name="Label" Type="Edm.String"/>
               </EntityType>"#,
        );
        let model = parse_metadata(&doc).unwrap();
        let thing = model.entity_type("Test.Thing").unwrap();
        assert!(!thing.is_abstract);
        assert!(!thing.open_type);
        assert!(!thing.has_stream);
        let label = &thing.properties[1];
        assert!(label.nullable);
        assert_eq!(label.max_length, None);
        assert_eq!(label.unicode, None);
    }

    #[test]
    fn max_and_variable_sentinels_mean_unconstrained() {
        let doc = wrap(
            r#"<EntityType Name="Doc">
                 <Key><PropertyRef Name="Id"/></Key>
                 <Property Name="Id" Type="Edm.Int32" Nullable="false"/>
                 <Property Name="Body" Type="Edm.String" MaxLength="Max"/>
                 <Property Name="Amount" Type="Edm.Decimal" Precision="18" Scale="Variable"/>
                 <Property Name="Rate" Type="Edm.Decimal" Precision="9" Scale="4"/>
               </EntityType>"#,
        );
        let model = parse_metadata(&doc).unwrap();
        let t = model.entity_type("Test.Doc").unwrap();
        assert_eq!(t.properties[1].max_length, None);
        assert_eq!(t.properties[2].scale, None);
        assert_eq!(t.properties[2].precision, Some(18));
        assert_eq!(t.properties[3].scale, Some(4));
    }

    #[test]
    fn key_may_follow_properties() {
        let doc = wrap(
            r#"<EntityType Name="Line">
                 <Property Name="OrderID" Type="Edm.Int32" Nullable="false"/>
                 <Property Name="LineNo" Type="Edm.Int16" Nullable="false"/>
                 <Property Name="Qty" Type="Edm.Int32"/>
                 <Key><PropertyRef Name="OrderID"/><PropertyRef Name="LineNo"/></Key>
               </EntityType>"#,
        );
        let model = parse_metadata(&doc).unwrap();
        let t = model.entity_type("Test.Line").unwrap();
        assert_eq!(t.key, vec!["OrderID".to_string(), "LineNo".to_string()]);
        assert!(t.properties[0].is_key);
        assert!(t.properties[1].is_key);
        assert!(!t.properties[2].is_key);
    }

    #[test]
    fn missing_property_name_fails_whole_parse() {
        let doc = wrap(
            r#"<EntityType Name="Broken">
                 <Key><PropertyRef Name="Id"/></Key>
                 <Property Name="Id" Type="Edm.Int32"/>
                 <Property Type="Edm.String"/>
               </EntityType>"#,
        );
        let err = parse_metadata(&doc).unwrap_err();
        match err {
            ParseError::MissingAttribute {
                element,
                attribute,
                context,
            } => {
                assert_eq!(element, "Property");
                assert_eq!(attribute, "Name");
                assert!(context.contains("Broken"), "context: {context}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_property_type_and_entity_set_type_are_errors() {
        let doc = wrap(r#"<EntityType Name="T"><Property Name="X"/></EntityType>"#);
        assert!(matches!(
            parse_metadata(&doc),
            Err(ParseError::MissingAttribute { attribute: "Type", .. })
        ));

        let doc = wrap(r#"<EntityContainer Name="C"><EntitySet Name="Ts"/></EntityContainer>"#);
        assert!(matches!(
            parse_metadata(&doc),
            Err(ParseError::MissingAttribute {
                attribute: "EntityType",
                ..
            })
        ));
    }

    #[test]
    fn association_navigations_are_skipped() {
        let doc = wrap(
            r#"<EntityType Name="Order">
                 <Key><PropertyRef Name="OrderID"/></Key>
                 <Property Name="OrderID" Type="Edm.Int32" Nullable="false"/>
                 <NavigationProperty Name="Customer" Relationship="Test.FK_Orders_Customers"
                                     FromRole="Orders" ToRole="Customers"/>
                 <NavigationProperty Name="Lines" Type="Collection(Test.Order)"/>
               </EntityType>"#,
        );
        let model = parse_metadata(&doc).expect("document parses");
        let order = model.entity_type("Test.Order").unwrap();
        let names: Vec<&str> = order
            .navigation_properties
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, vec!["Lines"]);

        // Neither form: still a hard error.
        let doc = wrap(
            r#"<EntityType Name="Order">
                 <Key><PropertyRef Name="OrderID"/></Key>
                 <Property Name="OrderID" Type="Edm.Int32"/>
                 <NavigationProperty Name="Customer"/>
               </EntityType>"#,
        );
        assert!(matches!(
            parse_metadata(&doc),
            Err(ParseError::MissingAttribute { attribute: "Type", .. })
        ));
    }

    #[test]
    fn ill_formed_markup_is_reported_before_structure() {
        let err = parse_metadata("<edmx:Edmx><Schema Name=").unwrap_err();
        assert!(matches!(err, ParseError::Xml(_)));

        let err = parse_metadata_bytes(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ParseError::Encoding(_)));
    }

    #[test]
    fn non_envelope_root_is_rejected() {
        let err = parse_metadata("<Schema Namespace=\"X\"/>").unwrap_err();
        assert!(matches!(err, ParseError::MissingRoot(_)));
    }

    #[test]
    fn invalid_facet_value_is_an_error() {
        let doc = wrap(
            r#"<ComplexType Name="C"><Property Name="S" Type="Edm.String" MaxLength="lots"/></ComplexType>"#,
        );
        assert!(matches!(
            parse_metadata(&doc),
            Err(ParseError::InvalidAttribute {
                attribute: "MaxLength",
                ..
            })
        ));
    }

    #[test]
    fn inline_and_out_of_line_core_annotations_apply() {
        let doc = wrap(
            r#"<EntityType Name="Ticket">
                 <Key><PropertyRef Name="Id"/></Key>
                 <Property Name="Id" Type="Edm.Int32" Nullable="false"/>
                 <Property Name="Created" Type="Edm.DateTimeOffset" Nullable="false">
                   <Annotation Term="Org.OData.Core.V1.Computed" Bool="true"/>
                 </Property>
                 <Property Name="Code" Type="Edm.String"/>
               </EntityType>
               <Annotations Target="Test.Ticket/Code">
                 <Annotation Term="Core.Immutable"/>
                 <Annotation Term="Core.Description" String="External ticket code"/>
               </Annotations>"#,
        );
        let model = parse_metadata(&doc).unwrap();
        let t = model.entity_type("Test.Ticket").unwrap();
        assert!(t.properties[1].computed);
        assert!(t.properties[2].immutable);
        assert_eq!(
            t.properties[2].description.as_deref(),
            Some("External ticket code")
        );
    }

    #[test]
    fn enum_types_and_duplicates() {
        let doc = wrap(
            r#"<EnumType Name="Color" UnderlyingType="Edm.Int32">
                 <Member Name="Red" Value="0"/><Member Name="Green" Value="1"/>
               </EnumType>"#,
        );
        let model = parse_metadata(&doc).unwrap();
        let color = model.enum_type("Test.Color").unwrap();
        assert_eq!(color.members.len(), 2);
        assert_eq!(color.members[1].value, Some(1));

        let doc = wrap(r#"<ComplexType Name="A"/><ComplexType Name="A"/>"#);
        assert!(matches!(
            parse_metadata(&doc),
            Err(ParseError::DuplicateName { .. })
        ));
    }

    #[test]
    fn utf8_bom_is_accepted() {
        let doc = wrap(r#"<ComplexType Name="A"/>"#);
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(doc.as_bytes());
        let model = parse_metadata_bytes(&bytes).unwrap();
        assert!(model.complex_type("Test.A").is_some());
    }
}
