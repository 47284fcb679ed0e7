//! In-memory type model of an OData service.
//!
//! A [`Model`] is built once per metadata snapshot and never mutated after the parser hands it
//! out. Everything here is plain data plus name lookup and invariant checks.

use crate::error::ParseError;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

/// Root of a parsed metadata document.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// Protocol version declared by the envelope (`Edmx@Version`).
    pub version: String,
    /// Every schema namespace seen.
    pub namespaces: BTreeSet<String>,
    /// Schema alias -> namespace.
    pub aliases: BTreeMap<String, String>,
    /// Entity types keyed by namespace-qualified name.
    pub entity_types: BTreeMap<String, EntityType>,
    /// Complex types keyed by namespace-qualified name.
    pub complex_types: BTreeMap<String, ComplexType>,
    /// Enum types keyed by namespace-qualified name.
    pub enum_types: BTreeMap<String, EnumType>,
    /// Type definitions keyed by namespace-qualified name.
    pub type_definitions: BTreeMap<String, TypeDefinition>,
    /// Entity containers keyed by namespace-qualified name.
    pub containers: BTreeMap<String, EntityContainer>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityType {
    pub name: String,
    pub namespace: String,
    pub base_type: Option<String>,
    pub is_abstract: bool,
    pub open_type: bool,
    pub has_stream: bool,
    pub properties: Vec<Property>,
    pub navigation_properties: Vec<NavigationProperty>,
    /// Key property names in declaration order. Empty when the key is inherited.
    pub key: Vec<String>,
    pub description: Option<String>,
}

impl EntityType {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComplexType {
    pub name: String,
    pub namespace: String,
    pub base_type: Option<String>,
    pub is_abstract: bool,
    pub open_type: bool,
    pub properties: Vec<Property>,
    pub navigation_properties: Vec<NavigationProperty>,
    pub description: Option<String>,
}

impl ComplexType {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Property {
    pub name: String,
    /// Declared type, e.g. `Edm.String` or `Collection(NS.Address)`.
    pub type_name: String,
    pub nullable: bool,
    /// `None` when unset or declared as `Max`.
    pub max_length: Option<u32>,
    pub precision: Option<u32>,
    /// `None` when unset or declared as `Variable`.
    pub scale: Option<u32>,
    pub default_value: Option<String>,
    pub unicode: Option<bool>,
    /// Set by [`Model::resolve_keys`] once the owning type's key list is known.
    pub is_key: bool,
    /// `Core.Computed`: the service assigns the value.
    pub computed: bool,
    /// `Core.Immutable`: settable on create only.
    pub immutable: bool,
    pub description: Option<String>,
}

impl Property {
    #[must_use]
    pub fn type_ref(&self) -> TypeRef<'_> {
        TypeRef::parse(&self.type_name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavigationProperty {
    pub name: String,
    /// Declared type, e.g. `NS.Category` or `Collection(NS.Product)`.
    pub type_name: String,
    pub nullable: bool,
    pub partner: Option<String>,
    pub contains_target: bool,
    pub referential_constraints: Vec<ReferentialConstraint>,
    pub on_delete: Option<OnDeleteAction>,
}

impl NavigationProperty {
    #[must_use]
    pub fn is_collection(&self) -> bool {
        TypeRef::parse(&self.type_name).collection
    }

    /// Target type name with any `Collection(..)` wrapper removed.
    #[must_use]
    pub fn target_type(&self) -> &str {
        TypeRef::parse(&self.type_name).name
    }

    /// Whether a relationship can be added or removed without violating a required reference.
    #[must_use]
    pub fn is_reassignable(&self) -> bool {
        self.is_collection() || self.nullable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferentialConstraint {
    pub property: String,
    pub referenced_property: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDeleteAction {
    Cascade,
    None,
    SetNull,
    SetDefault,
}

impl FromStr for OnDeleteAction {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Cascade" => Ok(OnDeleteAction::Cascade),
            "None" => Ok(OnDeleteAction::None),
            "SetNull" => Ok(OnDeleteAction::SetNull),
            "SetDefault" => Ok(OnDeleteAction::SetDefault),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnumType {
    pub name: String,
    pub namespace: String,
    pub underlying_type: Option<String>,
    pub is_flags: bool,
    pub members: Vec<EnumMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMember {
    pub name: String,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeDefinition {
    pub name: String,
    pub namespace: String,
    pub underlying_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    pub name: String,
    /// Qualified (possibly alias-qualified) entity type name.
    pub entity_type: String,
    pub navigation_bindings: Vec<NavigationPropertyBinding>,
    pub include_in_service_document: bool,
    pub description: Option<String>,
}

impl EntitySet {
    /// Entity set bound to the given navigation path, if declared.
    #[must_use]
    pub fn binding_target(&self, path: &str) -> Option<&str> {
        self.navigation_bindings
            .iter()
            .find(|b| b.path == path || b.path.rsplit('/').next() == Some(path))
            .map(|b| b.target.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Singleton {
    pub name: String,
    pub type_name: String,
    pub navigation_bindings: Vec<NavigationPropertyBinding>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationPropertyBinding {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionImport {
    pub name: String,
    pub function: Option<String>,
    pub entity_set: Option<String>,
    pub include_in_service_document: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActionImport {
    pub name: String,
    pub action: String,
    pub entity_set: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityContainer {
    pub name: String,
    pub namespace: String,
    pub entity_sets: Vec<EntitySet>,
    pub singletons: Vec<Singleton>,
    pub function_imports: Vec<FunctionImport>,
    pub action_imports: Vec<ActionImport>,
}

/// A declared type name split into its element type and collection flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRef<'a> {
    pub name: &'a str,
    pub collection: bool,
}

impl<'a> TypeRef<'a> {
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        match trimmed
            .strip_prefix("Collection(")
            .and_then(|s| s.strip_suffix(')'))
        {
            Some(inner) => Self {
                name: inner.trim(),
                collection: true,
            },
            None => Self {
                name: trimmed,
                collection: false,
            },
        }
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.name.starts_with("Edm.")
    }
}

impl Model {
    /// Normalize an alias-qualified name (`Self.Product`) to its namespace-qualified form.
    #[must_use]
    pub fn qualify(&self, name: &str) -> String {
        if let Some((prefix, local)) = name.rsplit_once('.')
            && let Some(ns) = self.aliases.get(prefix)
        {
            return format!("{ns}.{local}");
        }
        name.to_string()
    }

    #[must_use]
    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types
            .get(name)
            .or_else(|| self.entity_types.get(&self.qualify(name)))
    }

    #[must_use]
    pub fn complex_type(&self, name: &str) -> Option<&ComplexType> {
        self.complex_types
            .get(name)
            .or_else(|| self.complex_types.get(&self.qualify(name)))
    }

    #[must_use]
    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        self.enum_types
            .get(name)
            .or_else(|| self.enum_types.get(&self.qualify(name)))
    }

    /// Follow type definitions down to the underlying `Edm.*` primitive.
    #[must_use]
    pub fn underlying_primitive<'a>(&'a self, name: &'a str) -> &'a str {
        let mut current = name;
        for _ in 0..8 {
            if current.starts_with("Edm.") {
                return current;
            }
            let Some(def) = self
                .type_definitions
                .get(current)
                .or_else(|| self.type_definitions.get(&self.qualify(current)))
            else {
                return current;
            };
            current = &def.underlying_type;
        }
        current
    }

    /// The type followed by its ancestors, nearest first.
    ///
    /// Stops at the first base type that is not part of this model.
    #[must_use]
    pub fn entity_type_chain<'a>(&'a self, entity: &'a EntityType) -> Vec<&'a EntityType> {
        let mut chain = vec![entity];
        let mut seen: HashSet<String> = HashSet::from([entity.full_name()]);
        let mut current = entity;
        while let Some(base) = current
            .base_type
            .as_deref()
            .and_then(|b| self.entity_type(b))
        {
            if !seen.insert(base.full_name()) {
                break;
            }
            chain.push(base);
            current = base;
        }
        chain
    }

    /// All structural properties of an entity type, inherited ones first.
    #[must_use]
    pub fn entity_properties<'a>(&'a self, entity: &'a EntityType) -> Vec<&'a Property> {
        self.entity_type_chain(entity)
            .into_iter()
            .rev()
            .flat_map(|t| t.properties.iter())
            .collect()
    }

    /// All navigation properties of an entity type, inherited ones first.
    #[must_use]
    pub fn entity_navigation_properties<'a>(
        &'a self,
        entity: &'a EntityType,
    ) -> Vec<&'a NavigationProperty> {
        self.entity_type_chain(entity)
            .into_iter()
            .rev()
            .flat_map(|t| t.navigation_properties.iter())
            .collect()
    }

    /// Key properties in key declaration order, resolved through the inheritance chain.
    #[must_use]
    pub fn key_properties<'a>(&'a self, entity: &'a EntityType) -> Vec<&'a Property> {
        let chain = self.entity_type_chain(entity);
        let Some(keyed) = chain.iter().find(|t| !t.key.is_empty()) else {
            return Vec::new();
        };
        let props = self.entity_properties(entity);
        keyed
            .key
            .iter()
            .filter_map(|k| props.iter().find(|p| p.name == *k).copied())
            .collect()
    }

    /// All structural properties of a complex type, inherited ones first.
    #[must_use]
    pub fn complex_properties<'a>(&'a self, complex: &'a ComplexType) -> Vec<&'a Property> {
        let mut chain = vec![complex];
        let mut seen: HashSet<String> = HashSet::from([complex.full_name()]);
        let mut current = complex;
        while let Some(base) = current
            .base_type
            .as_deref()
            .and_then(|b| self.complex_type(b))
        {
            if !seen.insert(base.full_name()) {
                break;
            }
            chain.push(base);
            current = base;
        }
        chain
            .into_iter()
            .rev()
            .flat_map(|t| t.properties.iter())
            .collect()
    }

    /// Entity sets of every container, in container-name then declaration order.
    pub fn entity_sets(&self) -> impl Iterator<Item = &EntitySet> {
        self.containers.values().flat_map(|c| c.entity_sets.iter())
    }

    pub fn singletons(&self) -> impl Iterator<Item = &Singleton> {
        self.containers.values().flat_map(|c| c.singletons.iter())
    }

    #[must_use]
    pub fn entity_set(&self, name: &str) -> Option<&EntitySet> {
        self.entity_sets().find(|s| s.name == name)
    }

    /// Entity sets whose declared type is exactly `entity_type` (qualified or alias-qualified).
    #[must_use]
    pub fn entity_sets_of_type(&self, entity_type: &str) -> Vec<&EntitySet> {
        let wanted = self.qualify(entity_type);
        self.entity_sets()
            .filter(|s| self.qualify(&s.entity_type) == wanted)
            .collect()
    }

    /// Reject inheritance cycles among entity and complex types.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::BaseTypeCycle`] naming the first type found on a cycle.
    pub fn check_inheritance(&self) -> Result<(), ParseError> {
        for (name, et) in &self.entity_types {
            let mut seen: HashSet<String> = HashSet::from([name.clone()]);
            let mut next = et.base_type.as_deref().map(|b| self.qualify(b));
            while let Some(base) = next {
                if !seen.insert(base.clone()) {
                    return Err(ParseError::BaseTypeCycle(name.clone()));
                }
                next = self
                    .entity_types
                    .get(&base)
                    .and_then(|t| t.base_type.as_deref())
                    .map(|b| self.qualify(b));
            }
        }
        for (name, ct) in &self.complex_types {
            let mut seen: HashSet<String> = HashSet::from([name.clone()]);
            let mut next = ct.base_type.as_deref().map(|b| self.qualify(b));
            while let Some(base) = next {
                if !seen.insert(base.clone()) {
                    return Err(ParseError::BaseTypeCycle(name.clone()));
                }
                next = self
                    .complex_types
                    .get(&base)
                    .and_then(|t| t.base_type.as_deref())
                    .map(|b| self.qualify(b));
            }
        }
        Ok(())
    }

    /// Mark key properties and check that every declared key name exists.
    ///
    /// Must run after all schemas are loaded, since a key may name an inherited property and
    /// `<Key>` may appear before or after the properties it references.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnknownKeyProperty`] if a key names a property that neither the
    /// type nor any ancestor declares.
    pub fn resolve_keys(&mut self) -> Result<(), ParseError> {
        let mut marks: Vec<(String, String)> = Vec::new();

        for (name, et) in &self.entity_types {
            for key in &et.key {
                let owner = self
                    .entity_type_chain(et)
                    .into_iter()
                    .find(|t| t.properties.iter().any(|p| p.name == *key));
                match owner {
                    Some(t) => marks.push((t.full_name(), key.clone())),
                    None => {
                        return Err(ParseError::UnknownKeyProperty {
                            entity_type: name.clone(),
                            property: key.clone(),
                        });
                    }
                }
            }
        }

        for (owner, key) in marks {
            if let Some(t) = self.entity_types.get_mut(&owner)
                && let Some(p) = t.properties.iter_mut().find(|p| p.name == key)
            {
                p.is_key = true;
            }
        }

        Ok(())
    }
}
