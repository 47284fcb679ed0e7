//! Operation catalog synthesis.
//!
//! [`synthesize`] walks every entity set (and, when enabled, singleton) of a [`Model`] and emits
//! one [`OperationDescriptor`] per generated operation. Descriptors are plain data: the executor
//! dispatches on [`OperationKind`] and reads addressing details (keys, navigation target, query
//! options) straight from the descriptor.

use crate::config::ToolProfile;
use crate::error::SynthesisError;
use crate::model::{EntitySet, EntityType, Model, NavigationProperty, Property, Singleton, TypeRef};
use crate::naming::format_name;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Nesting limit for complex-typed properties in input schemas.
const MAX_COMPLEX_DEPTH: usize = 4;

/// Strings longer than this are not offered for `$orderby`.
const MAX_SORTABLE_STRING_LENGTH: u32 = 255;

/// The kind of operation a descriptor performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
    List,
    Search,
    Count,
    NavigateGet,
    NavigateAdd,
    NavigateRemove,
}

impl OperationKind {
    pub const ALL: [OperationKind; 10] = [
        OperationKind::Create,
        OperationKind::Read,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::List,
        OperationKind::Search,
        OperationKind::Count,
        OperationKind::NavigateGet,
        OperationKind::NavigateAdd,
        OperationKind::NavigateRemove,
    ];

    /// Leading word of generated operation names.
    #[must_use]
    pub fn word(self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::Read | OperationKind::NavigateGet => "Get",
            OperationKind::Update => "Update",
            OperationKind::Delete => "Delete",
            OperationKind::List => "List",
            OperationKind::Search => "Search",
            OperationKind::Count => "Count",
            OperationKind::NavigateAdd => "Add",
            OperationKind::NavigateRemove => "Remove",
        }
    }

    #[must_use]
    pub fn is_navigation(self) -> bool {
        matches!(
            self,
            OperationKind::NavigateGet | OperationKind::NavigateAdd | OperationKind::NavigateRemove
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::List => "list",
            OperationKind::Search => "search",
            OperationKind::Count => "count",
            OperationKind::NavigateGet => "navigateGet",
            OperationKind::NavigateAdd => "navigateAdd",
            OperationKind::NavigateRemove => "navigateRemove",
        };
        f.write_str(s)
    }
}

/// A system query option. Variant order is alphabetical by option name, which is the order
/// options are written into a query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryOption {
    Count,
    Expand,
    Filter,
    Orderby,
    Search,
    Select,
    Skip,
    Top,
}

impl QueryOption {
    /// Input parameter name.
    #[must_use]
    pub fn parameter(self) -> &'static str {
        match self {
            QueryOption::Count => "count",
            QueryOption::Expand => "expand",
            QueryOption::Filter => "filter",
            QueryOption::Orderby => "orderby",
            QueryOption::Search => "search",
            QueryOption::Select => "select",
            QueryOption::Skip => "skip",
            QueryOption::Top => "top",
        }
    }

    /// Query-string name.
    #[must_use]
    pub fn system_name(self) -> &'static str {
        match self {
            QueryOption::Count => "$count",
            QueryOption::Expand => "$expand",
            QueryOption::Filter => "$filter",
            QueryOption::Orderby => "$orderby",
            QueryOption::Search => "$search",
            QueryOption::Select => "$select",
            QueryOption::Skip => "$skip",
            QueryOption::Top => "$top",
        }
    }
}

/// One key property and the input parameter that carries its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub property: String,
    pub parameter: String,
    /// Underlying primitive type (`Edm.Int32`, ...) used to pick the literal form.
    pub edm_type: String,
}

/// Addressing details of a navigation operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTarget {
    pub property: String,
    pub collection: bool,
    /// Entity set the related entities live in. Required for add/remove.
    pub target_entity_set: Option<String>,
    /// Target key parameters (add/remove only).
    pub target_key: Vec<KeyPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub default_top: u32,
    pub max_top: u32,
}

/// A generated, schema-described callable operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub name: String,
    pub kind: OperationKind,
    /// Owning entity set (or singleton) name; also the first URL segment.
    pub entity_set: String,
    /// Namespace-qualified entity type name.
    pub entity_type: String,
    pub singleton: bool,
    /// Source key, in key declaration order. Empty for list-style and singleton operations.
    pub key: Vec<KeyPart>,
    pub navigation: Option<NavigationTarget>,
    /// Accepted query options, sorted.
    pub query_options: Vec<QueryOption>,
    pub paging: Option<Paging>,
    pub input_schema: Value,
    pub description: String,
    pub examples: Vec<Value>,
}

impl OperationDescriptor {
    /// Names listed under `required` in the input schema.
    #[must_use]
    pub fn required_parameters(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn accepts(&self, option: QueryOption) -> bool {
        self.query_options.contains(&option)
    }

    /// Whether `name` addresses the entity rather than carrying data.
    #[must_use]
    pub fn is_key_parameter(&self, name: &str) -> bool {
        self.key.iter().any(|k| k.parameter == name)
    }
}

/// Build the operation catalog for a model.
///
/// Synthesis is deterministic: the same model and profile always produce the same descriptors in
/// the same order.
///
/// # Errors
///
/// Fails closed on the first problem: an invalid profile, an entity set whose entity type is not
/// in the model, two operations with the same name, or two parameters with the same name inside
/// one operation.
pub fn synthesize(
    model: &Model,
    profile: &ToolProfile,
) -> Result<Vec<OperationDescriptor>, SynthesisError> {
    profile.validate()?;

    let mut synth = Synthesizer {
        model,
        profile,
        operations: Vec::new(),
        origins: HashMap::new(),
    };

    for set in model.entity_sets() {
        let entity =
            model
                .entity_type(&set.entity_type)
                .ok_or_else(|| SynthesisError::MissingEntityType {
                    entity_set: set.name.clone(),
                    entity_type: set.entity_type.clone(),
                })?;

        if !set.include_in_service_document && !profile.include_hidden_entity_sets {
            debug!(entity_set = %set.name, "skipping entity set hidden from service document");
            continue;
        }
        if !profile.includes_entity_set(&set.name) {
            debug!(entity_set = %set.name, "entity set excluded by profile");
            continue;
        }

        let before = synth.operations.len();
        synth.entity_set(set, entity)?;
        debug!(
            entity_set = %set.name,
            entity_type = %entity.full_name(),
            operations = synth.operations.len() - before,
            "synthesized entity set operations"
        );
    }

    if profile.include_singletons {
        for singleton in model.singletons() {
            let entity = model.entity_type(&singleton.type_name).ok_or_else(|| {
                SynthesisError::MissingEntityType {
                    entity_set: singleton.name.clone(),
                    entity_type: singleton.type_name.clone(),
                }
            })?;
            if !profile.includes_entity_set(&singleton.name) {
                continue;
            }
            synth.singleton(singleton, entity)?;
        }
    }

    info!(
        operations = synth.operations.len(),
        "synthesized operation catalog"
    );
    Ok(synth.operations)
}

struct Synthesizer<'a> {
    model: &'a Model,
    profile: &'a ToolProfile,
    operations: Vec<OperationDescriptor>,
    /// Operation name -> "kind on set", for collision reports.
    origins: HashMap<String, String>,
}

/// Accumulates one operation's input schema, rejecting duplicate parameter names.
struct Parameters {
    operation: String,
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl Parameters {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            properties: Map::new(),
            required: Vec::new(),
        }
    }

    fn add(&mut self, name: &str, schema: Value, required: bool) -> Result<(), SynthesisError> {
        if self.properties.contains_key(name) {
            return Err(SynthesisError::ParameterCollision {
                operation: self.operation.clone(),
                parameter: name.to_string(),
            });
        }
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        Ok(())
    }

    fn finish(self) -> Value {
        let mut schema = json!({
            "type": "object",
            "properties": self.properties,
        });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        schema
    }
}

/// Everything an operation needs besides its parameters.
struct Draft<'s> {
    kind: OperationKind,
    entity_set: &'s str,
    entity: &'s EntityType,
    singleton: bool,
    navigation_name: Option<&'s str>,
}

impl<'a> Synthesizer<'a> {
    fn entity_set(&mut self, set: &EntitySet, entity: &'a EntityType) -> Result<(), SynthesisError> {
        let key = self.key_parts(entity, "");
        let set_description = set.description.as_deref().or(entity.description.as_deref());
        let type_name = entity.name.as_str();
        let draft = |kind| Draft {
            kind,
            entity_set: set.name.as_str(),
            entity,
            singleton: false,
            navigation_name: None,
        };

        if key.is_empty() {
            warn!(
                entity_set = %set.name,
                "entity type declares no key; only collection operations are generated"
            );
        }

        if self.profile.is_enabled(OperationKind::Create) {
            let name = self.name_for(&draft(OperationKind::Create));
            let mut params = Parameters::new(&name);
            let props = self.eligible_properties(&set.name, entity, |p| !p.computed);
            for p in &props {
                let required = !p.nullable && p.default_value.is_none();
                params.add(&p.name, self.property_schema(p), required)?;
            }
            let examples = self.example(|ex| {
                for p in props.iter().filter(|p| !p.nullable && p.default_value.is_none()) {
                    ex.insert(p.name.clone(), self.sample_for(p));
                }
            });
            let description = describe(
                &format!("Create a new {type_name} in the {} entity set.", set.name),
                set_description,
            );
            self.push(OperationDescriptor {
                examples,
                ..self.operation(&draft(OperationKind::Create), name, params, description)
            })?;
        }

        if !key.is_empty() {
            for kind in [OperationKind::Read, OperationKind::Delete] {
                if !self.profile.is_enabled(kind) {
                    continue;
                }
                let name = self.name_for(&draft(kind));
                let mut params = Parameters::new(&name);
                self.add_key_parameters(&mut params, entity, &key, "")?;
                let verb = if kind == OperationKind::Read { "Get" } else { "Delete" };
                let description = describe(
                    &format!("{verb} a single {type_name} from {} by key.", set.name),
                    set_description,
                );
                let examples = self.key_example(entity, &key);
                self.push(OperationDescriptor {
                    key: key.clone(),
                    examples,
                    ..self.operation(&draft(kind), name, params, description)
                })?;
            }

            if self.profile.is_enabled(OperationKind::Update) {
                let name = self.name_for(&draft(OperationKind::Update));
                let mut params = Parameters::new(&name);
                self.add_key_parameters(&mut params, entity, &key, "")?;
                for p in self.eligible_properties(&set.name, entity, |p| !p.computed && !p.immutable) {
                    params.add(&p.name, self.property_schema(p), false)?;
                }
                let description = describe(
                    &format!(
                        "Update a {type_name} in {} by key. Only the supplied properties are changed.",
                        set.name
                    ),
                    set_description,
                );
                let examples = self.key_example(entity, &key);
                self.push(OperationDescriptor {
                    key: key.clone(),
                    examples,
                    ..self.operation(&draft(OperationKind::Update), name, params, description)
                })?;
            }
        }

        if self.profile.is_enabled(OperationKind::List) {
            let name = self.name_for(&draft(OperationKind::List));
            let mut params = Parameters::new(&name);
            let options = self.list_options();
            self.add_query_parameters(&mut params, entity, &options)?;
            let description = describe(
                &format!(
                    "List {} entities with optional filtering, sorting, projection and paging.",
                    set.name
                ),
                set_description,
            );
            let examples = self.list_example(entity, &options);
            self.push(OperationDescriptor {
                examples,
                query_options: options,
                paging: Some(self.paging()),
                ..self.operation(&draft(OperationKind::List), name, params, description)
            })?;
        }

        if self.profile.is_enabled(OperationKind::Search) {
            let name = self.name_for(&draft(OperationKind::Search));
            let mut params = Parameters::new(&name);
            let options = vec![QueryOption::Orderby, QueryOption::Search, QueryOption::Top];
            params.add(
                "search",
                json!({"type": "string", "description": "Free-text search expression."}),
                true,
            )?;
            params.add("orderby", self.orderby_schema(entity), false)?;
            params.add("top", self.top_schema(), false)?;
            let description = describe(
                &format!("Free-text search over {}.", set.name),
                set_description,
            );
            let examples = self.example(|ex| {
                ex.insert("search".to_string(), json!("example"));
            });
            self.push(OperationDescriptor {
                examples,
                query_options: options,
                paging: Some(self.paging()),
                ..self.operation(&draft(OperationKind::Search), name, params, description)
            })?;
        }

        if self.profile.is_enabled(OperationKind::Count) {
            let name = self.name_for(&draft(OperationKind::Count));
            let mut params = Parameters::new(&name);
            params.add("filter", filter_schema(), false)?;
            let description = format!(
                "Count entities in {}, optionally restricted by a filter expression.",
                set.name
            );
            self.push(OperationDescriptor {
                query_options: vec![QueryOption::Filter],
                ..self.operation(&draft(OperationKind::Count), name, params, description)
            })?;
        }

        if !key.is_empty() {
            self.navigation_operations(set, entity, &key)?;
        }
        Ok(())
    }

    fn singleton(&mut self, singleton: &Singleton, entity: &'a EntityType) -> Result<(), SynthesisError> {
        let draft = |kind| Draft {
            kind,
            entity_set: singleton.name.as_str(),
            entity,
            singleton: true,
            navigation_name: None,
        };
        let description = singleton.description.as_deref().or(entity.description.as_deref());

        if self.profile.is_enabled(OperationKind::Read) {
            let name = self.name_for(&draft(OperationKind::Read));
            let params = Parameters::new(&name);
            let text = describe(&format!("Get the {} singleton.", singleton.name), description);
            self.push(self.operation(&draft(OperationKind::Read), name, params, text))?;
        }

        if self.profile.is_enabled(OperationKind::Update) {
            let name = self.name_for(&draft(OperationKind::Update));
            let mut params = Parameters::new(&name);
            for p in self.eligible_properties(&singleton.name, entity, |p| !p.computed && !p.immutable) {
                params.add(&p.name, self.property_schema(p), false)?;
            }
            let text = describe(
                &format!(
                    "Update the {} singleton. Only the supplied properties are changed.",
                    singleton.name
                ),
                description,
            );
            self.push(self.operation(&draft(OperationKind::Update), name, params, text))?;
        }
        Ok(())
    }

    fn navigation_operations(
        &mut self,
        set: &EntitySet,
        entity: &'a EntityType,
        key: &[KeyPart],
    ) -> Result<(), SynthesisError> {
        let full_name = entity.full_name();
        let hidden = self
            .profile
            .excluded_navigations(&[set.name.as_str(), entity.name.as_str(), full_name.as_str()]);

        for nav in self.model.entity_navigation_properties(entity) {
            if hidden.contains(nav.name.as_str()) {
                continue;
            }
            let target_type = self.model.entity_type(nav.target_type());
            let draft = |kind| Draft {
                kind,
                entity_set: set.name.as_str(),
                entity,
                singleton: false,
                navigation_name: Some(nav.name.as_str()),
            };

            if self.profile.is_enabled(OperationKind::NavigateGet) {
                let name = self.name_for(&draft(OperationKind::NavigateGet));
                let mut params = Parameters::new(&name);
                self.add_key_parameters(&mut params, entity, key, "")?;
                let (options, paging) = match (nav.is_collection(), target_type) {
                    (true, Some(target)) => {
                        let options = self.list_options();
                        self.add_query_parameters(&mut params, target, &options)?;
                        (options, Some(self.paging()))
                    }
                    _ => (Vec::new(), None),
                };
                let description = if nav.is_collection() {
                    format!(
                        "List the {} related to a {} in {}.",
                        nav.name, entity.name, set.name
                    )
                } else {
                    format!(
                        "Get the {} related to a {} in {}.",
                        nav.name, entity.name, set.name
                    )
                };
                let target = NavigationTarget {
                    property: nav.name.clone(),
                    collection: nav.is_collection(),
                    target_entity_set: self.target_entity_set(set, nav),
                    target_key: Vec::new(),
                };
                let examples = self.key_example(entity, key);
                self.push(OperationDescriptor {
                    key: key.to_vec(),
                    navigation: Some(target),
                    examples,
                    query_options: options,
                    paging,
                    ..self.operation(&draft(OperationKind::NavigateGet), name, params, description)
                })?;
            }

            let wants_add = self.profile.is_enabled(OperationKind::NavigateAdd);
            let wants_remove = self.profile.is_enabled(OperationKind::NavigateRemove);
            if !(wants_add || wants_remove) {
                continue;
            }
            if !nav.is_reassignable() || nav.contains_target {
                debug!(
                    entity_set = %set.name,
                    navigation = %nav.name,
                    "navigation is required or contained; no add/remove operations"
                );
                continue;
            }
            let Some(target) = target_type else {
                warn!(
                    entity_set = %set.name,
                    navigation = %nav.name,
                    target_type = %nav.target_type(),
                    "navigation target type not in model; skipping add/remove operations"
                );
                continue;
            };
            let Some(target_set) = self.target_entity_set(set, nav) else {
                warn!(
                    entity_set = %set.name,
                    navigation = %nav.name,
                    "no entity set for navigation target; skipping add/remove operations"
                );
                continue;
            };
            let target_key = self.key_parts(target, "target");
            if target_key.is_empty() {
                warn!(
                    entity_set = %set.name,
                    navigation = %nav.name,
                    "navigation target has no key; skipping add/remove operations"
                );
                continue;
            }

            if wants_add {
                let name = self.name_for(&draft(OperationKind::NavigateAdd));
                let mut params = Parameters::new(&name);
                self.add_key_parameters(&mut params, entity, key, "")?;
                self.add_key_parameters(&mut params, target, &target_key, "Key of the related entity: ")?;
                let description = format!(
                    "Link an existing {} from {} to a {} as {}.",
                    target.name, target_set, entity.name, nav.name
                );
                let nav_target = NavigationTarget {
                    property: nav.name.clone(),
                    collection: nav.is_collection(),
                    target_entity_set: Some(target_set.clone()),
                    target_key: target_key.clone(),
                };
                self.push(OperationDescriptor {
                    key: key.to_vec(),
                    navigation: Some(nav_target),
                    ..self.operation(&draft(OperationKind::NavigateAdd), name, params, description)
                })?;
            }

            if wants_remove {
                let name = self.name_for(&draft(OperationKind::NavigateRemove));
                let mut params = Parameters::new(&name);
                self.add_key_parameters(&mut params, entity, key, "")?;
                let remove_key = if nav.is_collection() {
                    self.add_key_parameters(&mut params, target, &target_key, "Key of the related entity: ")?;
                    target_key.clone()
                } else {
                    Vec::new()
                };
                let description = format!(
                    "Unlink a {} from the {} of a {}. The related entity itself is not deleted.",
                    target.name, nav.name, entity.name
                );
                let nav_target = NavigationTarget {
                    property: nav.name.clone(),
                    collection: nav.is_collection(),
                    target_entity_set: Some(target_set),
                    target_key: remove_key,
                };
                self.push(OperationDescriptor {
                    key: key.to_vec(),
                    navigation: Some(nav_target),
                    ..self.operation(&draft(OperationKind::NavigateRemove), name, params, description)
                })?;
            }
        }
        Ok(())
    }

    fn operation(
        &self,
        draft: &Draft<'_>,
        name: String,
        params: Parameters,
        description: String,
    ) -> OperationDescriptor {
        OperationDescriptor {
            name,
            kind: draft.kind,
            entity_set: draft.entity_set.to_string(),
            entity_type: draft.entity.full_name(),
            singleton: draft.singleton,
            key: Vec::new(),
            navigation: None,
            query_options: Vec::new(),
            paging: None,
            input_schema: params.finish(),
            description,
            examples: Vec::new(),
        }
    }

    fn push(&mut self, mut op: OperationDescriptor) -> Result<(), SynthesisError> {
        let origin = match &op.navigation {
            Some(nav) => format!("{} of {}/{}", op.kind, op.entity_set, nav.property),
            None => format!("{} of {}", op.kind, op.entity_set),
        };
        if let Some(first) = self.origins.get(&op.name) {
            return Err(SynthesisError::NameCollision {
                name: op.name,
                first: first.clone(),
                second: origin,
            });
        }
        self.origins.insert(op.name.clone(), origin);
        op.query_options.sort();
        self.operations.push(op);
        Ok(())
    }

    fn name_for(&self, draft: &Draft<'_>) -> String {
        let word = match &self.profile.tool_prefix {
            Some(prefix) => format!("{prefix}{}", draft.kind.word()),
            None => draft.kind.word().to_string(),
        };
        format_name(self.profile.naming, &word, draft.entity_set, draft.navigation_name)
    }

    fn paging(&self) -> Paging {
        Paging {
            default_top: self.profile.default_page_size,
            max_top: self.profile.max_page_size,
        }
    }

    fn list_options(&self) -> Vec<QueryOption> {
        let q = &self.profile.query_options;
        [
            (q.count, QueryOption::Count),
            (q.expand, QueryOption::Expand),
            (q.filter, QueryOption::Filter),
            (q.orderby, QueryOption::Orderby),
            (q.select, QueryOption::Select),
            (q.skip, QueryOption::Skip),
            (q.top, QueryOption::Top),
        ]
        .into_iter()
        .filter_map(|(enabled, option)| enabled.then_some(option))
        .collect()
    }

    fn add_query_parameters(
        &self,
        params: &mut Parameters,
        entity: &EntityType,
        options: &[QueryOption],
    ) -> Result<(), SynthesisError> {
        for option in options {
            let schema = match option {
                QueryOption::Filter => filter_schema(),
                QueryOption::Orderby => self.orderby_schema(entity),
                QueryOption::Select => json!({
                    "type": "string",
                    "description": "Comma-separated list of properties to return, e.g. 'Name,Price'.",
                }),
                QueryOption::Expand => {
                    let navs: Vec<&str> = self
                        .model
                        .entity_navigation_properties(entity)
                        .into_iter()
                        .map(|n| n.name.as_str())
                        .collect();
                    let mut description =
                        "Comma-separated navigation properties to include inline.".to_string();
                    if !navs.is_empty() {
                        description.push_str(&format!(" Available: {}.", navs.join(", ")));
                    }
                    json!({"type": "string", "description": description})
                }
                QueryOption::Top => self.top_schema(),
                QueryOption::Skip => json!({
                    "type": "integer",
                    "minimum": 0,
                    "description": "Number of entities to skip.",
                }),
                QueryOption::Count => json!({
                    "type": "boolean",
                    "description": "Include the total number of matching entities in the response.",
                }),
                QueryOption::Search => json!({"type": "string"}),
            };
            params.add(option.parameter(), schema, false)?;
        }
        Ok(())
    }

    fn top_schema(&self) -> Value {
        json!({
            "type": "integer",
            "minimum": 1,
            "maximum": self.profile.max_page_size,
            "default": self.profile.default_page_size,
            "description": "Maximum number of entities to return.",
        })
    }

    fn orderby_schema(&self, entity: &EntityType) -> Value {
        let sortable = self.sortable_properties(entity);
        let mut description = "Sort expression, e.g. 'Name desc'.".to_string();
        if !sortable.is_empty() {
            description.push_str(&format!(" Sortable properties: {}.", sortable.join(", ")));
        }
        json!({"type": "string", "description": description})
    }

    /// Primitive scalar properties cheap enough to sort on.
    fn sortable_properties<'m>(&'m self, entity: &'m EntityType) -> Vec<&'m str> {
        self.model
            .entity_properties(entity)
            .into_iter()
            .filter(|p| self.is_sortable(p))
            .map(|p| p.name.as_str())
            .collect()
    }

    fn is_sortable(&self, prop: &Property) -> bool {
        let type_ref = prop.type_ref();
        if type_ref.collection {
            return false;
        }
        if self.model.enum_type(type_ref.name).is_some() {
            return true;
        }
        match self.model.underlying_primitive(type_ref.name) {
            "Edm.String" => prop
                .max_length
                .is_none_or(|len| len <= MAX_SORTABLE_STRING_LENGTH),
            "Edm.Binary" | "Edm.Stream" => false,
            t => t.starts_with("Edm.") && !t.starts_with("Edm.Geography") && !t.starts_with("Edm.Geometry"),
        }
    }

    fn key_parts(&self, entity: &EntityType, prefix: &str) -> Vec<KeyPart> {
        self.model
            .key_properties(entity)
            .into_iter()
            .map(|p| KeyPart {
                property: p.name.clone(),
                parameter: if prefix.is_empty() {
                    p.name.clone()
                } else {
                    format!("{prefix}{}", p.name)
                },
                edm_type: self
                    .model
                    .underlying_primitive(p.type_ref().name)
                    .to_string(),
            })
            .collect()
    }

    fn add_key_parameters(
        &self,
        params: &mut Parameters,
        entity: &EntityType,
        key: &[KeyPart],
        description_prefix: &str,
    ) -> Result<(), SynthesisError> {
        let props = self.model.key_properties(entity);
        for part in key {
            let mut schema = match props.iter().find(|p| p.name == part.property) {
                Some(p) => self.property_schema(p),
                None => json!({"type": "string"}),
            };
            if !description_prefix.is_empty() {
                schema["description"] = json!(format!("{description_prefix}{}", part.property));
            }
            params.add(&part.parameter, schema, true)?;
        }
        Ok(())
    }

    /// Non-key structural properties offered for Create/Update, after exclusions and the
    /// per-tool cap (declared order, inherited properties first).
    fn eligible_properties(
        &self,
        set_name: &str,
        entity: &'a EntityType,
        keep: impl Fn(&Property) -> bool,
    ) -> Vec<&'a Property> {
        let full_name = entity.full_name();
        let hidden = self
            .profile
            .excluded_properties(&[set_name, entity.name.as_str(), full_name.as_str()]);

        let mut props: Vec<&'a Property> = self
            .model
            .entity_properties(entity)
            .into_iter()
            .filter(|p| !p.is_key)
            .filter(|p| !hidden.contains(p.name.as_str()))
            .filter(|p| self.model.underlying_primitive(p.type_ref().name) != "Edm.Stream")
            .filter(|p| self.profile.include_complex_properties || !self.is_complex(p))
            .filter(|p| keep(p))
            .collect();

        if let Some(max) = self.profile.max_properties_per_tool {
            props.truncate(max);
        }
        props
    }

    fn is_complex(&self, prop: &Property) -> bool {
        self.model.complex_type(prop.type_ref().name).is_some()
    }

    fn property_schema(&self, prop: &Property) -> Value {
        let mut stack = Vec::new();
        let mut schema = self.type_schema(&prop.type_name, Some(prop), &mut stack);
        if let Some(description) = &prop.description {
            schema["description"] = json!(description);
        }
        schema
    }

    fn type_schema(&self, type_name: &str, facets: Option<&Property>, stack: &mut Vec<String>) -> Value {
        let type_ref = TypeRef::parse(type_name);
        if type_ref.collection {
            return json!({
                "type": "array",
                "items": self.type_schema(type_ref.name, facets, stack),
            });
        }

        let resolved = self.model.underlying_primitive(type_ref.name);
        if resolved.starts_with("Edm.") {
            return primitive_schema(resolved, facets);
        }

        if let Some(enum_type) = self.model.enum_type(resolved) {
            let members: Vec<&str> = enum_type.members.iter().map(|m| m.name.as_str()).collect();
            if enum_type.is_flags {
                return json!({
                    "type": "string",
                    "description": format!("Comma-separated combination of: {}.", members.join(", ")),
                });
            }
            return json!({"type": "string", "enum": members});
        }

        if let Some(complex) = self.model.complex_type(resolved) {
            let full_name = complex.full_name();
            if stack.len() >= MAX_COMPLEX_DEPTH || stack.contains(&full_name) {
                return json!({"type": "object"});
            }
            stack.push(full_name);
            let mut properties = Map::new();
            for p in self.model.complex_properties(complex) {
                if self.model.underlying_primitive(p.type_ref().name) == "Edm.Stream" {
                    continue;
                }
                let mut schema = self.type_schema(&p.type_name, Some(p), stack);
                if let Some(description) = &p.description {
                    schema["description"] = json!(description);
                }
                properties.insert(p.name.clone(), schema);
            }
            stack.pop();
            return json!({"type": "object", "properties": properties});
        }

        json!({"type": "string"})
    }

    fn target_entity_set(&self, set: &EntitySet, nav: &NavigationProperty) -> Option<String> {
        if let Some(target) = set.binding_target(&nav.name) {
            let name = target.rsplit('/').next().unwrap_or(target);
            return Some(name.to_string());
        }
        match self.model.entity_sets_of_type(nav.target_type()).as_slice() {
            [only] => Some(only.name.clone()),
            _ => None,
        }
    }

    fn example(&self, fill: impl FnOnce(&mut Map<String, Value>)) -> Vec<Value> {
        if !self.profile.include_examples {
            return Vec::new();
        }
        let mut ex = Map::new();
        fill(&mut ex);
        if ex.is_empty() {
            Vec::new()
        } else {
            vec![Value::Object(ex)]
        }
    }

    fn key_example(&self, entity: &EntityType, key: &[KeyPart]) -> Vec<Value> {
        let props = self.model.key_properties(entity);
        self.example(|ex| {
            for part in key {
                if let Some(p) = props.iter().find(|p| p.name == part.property) {
                    ex.insert(part.parameter.clone(), self.sample_for(p));
                }
            }
        })
    }

    fn list_example(&self, entity: &EntityType, options: &[QueryOption]) -> Vec<Value> {
        let props = self.model.entity_properties(entity);
        let sortable: Vec<&&Property> = props.iter().filter(|p| self.is_sortable(p)).collect();
        self.example(|ex| {
            if options.contains(&QueryOption::Filter)
                && let Some(p) = sortable.iter().find(|p| !p.is_key)
            {
                let literal = match self.sample_for(p) {
                    Value::String(s) => format!("'{s}'"),
                    other => other.to_string(),
                };
                ex.insert("filter".to_string(), json!(format!("{} eq {literal}", p.name)));
            }
            if options.contains(&QueryOption::Orderby)
                && let Some(p) = sortable.first()
            {
                ex.insert("orderby".to_string(), json!(format!("{} desc", p.name)));
            }
            if options.contains(&QueryOption::Top) {
                ex.insert(
                    "top".to_string(),
                    json!(self.profile.default_page_size.min(10)),
                );
            }
        })
    }

    fn sample_for(&self, prop: &Property) -> Value {
        let type_ref = prop.type_ref();
        if type_ref.collection {
            return json!([]);
        }
        if let Some(e) = self.model.enum_type(type_ref.name) {
            return e.members.first().map_or(json!(""), |m| json!(m.name));
        }
        if self.model.complex_type(type_ref.name).is_some() {
            return json!({});
        }
        sample_primitive(self.model.underlying_primitive(type_ref.name))
    }
}

fn describe(summary: &str, detail: Option<&str>) -> String {
    match detail {
        Some(d) if !d.trim().is_empty() => format!("{summary} {}", d.trim()),
        _ => summary.to_string(),
    }
}

fn filter_schema() -> Value {
    json!({
        "type": "string",
        "description": "Filter expression, e.g. \"Price gt 20 and contains(Name,'tea')\".",
    })
}

/// JSON schema for an `Edm.*` primitive, with facets copied from the declaring property.
fn primitive_schema(edm_type: &str, facets: Option<&Property>) -> Value {
    let max_length = facets.and_then(|p| p.max_length);
    let scale = facets.and_then(|p| p.scale);

    match edm_type {
        "Edm.String" => {
            let mut s = json!({"type": "string"});
            if let Some(len) = max_length {
                s["maxLength"] = json!(len);
            }
            s
        }
        "Edm.Guid" => json!({"type": "string", "format": "uuid"}),
        "Edm.DateTimeOffset" | "Edm.DateTime" => json!({"type": "string", "format": "date-time"}),
        "Edm.Date" => json!({"type": "string", "format": "date"}),
        "Edm.TimeOfDay" | "Edm.Time" => json!({"type": "string", "format": "time"}),
        "Edm.Duration" => json!({"type": "string", "format": "duration"}),
        "Edm.Binary" => json!({"type": "string", "contentEncoding": "base64"}),
        "Edm.Boolean" => json!({"type": "boolean"}),
        "Edm.Byte" => json!({"type": "integer", "minimum": 0, "maximum": 255}),
        "Edm.SByte" => json!({"type": "integer", "minimum": -128, "maximum": 127}),
        "Edm.Int16" => json!({"type": "integer", "minimum": i16::MIN, "maximum": i16::MAX}),
        "Edm.Int32" => json!({"type": "integer", "minimum": i32::MIN, "maximum": i32::MAX}),
        "Edm.Int64" => json!({"type": "integer"}),
        "Edm.Decimal" => {
            let mut s = json!({"type": "number"});
            if let Some(scale) = scale.filter(|s| *s > 0) {
                s["multipleOf"] = json!(1.0 / 10f64.powi(i32::try_from(scale).unwrap_or(i32::MAX)));
            }
            s
        }
        "Edm.Double" | "Edm.Single" => json!({"type": "number"}),
        _ => json!({"type": "string"}),
    }
}

fn sample_primitive(edm_type: &str) -> Value {
    match edm_type {
        "Edm.Byte" | "Edm.SByte" | "Edm.Int16" | "Edm.Int32" | "Edm.Int64" => json!(1),
        "Edm.Decimal" | "Edm.Double" | "Edm.Single" => json!(1.5),
        "Edm.Boolean" => json!(true),
        "Edm.Guid" => json!("00000000-0000-0000-0000-000000000000"),
        "Edm.DateTimeOffset" | "Edm.DateTime" => json!("2024-01-01T00:00:00Z"),
        "Edm.Date" => json!("2024-01-01"),
        "Edm.TimeOfDay" | "Edm.Time" => json!("12:00:00"),
        "Edm.Duration" => json!("PT1H"),
        _ => json!("example"),
    }
}
