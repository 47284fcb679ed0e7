use crate::catalog::OperationKind;
use crate::error::{ODataToolsError, Result, SynthesisError};
use crate::naming::NamingConvention;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

/// Configuration for one OData service exposed as a tool source.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service root, e.g. `https://host/odata/v4/Northwind.svc`.
    ///
    /// May be absent at startup when metadata is loaded from a file; invocations then fail with
    /// a configuration error.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Override the metadata location (defaults to `{baseUrl}/$metadata`).
    #[serde(default)]
    pub metadata_url: Option<String>,

    /// Load metadata from disk instead of fetching it.
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,

    /// Authentication applied to every outbound request.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Extra headers sent with every outbound request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Per-call timeout in seconds (`0` disables). Defaults to the caller's fallback.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Catalog time-to-live in seconds before a background refresh is attempted.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Maximum accepted response body size in bytes. `None` = unlimited.
    #[serde(default)]
    pub max_response_bytes: Option<usize>,

    /// Tool generation profile.
    #[serde(default)]
    pub profile: ToolProfile,
}

fn default_refresh_interval_secs() -> u64 {
    300
}

impl ServiceConfig {
    /// Parse a YAML (or JSON) service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize or its profile is invalid.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: ServiceConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    ///
    /// Returns [`ODataToolsError::Config`] when no metadata location can be derived, or the
    /// profile is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.metadata_file.is_none() && self.metadata_location().is_none() {
            return Err(ODataToolsError::Config(
                "one of baseUrl, metadataUrl or metadataFile is required".to_string(),
            ));
        }
        if let Some(base) = &self.base_url
            && !(base.starts_with("http://") || base.starts_with("https://"))
        {
            return Err(ODataToolsError::Config(format!(
                "baseUrl '{base}' must be an absolute http(s) URL"
            )));
        }
        self.profile
            .validate()
            .map_err(|e| ODataToolsError::Config(e.to_string()))
    }

    /// Where metadata is fetched from when no `metadataFile` is set.
    #[must_use]
    pub fn metadata_location(&self) -> Option<String> {
        self.metadata_url.clone().or_else(|| {
            self.base_url
                .as_deref()
                .map(|b| format!("{}/$metadata", b.trim_end_matches('/')))
        })
    }
}

/// Outbound authentication.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Header {
        name: String,
        value: String,
    },
}

/// Which query options list-style operations accept.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptionsConfig {
    pub filter: bool,
    pub orderby: bool,
    pub select: bool,
    pub expand: bool,
    pub top: bool,
    pub skip: bool,
    pub count: bool,
}

impl Default for QueryOptionsConfig {
    fn default() -> Self {
        Self {
            filter: true,
            orderby: true,
            select: true,
            expand: true,
            top: true,
            skip: true,
            count: true,
        }
    }
}

/// Immutable tool generation profile.
///
/// Defaults are applied by serde; a profile is built once and passed by reference into
/// synthesis.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolProfile {
    /// Operation kinds to generate.
    pub operations: BTreeSet<OperationKind>,
    /// Free-text `$search` support (also requires `search` in `operations`).
    pub enable_search: bool,
    pub query_options: QueryOptionsConfig,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Cap on non-key properties exposed per operation (declared order is kept).
    pub max_properties_per_tool: Option<usize>,
    pub naming: NamingConvention,
    /// Prepended to every operation name as an extra leading word.
    pub tool_prefix: Option<String>,
    /// Glob patterns (`*`, `?`) over entity set names. Empty = all.
    pub include_entity_sets: Vec<String>,
    /// Glob patterns over entity set names. Exclusion wins over inclusion.
    pub exclude_entity_sets: Vec<String>,
    /// Entity set or entity type name -> property names to hide.
    pub exclude_properties: BTreeMap<String, Vec<String>>,
    /// Entity set or entity type name -> navigation property names to hide.
    pub exclude_navigations: BTreeMap<String, Vec<String>>,
    pub include_complex_properties: bool,
    pub include_singletons: bool,
    pub include_hidden_entity_sets: bool,
    pub include_examples: bool,
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self {
            operations: OperationKind::ALL.into_iter().collect(),
            enable_search: false,
            query_options: QueryOptionsConfig::default(),
            default_page_size: 50,
            max_page_size: 1000,
            max_properties_per_tool: None,
            naming: NamingConvention::default(),
            tool_prefix: None,
            include_entity_sets: Vec::new(),
            exclude_entity_sets: Vec::new(),
            exclude_properties: BTreeMap::new(),
            exclude_navigations: BTreeMap::new(),
            include_complex_properties: true,
            include_singletons: true,
            include_hidden_entity_sets: false,
            include_examples: true,
        }
    }
}

impl ToolProfile {
    /// # Errors
    ///
    /// Returns [`SynthesisError::InvalidProfile`] for inconsistent paging or property caps.
    pub fn validate(&self) -> std::result::Result<(), SynthesisError> {
        if self.max_page_size == 0 {
            return Err(SynthesisError::InvalidProfile(
                "maxPageSize must be at least 1".to_string(),
            ));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(SynthesisError::InvalidProfile(format!(
                "defaultPageSize {} must be within [1, {}]",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.max_properties_per_tool == Some(0) {
            return Err(SynthesisError::InvalidProfile(
                "maxPropertiesPerTool must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self, kind: OperationKind) -> bool {
        self.operations.contains(&kind) && (kind != OperationKind::Search || self.enable_search)
    }

    /// Whether an entity set passes the include/exclude patterns.
    #[must_use]
    pub fn includes_entity_set(&self, name: &str) -> bool {
        if self
            .exclude_entity_sets
            .iter()
            .any(|p| glob_match(p, name))
        {
            return false;
        }
        self.include_entity_sets.is_empty()
            || self
                .include_entity_sets
                .iter()
                .any(|p| glob_match(p, name))
    }

    /// Property names hidden for an entity set (looked up by set name, type name and
    /// qualified type name).
    #[must_use]
    pub fn excluded_properties(&self, keys: &[&str]) -> HashSet<&str> {
        lookup_names(&self.exclude_properties, keys)
    }

    #[must_use]
    pub fn excluded_navigations(&self, keys: &[&str]) -> HashSet<&str> {
        lookup_names(&self.exclude_navigations, keys)
    }
}

fn lookup_names<'a>(map: &'a BTreeMap<String, Vec<String>>, keys: &[&str]) -> HashSet<&'a str> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .flat_map(|v| v.iter().map(String::as_str))
        .collect()
}

/// Simple glob matching on bytes: `*` matches any sequence, `?` any single byte.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_bytes = pattern.as_bytes();
    let text_bytes = text.as_bytes();

    let mut pattern_index = 0usize;
    let mut text_index = 0usize;

    let mut star_index: Option<usize> = None;
    let mut star_text_index: usize = 0;

    while text_index < text_bytes.len() {
        match pattern_bytes.get(pattern_index) {
            Some(b'*') => {
                star_index = Some(pattern_index);
                pattern_index += 1;
                star_text_index = text_index;
            }
            Some(b'?') => {
                pattern_index += 1;
                text_index += 1;
            }
            Some(&b) if b == text_bytes[text_index] => {
                pattern_index += 1;
                text_index += 1;
            }
            _ => {
                let Some(si) = star_index else {
                    return false;
                };

                pattern_index = si + 1;
                star_text_index += 1;
                text_index = star_text_index;
            }
        }
    }

    while matches!(pattern_bytes.get(pattern_index), Some(b'*')) {
        pattern_index += 1;
    }

    pattern_index == pattern_bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_fills_layered_defaults() {
        let cfg = ServiceConfig::from_yaml_str(
            r"
baseUrl: https://example.com/odata/
profile:
  maxPropertiesPerTool: 5
  naming: snake
  excludeEntitySets: ['Audit*']
  queryOptions:
    expand: false
",
        )
        .unwrap();

        assert_eq!(
            cfg.metadata_location().as_deref(),
            Some("https://example.com/odata/$metadata")
        );
        assert_eq!(cfg.refresh_interval_secs, 300);
        assert_eq!(cfg.profile.max_properties_per_tool, Some(5));
        assert_eq!(cfg.profile.naming, NamingConvention::Snake);
        assert_eq!(cfg.profile.default_page_size, 50);
        assert!(!cfg.profile.query_options.expand);
        assert!(cfg.profile.query_options.filter);
        assert!(cfg.profile.is_enabled(OperationKind::Create));
        assert!(!cfg.profile.is_enabled(OperationKind::Search));
        assert!(!cfg.profile.includes_entity_set("AuditLogs"));
        assert!(cfg.profile.includes_entity_set("Products"));
    }

    #[test]
    fn auth_is_tagged_by_type() {
        let cfg = ServiceConfig::from_yaml_str(
            r"
baseUrl: https://example.com
auth:
  type: bearer
  token: abc
",
        )
        .unwrap();
        assert!(matches!(cfg.auth, Some(AuthConfig::Bearer { ref token }) if token == "abc"));
    }

    #[test]
    fn invalid_profiles_are_rejected() {
        let mut profile = ToolProfile {
            default_page_size: 2000,
            ..ToolProfile::default()
        };
        assert!(profile.validate().is_err());
        profile.default_page_size = 10;
        profile.max_properties_per_tool = Some(0);
        assert!(profile.validate().is_err());

        let err = ServiceConfig::from_yaml_str("headers: {}").unwrap_err();
        assert!(matches!(err, ODataToolsError::Config(_)));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "Products"));
        assert!(glob_match("Order_*", "Order_Details"));
        assert!(glob_match("Pro?ucts", "Products"));
        assert!(!glob_match("Order_*", "Orders"));
    }

    #[test]
    fn exclusions_merge_across_lookup_keys() {
        let mut profile = ToolProfile::default();
        profile
            .exclude_properties
            .insert("Products".to_string(), vec!["UnitPrice".to_string()]);
        profile.exclude_properties.insert(
            "NorthwindModel.Product".to_string(),
            vec!["Discontinued".to_string()],
        );
        let hidden =
            profile.excluded_properties(&["Products", "Product", "NorthwindModel.Product"]);
        assert!(hidden.contains("UnitPrice"));
        assert!(hidden.contains("Discontinued"));
        assert_eq!(hidden.len(), 2);
    }
}
