//! Bridge configuration file.
//!
//! The file is a service config (see [`ServiceConfig`]) with a few bridge-level keys on top:
//!
//! ```yaml
//! name: northwind
//! baseUrl: https://services.odata.org/V4/Northwind/Northwind.svc
//! startupTimeoutSecs: 60
//! safety:
//!   allowPrivateNetworks: false
//! profile:
//!   operations: [read, list, count]
//! ```

use anyhow::Context as _;
use odata_mcp_tools::config::{AuthConfig, ServiceConfig};
use odata_mcp_tools::safety::{OutboundHttpSafety, RedirectPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Source name used in logs.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(flatten)]
    pub service: ServiceConfig,
}

fn default_name() -> String {
    "odata".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    60
}

/// Outbound request policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyConfig {
    pub allowed_hosts: Option<Vec<String>>,
    pub allow_private_networks: bool,
    pub follow_redirects: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: true,
            follow_redirects: true,
        }
    }
}

impl SafetyConfig {
    #[must_use]
    pub fn to_policy(&self, max_response_bytes: Option<usize>) -> OutboundHttpSafety {
        let mut policy = OutboundHttpSafety {
            allowed_hosts: None,
            allow_private_networks: self.allow_private_networks,
            max_response_bytes,
            redirects: if self.follow_redirects {
                RedirectPolicy::Follow
            } else {
                RedirectPolicy::None
            },
        };
        if let Some(hosts) = &self.allowed_hosts {
            policy = policy.with_allowed_hosts(hosts);
        }
        policy
    }
}

/// Values taken from flags or the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub bearer_token: Option<String>,
}

impl BridgeConfig {
    /// Load the config file (if any) and apply overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result is invalid.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => Self::from_yaml_str("{}")?,
        };

        if let Some(base_url) = overrides.base_url {
            cfg.service.base_url = Some(base_url);
        }
        if let Some(token) = overrides.bearer_token {
            cfg.service.auth = Some(AuthConfig::Bearer { token });
        }

        cfg.service
            .validate()
            .context("invalid service configuration")?;
        Ok(cfg)
    }

    /// Parse without validating (overrides may still supply required fields).
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not match the config shape.
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    #[must_use]
    pub fn safety_policy(&self) -> OutboundHttpSafety {
        self.safety.to_policy(self.service.max_response_bytes)
    }

    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_service_keys_and_bridge_defaults() {
        let cfg = BridgeConfig::from_yaml_str(
            r"
baseUrl: https://example.com/odata
timeoutSecs: 5
profile:
  toolPrefix: nw
",
        )
        .unwrap();
        assert_eq!(cfg.name, "odata");
        assert_eq!(cfg.startup_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.service.timeout_secs, Some(5));
        assert_eq!(cfg.service.refresh_interval_secs, 300);
        assert_eq!(cfg.service.profile.tool_prefix.as_deref(), Some("nw"));
        assert!(cfg.safety_policy().allow_private_networks);
    }

    #[test]
    fn overrides_win_over_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        std::fs::write(
            &path,
            "name: nw\nbaseUrl: https://old.example.com/odata\nauth:\n  type: basic\n  username: u\n  password: p\n",
        )
        .unwrap();

        let cfg = BridgeConfig::load(
            Some(&path),
            Overrides {
                base_url: Some("https://new.example.com/odata".to_string()),
                bearer_token: Some("abc".to_string()),
            },
        )
        .unwrap();
        assert_eq!(cfg.name, "nw");
        assert_eq!(
            cfg.service.base_url.as_deref(),
            Some("https://new.example.com/odata")
        );
        assert!(matches!(cfg.service.auth, Some(AuthConfig::Bearer { ref token }) if token == "abc"));
    }

    #[test]
    fn missing_service_location_is_rejected() {
        let err = BridgeConfig::load(None, Overrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("baseUrl"));
    }

    #[test]
    fn safety_section_maps_to_policy() {
        let cfg = BridgeConfig::from_yaml_str(
            r"
baseUrl: https://example.com/odata
maxResponseBytes: 1024
safety:
  allowedHosts: [Example.com]
  allowPrivateNetworks: false
  followRedirects: false
",
        )
        .unwrap();
        let policy = cfg.safety_policy();
        assert!(!policy.allow_private_networks);
        assert_eq!(policy.redirects, RedirectPolicy::None);
        assert_eq!(policy.max_response_bytes, Some(1024));
        assert!(
            policy
                .allowed_hosts
                .as_ref()
                .is_some_and(|h| h.contains("example.com"))
        );
    }
}
