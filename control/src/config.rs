//! Configuration for the nodeingress controller
//!
//! Declares which Ingress objects are managed and, per Ingress, the route sets
//! whose pods get one backend path per node.

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use tracing::info;

/// Token replaced by the node name in a route set's path template
pub const NODE_NAME_PLACEHOLDER: &str = "NODENAME";

/// Default location of the configuration document
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeingress/config.json";

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Port of the discovery endpoint (also the port self-advertisement paths point to)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Service fronting this controller; enables self-advertisement paths
    #[serde(default)]
    pub self_service_name: Option<String>,

    /// Prometheus listener port (disabled when absent)
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Debounce window for Ingress resyncs in milliseconds (default: 500)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Managed Ingress objects
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// One managed Ingress object
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub namespace: String,

    /// Ingress name
    pub ingress: String,

    /// Host of the rule that receives generated paths (empty: first rule)
    #[serde(default)]
    pub virtual_host: String,

    #[serde(default)]
    pub route_sets: Vec<RouteSetConfig>,
}

/// One routing rule: pods selected by `selector_key=selector_value` get a
/// path per node built from `path`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteSetConfig {
    pub id: u32,
    pub name: String,
    pub selector_key: String,
    pub selector_value: String,
    pub port: u16,

    /// Path template, must contain `NODENAME`
    pub path: String,

    /// Path advertised by discovery (default: template without the placeholder)
    #[serde(default)]
    pub base_path: Option<String>,

    /// Seed of generated service names (default: `<name>-`)
    #[serde(default)]
    pub generate_name: Option<String>,
}

fn default_http_port() -> u16 {
    8080
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            self_service_name: None,
            metrics_port: None,
            debounce_ms: default_debounce_ms(),
            targets: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a JSON document
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ControllerError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load from `NODEINGRESS_CONFIG` and apply environment overrides
    pub fn from_env() -> Result<Self, ControllerError> {
        let path =
            env::var("NODEINGRESS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path)?;

        if let Ok(val) = env::var("NODEINGRESS_HTTP_PORT") {
            config.http_port = parse_override("NODEINGRESS_HTTP_PORT", &val)?;
        }

        if let Ok(val) = env::var("NODEINGRESS_SELF_SERVICE") {
            config.self_service_name = Some(val).filter(|v| !v.is_empty());
        }

        if let Ok(val) = env::var("NODEINGRESS_METRICS_PORT") {
            config.metrics_port = Some(parse_override("NODEINGRESS_METRICS_PORT", &val)?);
        }

        Ok(config)
    }

    /// Validate every target before anything is started
    pub fn validate(&self) -> Result<(), ControllerError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert((target.namespace.as_str(), target.ingress.as_str())) {
                return Err(ControllerError::DuplicateTarget(target.label()));
            }
            target.validate()?;
        }
        if self.self_service_name.as_deref() == Some("") {
            return Err(ControllerError::invalid(
                "self_service_name",
                "must not be empty when set",
            ));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ControllerError> {
    value.parse().map_err(|_| ControllerError::EnvOverride {
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl TargetConfig {
    /// `<namespace>.<ingress>`, prefix of every route set's config path
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.ingress)
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        let label = self.label();
        if self.namespace.is_empty() {
            return Err(ControllerError::invalid(label, "namespace is required"));
        }
        if self.ingress.is_empty() {
            return Err(ControllerError::invalid(label, "ingress name is required"));
        }

        let mut ids = HashSet::new();
        for route_set in &self.route_sets {
            let path = format!("{}.{}", label, route_set.id);
            if !ids.insert(route_set.id) {
                return Err(ControllerError::invalid(path, "duplicate route set id"));
            }
            route_set.validate(&path)?;
            info!(route_set = %path, "Route set is valid");
        }

        // Ownership of generated paths is decided by Service name prefix, so
        // no route set may claim another's names
        for (i, a) in self.route_sets.iter().enumerate() {
            let prefix_a = a.generated_prefix();
            for b in &self.route_sets[i + 1..] {
                let prefix_b = b.generated_prefix();
                if prefix_a.starts_with(&prefix_b) || prefix_b.starts_with(&prefix_a) {
                    return Err(ControllerError::invalid(
                        format!("{}.{}", label, b.id),
                        format!(
                            "generated service prefix '{}' overlaps '{}' of route set {}",
                            prefix_b, prefix_a, a.id
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl RouteSetConfig {
    pub fn validate(&self, path: &str) -> Result<(), ControllerError> {
        if self.name.is_empty() {
            return Err(ControllerError::invalid(path, "name is required"));
        }
        if self.selector_key.is_empty() || self.selector_value.is_empty() {
            return Err(ControllerError::invalid(
                path,
                "selector_key and selector_value are required",
            ));
        }
        if self.port == 0 {
            return Err(ControllerError::invalid(path, "port must not be 0"));
        }
        if !self.path.starts_with('/') {
            return Err(ControllerError::invalid(
                path,
                format!("path '{}' must start with '/'", self.path),
            ));
        }
        if !self.path.contains(NODE_NAME_PLACEHOLDER) {
            return Err(ControllerError::invalid(
                path,
                format!(
                    "path '{}' must contain the {} placeholder",
                    self.path, NODE_NAME_PLACEHOLDER
                ),
            ));
        }
        let base_path = self.resolved_base_path();
        if !base_path.starts_with('/') {
            return Err(ControllerError::invalid(
                path,
                format!("base_path '{}' must start with '/'", base_path),
            ));
        }
        validate_name_prefix(&self.generate_name_seed())
            .map_err(|reason| ControllerError::invalid(path, reason))?;
        Ok(())
    }

    /// Base path with defaults applied
    pub fn resolved_base_path(&self) -> String {
        match &self.base_path {
            Some(base) => base.clone(),
            None => {
                let mut base = self.path.replace(NODE_NAME_PLACEHOLDER, "");
                while base.contains("//") {
                    base = base.replace("//", "/");
                }
                base
            }
        }
    }

    fn generate_name_seed(&self) -> String {
        self.generate_name
            .clone()
            .unwrap_or_else(|| format!("{}-", self.name))
    }

    /// Prefix of every Service name generated for this route set
    pub fn generated_prefix(&self) -> String {
        format!("{}service-", self.generate_name_seed())
    }
}

/// Generated Service names must stay valid DNS-1123 labels once the node
/// name is appended
fn validate_name_prefix(seed: &str) -> Result<(), String> {
    if seed.is_empty() {
        return Err("generate_name cannot be empty".to_string());
    }
    if seed.starts_with('-') {
        return Err(format!("generate_name '{}' cannot start with '-'", seed));
    }
    for c in seed.chars() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return Err(format!(
                "generate_name '{}' contains invalid character '{}' (must be lowercase alphanumeric or hyphen)",
                seed, c
            ));
        }
    }
    Ok(())
}
