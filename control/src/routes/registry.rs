//! Target registry and base-path index
//!
//! Route sets refer to their owning target by [`TargetId`]; the registry
//! resolves ids to targets. Both structures are built once at startup and are
//! read-only afterwards.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::routes::target::{ClusterIngressTarget, SelfAdvertise, TargetId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// All managed targets, in configuration order
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<Arc<ClusterIngressTarget>>,
}

impl TargetRegistry {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let self_advertise = config
            .self_service_name
            .as_ref()
            .map(|service_name| SelfAdvertise {
                service_name: service_name.clone(),
                port: config.http_port,
            });
        let debounce = Duration::from_millis(config.debounce_ms);

        let targets = config
            .targets
            .iter()
            .enumerate()
            .map(|(id, target)| {
                Arc::new(ClusterIngressTarget::new(
                    id,
                    target,
                    self_advertise.clone(),
                    debounce,
                ))
            })
            .collect();

        Self { targets }
    }

    pub fn get(&self, id: TargetId) -> Option<&Arc<ClusterIngressTarget>> {
        self.targets.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClusterIngressTarget>> {
        self.targets.iter()
    }

    pub fn find(&self, namespace: &str, name: &str) -> Option<&Arc<ClusterIngressTarget>> {
        self.targets.iter().find(|t| t.is_for(namespace, name))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Current node names of a route set
    pub fn node_names(&self, route: &RouteSetRef) -> Option<Vec<String>> {
        self.get(route.target)?.node_names(route.route_set)
    }
}

/// Address of a route set inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteSetRef {
    pub target: TargetId,
    pub route_set: u32,
}

/// Base path → route set, unique across the process
#[derive(Debug, Default)]
pub struct PrefixIndex {
    /// Insertion order, used for listings
    entries: Vec<(String, RouteSetRef)>,
    by_path: HashMap<String, usize>,
}

impl PrefixIndex {
    /// Index every route set of every target under its base path
    pub fn build(registry: &TargetRegistry) -> Result<Self, ControllerError> {
        let mut index = Self::default();
        let mut owners: Vec<String> = Vec::new();

        for target in registry.iter() {
            for (route, base_path, config_path) in target.base_paths() {
                if let Some(&existing) = index.by_path.get(&base_path) {
                    return Err(ControllerError::DuplicateBasePath {
                        base_path,
                        first: owners[existing].clone(),
                        second: config_path,
                    });
                }
                debug!(base_path = %base_path, route_set = %config_path, "Indexed base path");
                index.by_path.insert(base_path.clone(), index.entries.len());
                index.entries.push((base_path, route));
                owners.push(config_path);
            }
        }

        Ok(index)
    }

    /// Exact lookup, falling back to the other trailing-slash form
    pub fn lookup(&self, path: &str) -> Option<RouteSetRef> {
        let path = path.split('?').next().unwrap_or(path);
        if let Some(found) = self.get(path) {
            return Some(found);
        }
        if path.len() > 1 {
            if let Some(stripped) = path.strip_suffix('/') {
                return self.get(stripped);
            }
        }
        self.get(&format!("{}/", path))
    }

    fn get(&self, path: &str) -> Option<RouteSetRef> {
        self.by_path.get(path).map(|&i| self.entries[i].1)
    }

    /// Every indexed base path, in load order
    pub fn base_paths(&self) -> Vec<String> {
        self.entries.iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
