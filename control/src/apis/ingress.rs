//! Ingress watcher and writer
//!
//! Watch events keep each target's cached Ingress fresh; updates go through
//! [`IngressClient`] as whole-object replaces. A relist that no longer
//! contains a managed Ingress clears that target's cache.

use crate::apis::watch::{EventType, WatchUpdate};
use crate::error::SyncError;
use crate::routes::registry::TargetRegistry;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use tracing::{debug, info};

/// Submits Ingress replacements
#[async_trait]
pub trait IngressClient: Send + Sync {
    async fn replace(&self, namespace: &str, name: &str, ingress: &Ingress)
        -> Result<(), SyncError>;
}

/// [`IngressClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeIngressClient {
    client: Client,
}

impl KubeIngressClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressClient for KubeIngressClient {
    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> Result<(), SyncError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), ingress).await?;
        Ok(())
    }
}

/// Entry point for the Ingress watch
pub fn handle_ingress_update(registry: &TargetRegistry, update: WatchUpdate<Ingress>) {
    match update {
        WatchUpdate::Event(event, ingress) => {
            handle_ingress_event(registry, event, ingress);
        }
        WatchUpdate::Resynced(ingresses) => resync_ingresses(registry, ingresses),
    }
}

/// Apply a full Ingress listing; managed objects missing from it are treated
/// as deleted
pub fn resync_ingresses(registry: &TargetRegistry, ingresses: Vec<Ingress>) {
    let mut listed = HashSet::new();
    for ingress in ingresses {
        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        if let Some(target) = registry.find(&namespace, &ingress.name_any()) {
            listed.insert(target.id());
        }
        handle_ingress_event(registry, EventType::Added, ingress);
    }

    for target in registry.iter() {
        if target.has_ingress() && !listed.contains(&target.id()) {
            info!(
                target = %target.label(),
                pending = target.sync_pending(),
                "Managed Ingress missing from relist, waiting for it to be recreated"
            );
            target.set_ingress(None);
            target.cancel_sync();
        }
    }
}

/// Route one Ingress watch event to its target, if managed
///
/// Returns whether the Ingress belongs to a target.
pub fn handle_ingress_event(registry: &TargetRegistry, event: EventType, ingress: Ingress) -> bool {
    let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
    let name = ingress.name_any();

    let Some(target) = registry.find(&namespace, &name) else {
        debug!(namespace = %namespace, name = %name, "Ignoring unmanaged Ingress");
        return false;
    };

    match event {
        EventType::Added | EventType::Modified => {
            debug!(namespace = %namespace, name = %name, event = %event, "Ingress cached");
            target.set_ingress(Some(ingress));
            target.schedule_sync();
        }
        EventType::Deleted => {
            info!(
                namespace = %namespace,
                name = %name,
                "Managed Ingress deleted, waiting for it to be recreated"
            );
            target.set_ingress(None);
            target.cancel_sync();
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, RouteSetConfig, TargetConfig};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn registry() -> TargetRegistry {
        TargetRegistry::from_config(&ControllerConfig {
            targets: vec![TargetConfig {
                namespace: "edge".to_string(),
                ingress: "public".to_string(),
                virtual_host: String::new(),
                route_sets: vec![RouteSetConfig {
                    id: 1,
                    name: "cam".to_string(),
                    selector_key: "app".to_string(),
                    selector_value: "cam".to_string(),
                    port: 8554,
                    path: "/cam/NODENAME".to_string(),
                    base_path: None,
                    generate_name: None,
                }],
            }],
            ..Default::default()
        })
    }

    fn ingress(namespace: &str, name: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_managed_ingress_is_cached() {
        let registry = registry();
        assert!(handle_ingress_event(
            &registry,
            EventType::Added,
            ingress("edge", "public")
        ));
        assert!(registry.find("edge", "public").unwrap().has_ingress());
    }

    #[test]
    fn test_unmanaged_ingress_is_ignored() {
        let registry = registry();
        assert!(!handle_ingress_event(
            &registry,
            EventType::Added,
            ingress("edge", "other")
        ));
        assert!(!handle_ingress_event(
            &registry,
            EventType::Added,
            ingress("default", "public")
        ));
        assert!(!registry.find("edge", "public").unwrap().has_ingress());
    }

    #[test]
    fn test_deleted_ingress_clears_cache() {
        let registry = registry();
        let target = registry.find("edge", "public").unwrap();

        handle_ingress_event(&registry, EventType::Modified, ingress("edge", "public"));
        assert!(target.sync_pending());

        handle_ingress_event(&registry, EventType::Deleted, ingress("edge", "public"));
        assert!(!target.has_ingress());
        assert!(!target.sync_pending());
    }

    #[test]
    fn test_resync_clears_ingress_missing_from_listing() {
        let registry = registry();
        let target = registry.find("edge", "public").unwrap();
        handle_ingress_event(&registry, EventType::Added, ingress("edge", "public"));
        assert!(target.sync_pending());

        handle_ingress_update(&registry, WatchUpdate::Resynced(vec![ingress("edge", "other")]));
        assert!(!target.has_ingress());
        assert!(!target.sync_pending());
    }

    #[test]
    fn test_resync_caches_listed_ingress() {
        let registry = registry();
        let target = registry.find("edge", "public").unwrap();

        handle_ingress_update(&registry, WatchUpdate::Resynced(vec![ingress("edge", "public")]));
        assert!(target.has_ingress());
        assert!(target.sync_pending());
    }
}
