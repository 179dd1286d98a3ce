//! Route sets: selector matching and the per-route node registry

use crate::config::{RouteSetConfig, NODE_NAME_PLACEHOLDER};
use crate::routes::target::TargetId;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashSet;
use std::fmt;

/// Key of a registry entry: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(pod: &Pod) -> Self {
        Self::new(pod.namespace().unwrap_or_default(), pod.name_any())
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod's placement on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub pod: PodKey,
    pub node_name: String,
    /// Pod is running; only live entries are routed
    pub live: bool,
}

/// Registry mutation derived from one pod event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodChange {
    Upsert(NodeEntry),
    Remove(PodKey),
}

/// Result of evaluating a pod against a route set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(PodChange),
    /// Selector this route set expected, `key=value`
    Unmatched(String),
}

/// One routing rule and the nodes currently hosting its pods
#[derive(Debug, Clone)]
pub struct RouteSet {
    id: u32,
    /// Owning target, resolved through the registry
    target: TargetId,
    config_path: String,
    selector_key: String,
    selector_value: String,
    port: u16,
    path_template: String,
    base_path: String,
    generated_prefix: String,
    /// Insertion ordered, unique by pod key
    nodes: Vec<NodeEntry>,
}

impl RouteSet {
    pub fn new(target: TargetId, target_label: &str, config: &RouteSetConfig) -> Self {
        Self {
            id: config.id,
            target,
            config_path: format!("{}.{}", target_label, config.id),
            selector_key: config.selector_key.clone(),
            selector_value: config.selector_value.clone(),
            port: config.port,
            path_template: config.path.clone(),
            base_path: config.resolved_base_path(),
            generated_prefix: config.generated_prefix(),
            nodes: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    /// `<namespace>.<ingress>.<id>`
    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `key=value` as shown in unmatched-pod notices
    pub fn expected_selector(&self) -> String {
        format!("{}={}", self.selector_key, self.selector_value)
    }

    /// Ingress path for a node
    pub fn path_for(&self, node_name: &str) -> String {
        self.path_template.replace(NODE_NAME_PLACEHOLDER, node_name)
    }

    /// Generated backend Service name for a node
    pub fn service_for(&self, node_name: &str) -> String {
        format!("{}{}", self.generated_prefix, node_name)
    }

    pub fn owns_service(&self, service_name: &str) -> bool {
        service_name.starts_with(&self.generated_prefix)
    }

    /// Exact `key=value` label match
    pub fn selects(&self, pod: &Pod) -> bool {
        pod.labels().get(&self.selector_key) == Some(&self.selector_value)
    }

    /// Evaluate a pod; `removed` turns a match into a removal
    ///
    /// A matching pod that has not been scheduled yet is reported as a
    /// removal so it never reaches the registry without a node.
    pub fn match_pod(&self, pod: &Pod, removed: bool) -> MatchOutcome {
        if !self.selects(pod) {
            return MatchOutcome::Unmatched(self.expected_selector());
        }

        let key = PodKey::of(pod);
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .filter(|n| !n.is_empty());

        match node_name {
            Some(node_name) if !removed => MatchOutcome::Matched(PodChange::Upsert(NodeEntry {
                pod: key,
                node_name,
                live: is_running(pod),
            })),
            _ => MatchOutcome::Matched(PodChange::Remove(key)),
        }
    }

    /// Apply a registry mutation, returns whether anything changed
    pub fn apply(&mut self, change: PodChange) -> bool {
        match change {
            PodChange::Upsert(entry) => match self.nodes.iter_mut().find(|n| n.pod == entry.pod) {
                Some(existing) if *existing == entry => false,
                Some(existing) => {
                    *existing = entry;
                    true
                }
                None => {
                    self.nodes.push(entry);
                    true
                }
            },
            PodChange::Remove(key) => self.forget(&key),
        }
    }

    /// Drop a pod from the registry, returns whether it was present
    pub fn forget(&mut self, key: &PodKey) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| &n.pod != key);
        self.nodes.len() != before
    }

    /// Keep only entries whose pod is in `present`, returns whether any went
    pub fn retain_pods(&mut self, present: &HashSet<PodKey>) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| present.contains(&n.pod));
        self.nodes.len() != before
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.nodes
    }

    /// Distinct node names of live entries, in registry order
    pub fn node_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .filter(|n| n.live)
            .filter(|n| seen.insert(n.node_name.as_str()))
            .map(|n| n.node_name.clone())
            .collect()
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}
