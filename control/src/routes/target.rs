//! Managed Ingress objects and the convergence engine
//!
//! ## How a sync works
//!
//! 1. Pod events mutate route set registries and call `schedule_sync()`
//! 2. The per-target debouncer coalesces the burst
//! 3. The node-name signature is compared with the last applied one
//! 4. Owned paths are rebuilt on the cached Ingress; everything else is kept
//! 5. The whole object is replaced through the [`IngressClient`]

use crate::apis::ingress::IngressClient;
use crate::apis::metrics::record_ingress_sync;
use crate::apis::watch::report_failure;
use crate::config::TargetConfig;
use crate::error::SyncError;
use crate::routes::debounce::Debouncer;
use crate::routes::registry::RouteSetRef;
use crate::routes::route_set::{MatchOutcome, PodKey, RouteSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    ServiceBackendPort,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Index of a target in the registry
pub type TargetId = usize;

const PATH_TYPE_PREFIX: &str = "Prefix";
const PATH_TYPE_EXACT: &str = "Exact";
const SIGNATURE_SEPARATOR: &str = ";";

/// Service that serves discovery for every base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfAdvertise {
    pub service_name: String,
    pub port: u16,
}

/// Result of one sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No Ingress cached yet
    Deferred,
    /// Signature unchanged, nothing submitted
    Unchanged,
    /// Ingress replaced; `routes` counts route lines written, self-advertisement
    /// lines included
    Applied { routes: usize },
    Rejected { code: u16 },
    TransportError,
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Deferred => "deferred",
            SyncOutcome::Unchanged => "skipped",
            SyncOutcome::Applied { .. } => "applied",
            SyncOutcome::Rejected { .. } => "rejected",
            SyncOutcome::TransportError => "transport_error",
        }
    }
}

/// Outcome of evaluating a pod against one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodVisit {
    Matched { route_set: u32, changed: bool },
    /// Expected selectors of every route set, in id order
    Unmatched(Vec<String>),
}

/// Mutable state, guarded per target
#[derive(Debug, Default)]
struct TargetState {
    route_sets: BTreeMap<u32, RouteSet>,
    ingress: Option<Ingress>,
    /// Last submitted signature, `None` forces the next sync
    signature: Option<String>,
    last_summary: String,
}

enum SyncPlan {
    Deferred,
    Unchanged,
    Apply {
        ingress: Box<Ingress>,
        routes: Vec<String>,
    },
}

/// One managed Ingress object and its route sets
#[derive(Debug)]
pub struct ClusterIngressTarget {
    id: TargetId,
    namespace: String,
    ingress_name: String,
    virtual_host: String,
    self_advertise: Option<SelfAdvertise>,
    state: Mutex<TargetState>,
    debouncer: Debouncer,
}

impl ClusterIngressTarget {
    pub fn new(
        id: TargetId,
        config: &TargetConfig,
        self_advertise: Option<SelfAdvertise>,
        debounce: Duration,
    ) -> Self {
        let label = config.label();
        let route_sets = config
            .route_sets
            .iter()
            .map(|rs| (rs.id, RouteSet::new(id, &label, rs)))
            .collect();

        Self {
            id,
            namespace: config.namespace.clone(),
            ingress_name: config.ingress.clone(),
            virtual_host: config.virtual_host.clone(),
            self_advertise,
            state: Mutex::new(TargetState {
                route_sets,
                ..Default::default()
            }),
            debouncer: Debouncer::new(debounce),
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    /// `<namespace>.<ingress>`
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.ingress_name)
    }

    pub fn is_for(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.ingress_name == name
    }

    fn api_path(&self) -> String {
        format!(
            "PUT /apis/networking.k8s.io/v1/namespaces/{}/ingresses/{}",
            self.namespace, self.ingress_name
        )
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// (address, base path, config path) of every route set, in id order
    pub fn base_paths(&self) -> Vec<(RouteSetRef, String, String)> {
        self.lock()
            .route_sets
            .values()
            .map(|rs| {
                let route = RouteSetRef {
                    target: rs.target(),
                    route_set: rs.id(),
                };
                (route, rs.base_path().to_string(), rs.config_path().to_string())
            })
            .collect()
    }

    pub fn node_names(&self, route_set: u32) -> Option<Vec<String>> {
        self.lock().route_sets.get(&route_set).map(|rs| rs.node_names())
    }

    /// Evaluate a pod against the route sets in id order, first match wins
    pub fn visit_pod(&self, pod: &Pod, removed: bool) -> PodVisit {
        let mut state = self.lock();
        let mut expected = Vec::new();
        for route_set in state.route_sets.values_mut() {
            match route_set.match_pod(pod, removed) {
                MatchOutcome::Matched(change) => {
                    return PodVisit::Matched {
                        route_set: route_set.id(),
                        changed: route_set.apply(change),
                    };
                }
                MatchOutcome::Unmatched(selector) => expected.push(selector),
            }
        }
        PodVisit::Unmatched(expected)
    }

    /// Remove a pod from every route set except `keep`
    pub fn forget_pod(&self, key: &PodKey, keep: Option<u32>) -> bool {
        let mut state = self.lock();
        let mut changed = false;
        for route_set in state.route_sets.values_mut() {
            if Some(route_set.id()) != keep {
                changed |= route_set.forget(key);
            }
        }
        changed
    }

    /// Drop every registry entry whose pod is not in `present`
    pub fn retain_pods(&self, present: &HashSet<PodKey>) -> bool {
        let mut state = self.lock();
        let mut changed = false;
        for route_set in state.route_sets.values_mut() {
            changed |= route_set.retain_pods(present);
        }
        changed
    }

    /// Replace the cached Ingress (None after deletion)
    pub fn set_ingress(&self, ingress: Option<Ingress>) {
        let mut state = self.lock();
        if ingress.is_none() {
            state.signature = None;
        }
        state.ingress = ingress;
    }

    pub fn has_ingress(&self) -> bool {
        self.lock().ingress.is_some()
    }

    /// Arm or postpone the debounced resync
    pub fn schedule_sync(&self) {
        self.debouncer.trigger();
    }

    /// Drop a pending resync, if any
    pub fn cancel_sync(&self) {
        self.debouncer.cancel();
    }

    pub fn sync_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Resync every time the debouncer settles; never returns
    pub async fn run_sync_loop(self: Arc<Self>, client: Arc<dyn IngressClient>) {
        info!(
            namespace = %self.namespace,
            ingress = %self.ingress_name,
            window_ms = self.debouncer.window().as_millis() as u64,
            "Starting Ingress sync loop"
        );
        loop {
            self.debouncer.settled().await;
            self.sync(client.as_ref()).await;
        }
    }

    /// Recompute owned paths and submit them if the node set changed
    pub async fn sync(&self, client: &dyn IngressClient) -> SyncOutcome {
        let plan = self.plan_sync();
        let outcome = match plan {
            SyncPlan::Deferred => {
                debug!(
                    namespace = %self.namespace,
                    ingress = %self.ingress_name,
                    "Ingress not seen yet, deferring sync"
                );
                SyncOutcome::Deferred
            }
            SyncPlan::Unchanged => SyncOutcome::Unchanged,
            SyncPlan::Apply { ingress, routes } => {
                match client
                    .replace(&self.namespace, &self.ingress_name, &ingress)
                    .await
                {
                    Ok(()) => {
                        self.log_summary(&routes);
                        SyncOutcome::Applied {
                            routes: routes.len(),
                        }
                    }
                    Err(SyncError::Rejected { code, message }) => {
                        self.lock().signature = None;
                        warn!(
                            namespace = %self.namespace,
                            ingress = %self.ingress_name,
                            code,
                            "Update ingress {} failed: {}",
                            self.label(),
                            message
                        );
                        SyncOutcome::Rejected { code }
                    }
                    Err(SyncError::Transport(e)) => {
                        self.lock().signature = None;
                        report_failure(&self.api_path(), &e, 0).await;
                        SyncOutcome::TransportError
                    }
                }
            }
        };
        record_ingress_sync(&self.namespace, &self.ingress_name, outcome.label());
        outcome
    }

    fn plan_sync(&self) -> SyncPlan {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(ingress) = state.ingress.as_mut() else {
            return SyncPlan::Deferred;
        };

        let signature = signature(state.route_sets.values());
        if state.signature.as_deref() == Some(signature.as_str()) {
            return SyncPlan::Unchanged;
        }
        state.signature = Some(signature);

        let mut routes = Vec::new();
        let paths = self.http_paths(ingress);
        let merged = converge_paths(
            std::mem::take(paths),
            state.route_sets.values(),
            self.self_advertise.as_ref(),
            &mut routes,
        );
        *paths = merged;

        strip_server_fields(ingress);

        SyncPlan::Apply {
            ingress: Box::new(ingress.clone()),
            routes,
        }
    }

    /// Paths of the rule for our virtual host, created if missing
    fn http_paths<'a>(&self, ingress: &'a mut Ingress) -> &'a mut Vec<HTTPIngressPath> {
        let spec = ingress.spec.get_or_insert_with(Default::default);
        let rules = spec.rules.get_or_insert_with(Vec::new);
        if rules.is_empty() {
            rules.push(IngressRule {
                host: Some(self.virtual_host.clone()).filter(|h| !h.is_empty()),
                http: None,
            });
        }
        let idx = rules
            .iter()
            .position(|r| r.host.as_deref().unwrap_or("") == self.virtual_host)
            .unwrap_or(0);
        &mut rules[idx].http.get_or_insert_with(Default::default).paths
    }

    fn log_summary(&self, routes: &[String]) {
        let summary = format!(
            "Update ingress {} with {} routes:\n{}",
            self.label(),
            routes.len(),
            routes.join("\n")
        );
        let mut state = self.lock();
        if state.last_summary != summary {
            info!(
                namespace = %self.namespace,
                ingress = %self.ingress_name,
                routes = routes.len(),
                "{}",
                summary
            );
            state.last_summary = summary;
        }
    }
}

/// Node names of every route set followed by a separator, in id order
pub fn signature<'a>(route_sets: impl Iterator<Item = &'a RouteSet>) -> String {
    let mut parts = Vec::new();
    for route_set in route_sets {
        parts.extend(route_set.node_names());
        parts.push(SIGNATURE_SEPARATOR.to_string());
    }
    parts.join(",")
}

/// Rebuild the paths owned by `route_sets`, leaving all others untouched
///
/// Human-readable lines for every path written are appended to `routes`.
pub fn converge_paths<'a>(
    mut paths: Vec<HTTPIngressPath>,
    route_sets: impl Iterator<Item = &'a RouteSet> + Clone,
    self_advertise: Option<&SelfAdvertise>,
    routes: &mut Vec<String>,
) -> Vec<HTTPIngressPath> {
    for route_set in route_sets.clone() {
        paths.retain(|p| !service_name(p).is_some_and(|name| route_set.owns_service(name)));

        for node_name in route_set.node_names() {
            let path = route_set.path_for(&node_name);
            let service = route_set.service_for(&node_name);
            routes.push(format!(
                "- {}:{} to {}:{}",
                PATH_TYPE_PREFIX,
                path,
                service,
                route_set.port()
            ));
            paths.push(backend_path(path, PATH_TYPE_PREFIX, service, route_set.port()));
        }
    }

    if let Some(advertise) = self_advertise {
        for route_set in route_sets {
            let variants = advertised_paths(route_set.base_path());
            paths.retain(|p| {
                !(p.path_type == PATH_TYPE_EXACT
                    && p.path.as_deref().is_some_and(|path| variants.iter().any(|v| v == path)))
            });

            for path in variants {
                routes.push(format!(
                    "- {}:{} to {}:{}",
                    PATH_TYPE_EXACT, path, advertise.service_name, advertise.port
                ));
                paths.push(backend_path(
                    path,
                    PATH_TYPE_EXACT,
                    advertise.service_name.clone(),
                    advertise.port,
                ));
            }
        }
    }

    paths
}

/// Base path plus its trailing-slash-stripped variant when they differ
pub fn advertised_paths(base_path: &str) -> Vec<String> {
    let mut variants = vec![base_path.to_string()];
    if base_path.len() > 1 {
        if let Some(stripped) = base_path.strip_suffix('/') {
            variants.push(stripped.to_string());
        }
    }
    variants
}

fn service_name(path: &HTTPIngressPath) -> Option<&str> {
    path.backend.service.as_ref().map(|s| s.name.as_str())
}

fn backend_path(path: String, path_type: &str, service: String, port: u16) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(path),
        path_type: path_type.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service,
                port: Some(ServiceBackendPort {
                    number: Some(i32::from(port)),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}

/// Drop server-populated fields an update must not carry
pub fn strip_server_fields(ingress: &mut Ingress) {
    ingress.status = None;
    let meta = &mut ingress.metadata;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.resource_version = None;
    meta.uid = None;
}
