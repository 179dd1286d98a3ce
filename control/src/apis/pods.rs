//! Pod watcher
//!
//! Every pod event is evaluated against all targets. The first route set
//! that selects the pod claims it; any other registry still holding the pod
//! (it was relabeled) drops it. After every relist, pods that were not
//! listed are dropped from all registries.

use crate::apis::watch::{EventType, WatchUpdate};
use crate::routes::registry::TargetRegistry;
use crate::routes::route_set::PodKey;
use crate::routes::target::PodVisit;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use tracing::{debug, info};

/// Terminated or terminating pods are treated as deleted
pub fn pod_is_gone(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
}

/// Entry point for the Pod watch
pub fn handle_pod_update(registry: &TargetRegistry, update: WatchUpdate<Pod>) {
    match update {
        WatchUpdate::Event(event, pod) => {
            handle_pod_event(registry, event, &pod);
        }
        WatchUpdate::Resynced(pods) => resync_pods(registry, &pods),
    }
}

/// Apply a full pod listing: upsert every listed pod, drop everything else
pub fn resync_pods(registry: &TargetRegistry, pods: &[Pod]) {
    let mut present = HashSet::with_capacity(pods.len());
    for pod in pods {
        handle_pod_event(registry, EventType::Added, pod);
        present.insert(PodKey::of(pod));
    }

    for target in registry.iter() {
        if target.retain_pods(&present) {
            info!(
                target = %target.label(),
                "Dropped pods that disappeared while the watch was reconnecting"
            );
            target.schedule_sync();
        }
    }
}

/// Apply one pod event to the registries and schedule affected syncs
///
/// Returns the id of the claiming target, if any.
pub fn handle_pod_event(registry: &TargetRegistry, event: EventType, pod: &Pod) -> Option<usize> {
    let key = PodKey::of(pod);
    let removed = event == EventType::Deleted || pod_is_gone(pod);

    let mut claimed: Option<(usize, u32)> = None;
    let mut expected: Vec<String> = Vec::new();

    for target in registry.iter() {
        match target.visit_pod(pod, removed) {
            PodVisit::Matched { route_set, changed } => {
                debug!(
                    pod = %key,
                    event = %event,
                    target = %target.label(),
                    route_set,
                    changed,
                    "Pod matched route set"
                );
                if changed {
                    target.schedule_sync();
                }
                claimed = Some((target.id(), route_set));
                break;
            }
            PodVisit::Unmatched(selectors) => expected.extend(selectors),
        }
    }

    // Drop the pod from every registry that no longer owns it
    for target in registry.iter() {
        let keep = claimed
            .filter(|(id, _)| *id == target.id())
            .map(|(_, route_set)| route_set);
        if target.forget_pod(&key, keep) {
            debug!(pod = %key, target = %target.label(), "Evicted pod from route set");
            target.schedule_sync();
        }
    }

    if claimed.is_none() && !removed {
        info!(
            pod = %key,
            "Pod {} matched no route set, expected one of: {}",
            key,
            expected.join(", ")
        );
    }

    claimed.map(|(id, _)| id)
}
