//! Kubernetes API integrations
//!
//! Watchers for Pods and Ingresses, the Ingress writer, and controller
//! metrics.

pub mod ingress;
pub mod metrics;
pub mod pods;
pub mod watch;
