//! nodeingress controller library
//!
//! Keeps Ingress objects in sync with the nodes that run selected pods, and
//! serves the resulting node lists over HTTP.

pub mod apis;
pub mod config;
pub mod discovery;
pub mod error;
pub mod routes;
pub mod telemetry;
