//! Routing state: route sets, managed Ingress targets and their indexes

pub mod debounce;
pub mod registry;
pub mod route_set;
pub mod target;
