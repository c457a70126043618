//! Cluster-facing subsystems of localizer: the shared informer cache, the
//! service-port resolver, the port-forward worker and its reconciler, and the
//! expose orchestrator.

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod expose;
pub mod reconciler;
pub mod resolver;
pub mod tunnel;
pub mod worker;

pub use cache::Cache;
pub use client::make_client;
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use worker::{Worker, WorkerHandle};
