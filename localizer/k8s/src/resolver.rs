//! Resolving a service's ports and backing controllers.
//!
//! A `targetPort` may be a name rather than a number. The number is recovered
//! by consulting the live endpoints object when one exists, and otherwise by
//! inspecting the container ports of the first controller whose pod template
//! matches the service selector. A name that resolves nowhere falls back to
//! the public service port; that is deliberate best-effort, not an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, Endpoints, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use localizer_core::PodId;

use crate::cache::{object_key, Cache};

/// A service port with its named `targetPort` rewritten to an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServicePort {
    pub name: Option<String>,
    /// The public service port.
    pub port: u16,
    /// The integer target the service routes to.
    pub target_port: u16,
    /// Set when a named `targetPort` was rewritten.
    pub original_name: Option<String>,
    /// The developer-side port an exposure binds; defaults to the target.
    pub local: u16,
}

/// The controllers localizer knows how to scale. The set is closed.
#[derive(Debug, Clone)]
pub enum Controller {
    Deployment(Arc<Deployment>),
    StatefulSet(Arc<StatefulSet>),
}

impl Controller {
    pub fn name(&self) -> String {
        match self {
            Controller::Deployment(d) => d.name_any(),
            Controller::StatefulSet(s) => s.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        match self {
            Controller::Deployment(d) => d.namespace().unwrap_or_default(),
            Controller::StatefulSet(s) => s.namespace().unwrap_or_default(),
        }
    }

    /// The REST resource plural, recorded so a restore can address the right
    /// endpoint without re-discovering the kind.
    pub fn resource_plural(&self) -> &'static str {
        match self {
            Controller::Deployment(_) => "deployments",
            Controller::StatefulSet(_) => "statefulsets",
        }
    }

    pub fn replicas(&self) -> i32 {
        match self {
            Controller::Deployment(d) => {
                d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
            }
            Controller::StatefulSet(s) => {
                s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
            }
        }
    }

    fn template_labels(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Controller::Deployment(d) => d
                .spec
                .as_ref()?
                .template
                .metadata
                .as_ref()?
                .labels
                .as_ref(),
            Controller::StatefulSet(s) => s
                .spec
                .as_ref()?
                .template
                .metadata
                .as_ref()?
                .labels
                .as_ref(),
        }
    }

    fn containers(&self) -> &[Container] {
        let spec = match self {
            Controller::Deployment(d) => {
                d.spec.as_ref().and_then(|s| s.template.spec.as_ref())
            }
            Controller::StatefulSet(s) => {
                s.spec.as_ref().and_then(|s| s.template.spec.as_ref())
            }
        };
        spec.map(|s| s.containers.as_slice()).unwrap_or_default()
    }
}

/// Whether `labels` carries every key/value pair of `selector`.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Returns the controllers whose pod templates match the service's selector,
/// in the service's namespace. StatefulSets are considered first so the
/// StatefulSet-friendly DNS forms win when both kinds match.
pub fn find_controllers(cache: &Cache, svc: &Service) -> Vec<Controller> {
    let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
        return Vec::new();
    };
    if selector.is_empty() {
        return Vec::new();
    }
    let namespace = svc.namespace().unwrap_or_default();

    let mut controllers: Vec<Controller> = cache
        .statefulsets
        .list()
        .into_iter()
        .map(Controller::StatefulSet)
        .collect();
    controllers.extend(cache.deployments.list().into_iter().map(Controller::Deployment));

    controllers
        .into_iter()
        .filter(|c| c.namespace() == namespace)
        .filter(|c| selector_matches(selector, c.template_labels()))
        .collect()
}

/// Resolves every TCP port of `svc` per the scheme described in the module
/// docs. Non-TCP ports are skipped.
pub fn resolve_service_ports(cache: &Cache, svc: &Service) -> Vec<ResolvedServicePort> {
    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .cloned()
        .unwrap_or_default();

    let has_named = ports
        .iter()
        .any(|p| matches!(p.target_port, Some(IntOrString::String(_))));

    let endpoint_ports: Option<AHashMap<String, i32>> = if has_named {
        cache
            .endpoints
            .get(&object_key(svc))
            .and_then(|ep| first_subset_ports(&ep))
    } else {
        None
    };

    // Endpoints are the source of truth; without them, fall back to named
    // container ports on the first matching controller.
    let container_ports: Option<AHashMap<String, i32>> =
        if has_named && endpoint_ports.is_none() {
            find_controllers(cache, svc)
                .first()
                .map(named_container_ports)
        } else {
            None
        };

    let mut resolved = Vec::with_capacity(ports.len());
    for sp in ports {
        let protocol = sp.protocol.as_deref().unwrap_or("TCP");
        if protocol != "TCP" {
            tracing::debug!(
                service = %object_key(svc),
                port = sp.port,
                protocol,
                "skipping non-TCP port"
            );
            continue;
        }

        let port = sp.port as u16;
        let (target_port, original_name) = match &sp.target_port {
            None => (port, None),
            Some(IntOrString::Int(n)) => (*n as u16, None),
            Some(IntOrString::String(named)) => {
                let from_endpoints = endpoint_ports.as_ref().and_then(|eps| {
                    // The endpoint port is named after the service port, not
                    // necessarily after the targetPort.
                    sp.name
                        .as_ref()
                        .and_then(|name| eps.get(name))
                        .or_else(|| eps.get(named))
                        .copied()
                });
                let from_containers = container_ports
                    .as_ref()
                    .and_then(|cps| cps.get(named).copied());

                match from_endpoints.or(from_containers) {
                    Some(n) => (n as u16, Some(named.clone())),
                    None => {
                        tracing::warn!(
                            service = %object_key(svc),
                            target = %named,
                            fallback = port,
                            "failed to resolve named target port, using the public port"
                        );
                        (port, None)
                    }
                }
            }
        };

        resolved.push(ResolvedServicePort {
            name: sp.name.clone(),
            port,
            target_port,
            original_name,
            local: target_port,
        });
    }

    resolved
}

/// Applies `--map local:remote` overrides: every resolved port whose target
/// equals `remote` gets its developer-side port set to `local`.
pub fn apply_port_map(ports: &mut [ResolvedServicePort], map: &[localizer_core::PortPair]) {
    for pair in map {
        for p in ports.iter_mut() {
            if p.target_port == pair.remote {
                p.local = pair.local;
            }
        }
    }
}

/// All Pod-backed endpoint identities for an endpoints object. Addresses
/// without a `targetRef`, or whose `targetRef` is not a Pod, are ignored.
pub fn pod_endpoints(ep: &Endpoints) -> Vec<PodId> {
    let mut pods = Vec::new();
    for subset in ep.subsets.as_deref().unwrap_or_default() {
        for addr in subset.addresses.as_deref().unwrap_or_default() {
            let Some(target) = addr.target_ref.as_ref() else {
                continue;
            };
            if target.kind.as_deref() != Some("Pod") {
                continue;
            }
            let Some(name) = target.name.clone() else {
                continue;
            };
            let namespace = target
                .namespace
                .clone()
                .or_else(|| ep.namespace())
                .unwrap_or_default();
            pods.push(PodId::new(namespace, name));
        }
    }
    pods
}

/// The first viable pod behind an endpoints object.
pub fn first_pod_endpoint(ep: &Endpoints) -> Option<PodId> {
    pod_endpoints(ep).into_iter().next()
}

fn first_subset_ports(ep: &Endpoints) -> Option<AHashMap<String, i32>> {
    let subset = ep.subsets.as_deref().unwrap_or_default().first()?;
    let mut ports = AHashMap::new();
    for port in subset.ports.as_deref().unwrap_or_default() {
        if let Some(name) = &port.name {
            ports.insert(name.clone(), port.port);
        }
    }
    Some(ports)
}

fn named_container_ports(controller: &Controller) -> AHashMap<String, i32> {
    let mut ports = AHashMap::new();
    for container in controller.containers() {
        for port in container.ports.as_deref().unwrap_or_default() {
            if let Some(name) = &port.name {
                ports.insert(name.clone(), port.container_port);
            }
        }
    }
    ports
}
