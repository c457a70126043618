//! The sidecar pod that intercepts a service's traffic, and the scale
//! bookkeeping around it.
//!
//! The sidecar carries the service's selector labels so endpoints route to
//! it, a label marking it as localizer-managed, and an annotation recording
//! the controllers that were scaled down for it. A daemon that starts up and
//! finds such a pod left behind can delete it and restore the recorded
//! scale even though the process that created it died ungracefully.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Probe, ResourceRequirements, Service,
    TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use localizer_core::ServiceId;
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::resolver::{find_controllers, ResolvedServicePort};

/// Marks pods created by localizer so an abandoned one can be found later.
pub const MANAGED_LABEL: &str = "localizer.dev/managed";
/// Annotation holding the JSON-encoded list of scaled-down controllers.
pub const CONTROLLERS_ANNOTATION: &str = "localizer.dev/scaled-controllers";

/// The port the sidecar's SSH server listens on.
pub const SSH_PORT: u16 = 2222;
pub const SSH_USER: &str = "localizer";
pub const SSH_PASSWORD: &str = "supersecretpassword";

const SIDECAR_IMAGE: &str = "lscr.io/linuxserver/openssh-server:latest";
const SSH_TUNNEL_MOD: &str = "linuxserver/mods:openssh-server-ssh-tunnel";

/// A controller whose replica count was captured before scale-down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledController {
    /// REST resource plural, `deployments` or `statefulsets`.
    pub resource: String,
    pub namespace: String,
    pub name: String,
    /// Observed `spec.replicas` at capture time.
    pub replicas: i32,
}

impl ScaledController {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.resource, self.namespace, self.name)
    }
}

/// Records every controller backing `svc` along with its current scale.
pub fn capture_controllers(cache: &Cache, svc: &Service) -> Vec<ScaledController> {
    find_controllers(cache, svc)
        .into_iter()
        .map(|controller| ScaledController {
            resource: controller.resource_plural().to_string(),
            namespace: controller.namespace(),
            name: controller.name(),
            replicas: controller.replicas(),
        })
        .collect()
}

/// Builds the sidecar pod spec for one exposure.
pub fn sidecar_pod(
    service: &ServiceId,
    selector: &BTreeMap<String, String>,
    ports: &[ResolvedServicePort],
    controllers: &[ScaledController],
) -> Result<Pod> {
    let mut labels = selector.clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    let controllers_json = serde_json::to_string(controllers)
        .context("failed to encode scaled controllers annotation")?;
    let mut annotations = BTreeMap::new();
    annotations.insert(CONTROLLERS_ANNOTATION.to_string(), controllers_json);

    // The exposed service ports appear as named container ports so that
    // named targetPorts on the service keep resolving against the sidecar.
    let mut container_ports = vec![ContainerPort {
        name: Some("ssh".to_string()),
        container_port: i32::from(SSH_PORT),
        protocol: Some("TCP".to_string()),
        ..ContainerPort::default()
    }];
    for port in ports {
        let name = port
            .original_name
            .clone()
            .or_else(|| port.name.clone())
            .unwrap_or_else(|| port.target_port.to_string());
        container_ports.push(ContainerPort {
            name: Some(name),
            container_port: i32::from(port.target_port),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        });
    }

    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), Quantity("100m".to_string()));
    resources.insert("memory".to_string(), Quantity("100Mi".to_string()));

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("localizer-{}-", service.name)),
            namespace: Some(service.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![Container {
                name: "tunnel".to_string(),
                image: Some(SIDECAR_IMAGE.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(vec![
                    env("DOCKER_MODS", SSH_TUNNEL_MOD),
                    env("PASSWORD_ACCESS", "true"),
                    env("USER_NAME", SSH_USER),
                    env("USER_PASSWORD", SSH_PASSWORD),
                ]),
                ports: Some(container_ports),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(i32::from(SSH_PORT)),
                        ..TCPSocketAction::default()
                    }),
                    ..Probe::default()
                }),
                resources: Some(ResourceRequirements {
                    requests: Some(resources.clone()),
                    limits: Some(resources),
                    ..ResourceRequirements::default()
                }),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    })
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

/// Patches a controller's replica count through the scale subresource.
pub async fn scale(client: &Client, controller: &ScaledController, replicas: i32) -> Result<()> {
    let params = PatchParams::default();
    let patch = Patch::Merge(serde_json::json!({ "spec": { "replicas": replicas } }));

    match controller.resource.as_str() {
        "deployments" => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &controller.namespace);
            api.patch_scale(&controller.name, &params, &patch)
                .await
                .with_context(|| format!("failed to scale {}", controller.key()))?;
        }
        "statefulsets" => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &controller.namespace);
            api.patch_scale(&controller.name, &params, &patch)
                .await
                .with_context(|| format!("failed to scale {}", controller.key()))?;
        }
        other => bail!("unknown controller resource '{other}'"),
    }

    Ok(())
}

/// Deletes leftover sidecar pods from a previous daemon and restores the
/// scale recorded in their annotations. Best-effort on every pod: one bad
/// annotation must not stop the rest of the sweep.
pub async fn sweep_abandoned(client: &Client, namespace: Option<&str>) -> Result<()> {
    let pods: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let selector = format!("{MANAGED_LABEL}=true");
    let abandoned = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .context("failed to list abandoned sidecar pods")?;

    for pod in abandoned {
        let name = pod.name_any();
        let pod_namespace = pod.namespace().unwrap_or_default();
        tracing::warn!(pod = %format!("{pod_namespace}/{name}"), "removing abandoned sidecar pod");

        let scoped: Api<Pod> = Api::namespaced(client.clone(), &pod_namespace);
        if let Err(err) = scoped.delete(&name, &DeleteParams::default()).await {
            tracing::warn!(pod = %name, error = %err, "failed to remove abandoned sidecar pod");
        }

        let Some(raw) = pod
            .annotations()
            .get(CONTROLLERS_ANNOTATION)
            .cloned()
        else {
            continue;
        };
        let controllers: Vec<ScaledController> = match serde_json::from_str(&raw) {
            Ok(controllers) => controllers,
            Err(err) => {
                tracing::warn!(pod = %name, error = %err, "failed to decode scaled controllers annotation");
                continue;
            }
        };

        for controller in controllers {
            match scale(client, &controller, controller.replicas).await {
                Ok(()) => tracing::info!(
                    controller = %controller.key(),
                    replicas = controller.replicas,
                    "restored controller scale"
                ),
                Err(err) => tracing::warn!(
                    controller = %controller.key(),
                    error = %err,
                    "failed to restore controller scale"
                ),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::{mk_deployment, mk_statefulset};
    use maplit::btreemap;

    fn resolved(port: u16, target: u16) -> ResolvedServicePort {
        ResolvedServicePort {
            name: Some("http".to_string()),
            port,
            target_port: target,
            original_name: None,
            local: target,
        }
    }

    #[test]
    fn captures_every_matching_controller_with_its_scale() {
        let cache = Cache::new();
        let labels = btreemap! { "app".to_string() => "api".to_string() };
        cache
            .deployments
            .apply(mk_deployment("demo", "api", labels.clone(), 3, vec![]));
        cache
            .statefulsets
            .apply(mk_statefulset("demo", "api-worker", labels.clone(), 2));

        let svc = crate::resolver::tests::mk_service("demo", "api", vec![], Some(labels));
        let mut captured = capture_controllers(&cache, &svc);
        captured.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(
            captured,
            vec![
                ScaledController {
                    resource: "deployments".to_string(),
                    namespace: "demo".to_string(),
                    name: "api".to_string(),
                    replicas: 3,
                },
                ScaledController {
                    resource: "statefulsets".to_string(),
                    namespace: "demo".to_string(),
                    name: "api-worker".to_string(),
                    replicas: 2,
                },
            ]
        );
    }

    #[test]
    fn sidecar_pod_carries_selector_label_and_annotation() {
        let service = ServiceId::new("demo", "api");
        let selector = btreemap! { "app".to_string() => "api".to_string() };
        let controllers = vec![ScaledController {
            resource: "deployments".to_string(),
            namespace: "demo".to_string(),
            name: "api".to_string(),
            replicas: 3,
        }];

        let pod = sidecar_pod(&service, &selector, &[resolved(80, 8080)], &controllers).unwrap();

        assert_eq!(
            pod.metadata.generate_name.as_deref(),
            Some("localizer-api-")
        );
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("api"));
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));

        // The annotation round-trips back into the captured controllers.
        let raw = pod
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(CONTROLLERS_ANNOTATION)
            .unwrap();
        let decoded: Vec<ScaledController> = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded, controllers);
    }

    #[test]
    fn sidecar_pod_spec_matches_the_ssh_server_contract() {
        let service = ServiceId::new("demo", "api");
        let selector = btreemap! { "app".to_string() => "api".to_string() };
        let pod = sidecar_pod(&service, &selector, &[resolved(80, 8080)], &[]).unwrap();

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("OnFailure"));

        let container = &spec.containers[0];
        let envs = container.env.as_ref().unwrap();
        assert!(envs
            .iter()
            .any(|e| e.name == "PASSWORD_ACCESS" && e.value.as_deref() == Some("true")));
        assert!(envs.iter().any(|e| e.name == "USER_NAME"));
        assert!(envs.iter().any(|e| e.name == "USER_PASSWORD"));

        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(2222)
        );

        let ports = container.ports.as_ref().unwrap();
        assert!(ports.iter().any(|p| p.container_port == 2222));
        assert!(ports
            .iter()
            .any(|p| p.container_port == 8080 && p.name.as_deref() == Some("http")));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap().get("cpu"),
            Some(&Quantity("100m".to_string()))
        );
        assert_eq!(resources.requests, resources.limits);
    }
}
