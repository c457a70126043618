//! The reconciler: a single-threaded loop translating cache events into
//! worker requests.
//!
//! Service and Endpoints events both enqueue the service's `namespace/name`
//! key onto a rate-limited queue. Keys are debounced and coalesced, so an
//! event burst for one service collapses into a single reconciliation, and a
//! key that keeps failing is retried with exponential backoff a bounded
//! number of times before the queue forgets it; the next external event
//! re-triggers it.

use std::task::Poll;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use futures::future::poll_fn;
use k8s_openapi::api::core::v1::Service;
use localizer_core::{PodId, PortPair, ServiceId};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::cache::{object_key, Cache};
use crate::resolver;
use crate::worker::{
    CreateForward, DeleteForward, ForwardRequest, ForwardState, ForwardStatus, WorkerHandle,
};

/// Debounce applied to fresh enqueues so event bursts coalesce.
const DEBOUNCE: Duration = Duration::from_millis(200);
/// First retry delay; doubles on every subsequent retry.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Retries per key before the queue gives up on it.
const MAX_RETRIES: u32 = 5;

/// A coalescing delay queue with per-key exponential backoff.
pub struct RateLimitQueue {
    queue: DelayQueue<String>,
    pending: AHashMap<String, Key>,
    attempts: AHashMap<String, u32>,
}

impl RateLimitQueue {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            pending: AHashMap::new(),
            attempts: AHashMap::new(),
        }
    }

    /// Schedules `key` after the debounce window. A key already queued is
    /// left alone, which is what coalesces event bursts.
    pub fn enqueue(&mut self, key: &str) {
        if self.pending.contains_key(key) {
            return;
        }
        let handle = self.queue.insert(key.to_string(), DEBOUNCE);
        self.pending.insert(key.to_string(), handle);
    }

    /// Schedules a retry with backoff. Returns false once the key has used up
    /// its retry budget; the caller should drop it.
    pub fn requeue(&mut self, key: &str) -> bool {
        if self.pending.contains_key(key) {
            return true;
        }

        let attempts = self.attempts.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts > MAX_RETRIES {
            self.attempts.remove(key);
            return false;
        }

        let delay = Self::backoff(*attempts);
        let handle = self.queue.insert(key.to_string(), delay);
        self.pending.insert(key.to_string(), handle);
        true
    }

    /// Clears the retry counter after a successful reconciliation.
    pub fn forget(&mut self, key: &str) {
        self.attempts.remove(key);
    }

    fn backoff(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(1 << (attempt.saturating_sub(1)).min(16));
        exp.min(BACKOFF_MAX)
    }

    /// The next expired key. Pends while the queue is empty; callers poll
    /// this inside a select alongside the event sources that feed it.
    pub async fn next(&mut self) -> String {
        poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let key = expired.into_inner();
                self.pending.remove(&key);
                Poll::Ready(key)
            }
            _ => Poll::Pending,
        })
        .await
    }
}

impl Default for RateLimitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// DNS suffix for fully-qualified service names, e.g. `cluster.local`.
    pub cluster_domain: String,
    /// Namespaces whose services are never forwarded.
    pub skip_namespaces: AHashSet<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let mut skip_namespaces = AHashSet::new();
        skip_namespaces.insert("kube-system".to_string());
        Self {
            cluster_domain: "cluster.local".to_string(),
            skip_namespaces,
        }
    }
}

pub struct Reconciler {
    cache: Cache,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(cache: Cache, config: ReconcilerConfig) -> Self {
        Self { cache, config }
    }

    /// Drains events until shutdown. The dequeue loop is deliberately
    /// single-threaded; widening it is a knob nothing needs yet.
    pub async fn run(self, worker: WorkerHandle, shutdown: CancellationToken) {
        let mut service_events = self.cache.services.subscribe();
        let mut endpoint_events = self.cache.endpoints.subscribe();
        let mut queue = RateLimitQueue::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = service_events.recv() => match event {
                    Some(event) => queue.enqueue(&object_key(event.object().as_ref())),
                    None => return,
                },
                event = endpoint_events.recv() => match event {
                    Some(event) => queue.enqueue(&object_key(event.object().as_ref())),
                    None => return,
                },
                key = queue.next() => {
                    let current = worker.get(&key);
                    match self.desired(&key, current.as_ref()) {
                        None => queue.forget(&key),
                        Some(request) => match worker.try_request(request) {
                            Ok(()) => queue.forget(&key),
                            Err(request) => {
                                tracing::warn!(%key, "worker queue is full, retrying");
                                if !queue.requeue(&key) {
                                    tracing::warn!(%key, "giving up on key until the next event");
                                    let _ = request;
                                }
                            }
                        },
                    }
                }
            }
        }
    }

    /// Computes the request (if any) that brings the forward for `key` in
    /// line with the cached cluster state.
    pub fn desired(&self, key: &str, current: Option<&ForwardState>) -> Option<ForwardRequest> {
        let service = parse_key(key)?;

        let Some(svc) = self.cache.services.get(key) else {
            return Some(delete(service));
        };
        if svc.metadata.deletion_timestamp.is_some() {
            return Some(delete(service));
        }

        if self.skipped(&svc) {
            // A connection for a now-skipped service is torn down rather
            // than left dangling.
            return current.is_some().then(|| delete(service));
        }

        match current {
            None => self.build_create(&service, &svc, false, None),
            Some(state) => match state.status {
                ForwardStatus::Recreating => None,
                ForwardStatus::Waiting => {
                    if self.first_endpoint(key).is_none() {
                        return None;
                    }
                    self.build_create(
                        &service,
                        &svc,
                        true,
                        Some("endpoint became available".to_string()),
                    )
                }
                ForwardStatus::Running => {
                    let pod = state.endpoint.as_ref()?;
                    if self.endpoint_alive(key, pod) {
                        return None;
                    }
                    self.build_create(
                        &service,
                        &svc,
                        true,
                        Some(format!("endpoints '{}' was removed", pod.key())),
                    )
                }
            },
        }
    }

    fn build_create(
        &self,
        service: &ServiceId,
        svc: &Service,
        recreate: bool,
        reason: Option<String>,
    ) -> Option<ForwardRequest> {
        let resolved = resolver::resolve_service_ports(&self.cache, svc);
        if resolved.is_empty() {
            tracing::debug!(service = %service, "service has no forwardable ports");
            return None;
        }
        let ports: Vec<PortPair> = resolved
            .iter()
            .map(|p| PortPair::new(p.port, p.target_port))
            .collect();

        let endpoint = self.first_endpoint(&service.key());
        let hostnames = self.hostnames(service, endpoint.as_ref());

        Some(ForwardRequest::Create(CreateForward {
            service: service.clone(),
            ports,
            hostnames,
            endpoint,
            recreate,
            reason,
        }))
    }

    /// The DNS names bound to a forward: the four service forms always, plus
    /// the `<pod>.<service>` forms when a Pod endpoint backs the service.
    fn hostnames(&self, service: &ServiceId, pod: Option<&PodId>) -> Vec<String> {
        let ns = &service.namespace;
        let domain = &self.config.cluster_domain;

        let mut names = vec![
            service.name.clone(),
            format!("{}.{ns}", service.name),
            format!("{}.{ns}.svc", service.name),
            format!("{}.{ns}.svc.{domain}", service.name),
        ];
        if let Some(pod) = pod {
            let base = format!("{}.{}", pod.name, service.name);
            names.push(base.clone());
            names.push(format!("{base}.{ns}"));
            names.push(format!("{base}.{ns}.svc"));
            names.push(format!("{base}.{ns}.svc.{domain}"));
        }
        names
    }

    fn first_endpoint(&self, key: &str) -> Option<PodId> {
        self.cache
            .endpoints
            .get(key)
            .and_then(|ep| resolver::first_pod_endpoint(&ep))
    }

    fn endpoint_alive(&self, key: &str, pod: &PodId) -> bool {
        self.cache
            .endpoints
            .get(key)
            .map(|ep| resolver::pod_endpoints(&ep).contains(pod))
            .unwrap_or(false)
    }

    fn skipped(&self, svc: &Service) -> bool {
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        if name == "kubernetes" || self.config.skip_namespaces.contains(namespace) {
            return true;
        }

        let Some(spec) = svc.spec.as_ref() else {
            return true;
        };
        // ExternalName services have nothing to tunnel to, and headless
        // services are only meaningful in expose mode.
        if spec.type_.as_deref() == Some("ExternalName") {
            return true;
        }
        if spec.cluster_ip.as_deref() == Some("None") {
            return true;
        }
        match spec.selector.as_ref() {
            None => true,
            Some(selector) => selector.is_empty(),
        }
    }
}

fn parse_key(key: &str) -> Option<ServiceId> {
    let (namespace, name) = key.split_once('/')?;
    Some(ServiceId::new(namespace, name))
}

fn delete(service: ServiceId) -> ForwardRequest {
    ForwardRequest::Delete(DeleteForward {
        service,
        shutdown: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::{mk_endpoints, mk_port, mk_service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn reconciler(cache: &Cache) -> Reconciler {
        Reconciler::new(cache.clone(), ReconcilerConfig::default())
    }

    fn forwardable(
        namespace: &str,
        name: &str,
        ports: Vec<k8s_openapi::api::core::v1::ServicePort>,
    ) -> Service {
        mk_service(
            namespace,
            name,
            ports,
            Some(maplit::btreemap! { "app".to_string() => name.to_string() }),
        )
    }

    fn running_state(endpoint: Option<PodId>) -> ForwardState {
        ForwardState {
            service: ServiceId::new("demo", "api"),
            endpoint,
            status: ForwardStatus::Running,
            reason: String::new(),
            ip: Some("127.0.0.2".parse().unwrap()),
            hostnames: vec!["api".to_string()],
            ports: vec![PortPair::new(80, 8080)],
        }
    }

    #[test]
    fn fresh_service_yields_a_create_with_all_hostnames() {
        let cache = Cache::new();
        cache.services.apply(forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        ));
        cache
            .endpoints
            .apply(mk_endpoints("demo", "api", vec!["api-0"], vec![]));

        let request = reconciler(&cache).desired("demo/api", None).unwrap();
        let ForwardRequest::Create(create) = request else {
            panic!("expected a create");
        };
        assert!(!create.recreate);
        assert_eq!(create.ports, vec![PortPair::new(80, 8080)]);
        assert_eq!(create.endpoint, Some(PodId::new("demo", "api-0")));
        assert_eq!(
            create.hostnames,
            vec![
                "api",
                "api.demo",
                "api.demo.svc",
                "api.demo.svc.cluster.local",
                "api-0.api",
                "api-0.api.demo",
                "api-0.api.demo.svc",
                "api-0.api.demo.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn services_without_pod_endpoints_get_only_service_names() {
        let cache = Cache::new();
        cache.services.apply(forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        ));

        let request = reconciler(&cache).desired("demo/api", None).unwrap();
        let ForwardRequest::Create(create) = request else {
            panic!("expected a create");
        };
        assert_eq!(create.endpoint, None);
        assert_eq!(create.hostnames.len(), 4);
    }

    #[test]
    fn absent_service_yields_a_delete() {
        let cache = Cache::new();
        let request = reconciler(&cache).desired("demo/api", None).unwrap();
        assert!(matches!(request, ForwardRequest::Delete(_)));
    }

    #[test]
    fn terminating_service_yields_a_delete() {
        let cache = Cache::new();
        let mut svc = forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        );
        svc.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        cache.services.apply(svc);

        let request = reconciler(&cache).desired("demo/api", None).unwrap();
        assert!(matches!(request, ForwardRequest::Delete(_)));
    }

    #[test]
    fn filtered_services_are_ignored() {
        let cache = Cache::new();
        let rec = reconciler(&cache);

        cache.services.apply(mk_service(
            "default",
            "kubernetes",
            vec![mk_port(None, 443, Some(IntOrString::Int(443)))],
            None,
        ));
        assert!(rec.desired("default/kubernetes", None).is_none());

        cache.services.apply(mk_service(
            "kube-system",
            "kube-dns",
            vec![mk_port(None, 53, Some(IntOrString::Int(53)))],
            None,
        ));
        assert!(rec.desired("kube-system/kube-dns", None).is_none());

        let mut headless = forwardable(
            "demo",
            "db",
            vec![mk_port(None, 5432, Some(IntOrString::Int(5432)))],
        );
        headless.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        cache.services.apply(headless);
        assert!(rec.desired("demo/db", None).is_none());

        let mut external = forwardable("demo", "ext", vec![]);
        external.spec.as_mut().unwrap().type_ = Some("ExternalName".to_string());
        cache.services.apply(external);
        assert!(rec.desired("demo/ext", None).is_none());
    }

    #[test]
    fn waiting_forward_recreates_when_an_endpoint_appears() {
        let cache = Cache::new();
        cache.services.apply(forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        ));
        let rec = reconciler(&cache);

        let mut waiting = running_state(None);
        waiting.status = ForwardStatus::Waiting;
        waiting.ip = None;

        // Still no endpoints: nothing to do.
        assert!(rec.desired("demo/api", Some(&waiting)).is_none());

        cache
            .endpoints
            .apply(mk_endpoints("demo", "api", vec!["api-0"], vec![]));
        let request = rec.desired("demo/api", Some(&waiting)).unwrap();
        let ForwardRequest::Create(create) = request else {
            panic!("expected a create");
        };
        assert!(create.recreate);
        assert_eq!(create.reason.as_deref(), Some("endpoint became available"));
    }

    #[test]
    fn running_forward_recreates_when_its_pod_disappears() {
        let cache = Cache::new();
        cache.services.apply(forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        ));
        cache
            .endpoints
            .apply(mk_endpoints("demo", "api", vec!["api-1"], vec![]));
        let rec = reconciler(&cache);

        let state = running_state(Some(PodId::new("demo", "api-0")));
        let request = rec.desired("demo/api", Some(&state)).unwrap();
        let ForwardRequest::Create(create) = request else {
            panic!("expected a create");
        };
        assert!(create.recreate);
        assert_eq!(
            create.reason.as_deref(),
            Some("endpoints 'demo/api-0' was removed")
        );

        // The surviving pod is still listed: leave the forward alone.
        let healthy = running_state(Some(PodId::new("demo", "api-1")));
        assert!(rec.desired("demo/api", Some(&healthy)).is_none());
    }

    #[test]
    fn recreating_forwards_are_left_alone() {
        let cache = Cache::new();
        cache.services.apply(forwardable(
            "demo",
            "api",
            vec![mk_port(None, 80, Some(IntOrString::Int(8080)))],
        ));
        let mut state = running_state(None);
        state.status = ForwardStatus::Recreating;
        assert!(reconciler(&cache).desired("demo/api", Some(&state)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_of_enqueues_coalesce_to_one_pop() {
        let mut queue = RateLimitQueue::new();
        for _ in 0..10 {
            queue.enqueue("demo/api");
        }

        let key = queue.next().await;
        assert_eq!(key, "demo/api");

        // Nothing else is queued.
        let nothing =
            tokio::time::timeout(Duration::from_secs(120), queue.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn requeues_back_off_and_are_bounded() {
        let mut queue = RateLimitQueue::new();
        for attempt in 1..=MAX_RETRIES {
            assert!(queue.requeue("demo/api"), "attempt {attempt} should queue");
            let key = queue.next().await;
            assert_eq!(key, "demo/api");
        }
        assert!(!queue.requeue("demo/api"));

        // Forgetting resets the budget.
        queue.forget("demo/api");
        assert!(queue.requeue("demo/api"));
    }

    #[test]
    fn backoff_grows_exponentially_to_a_cap() {
        assert_eq!(RateLimitQueue::backoff(1), Duration::from_secs(1));
        assert_eq!(RateLimitQueue::backoff(2), Duration::from_secs(2));
        assert_eq!(RateLimitQueue::backoff(3), Duration::from_secs(4));
        assert_eq!(RateLimitQueue::backoff(10), BACKOFF_MAX);
    }
}
