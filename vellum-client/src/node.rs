//! A node: the set of services running against one cluster member.
//!
//! The node owns service lifecycle (add, remove, disconnect) and routes
//! requests to the right service instance. Structural changes rebuild the
//! service map under one lock and publish it as a fresh snapshot; routing
//! and state reads clone the snapshot handle and never hold the lock
//! while traversing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::request::KeyValueRequest;
use crate::retry::{RetryOrchestrator, RetryReason};
use crate::service::{
    Service, ServiceContext, ServiceRegistry, ServiceScope, ServiceState, ServiceType,
};

/// The scope key under which cluster-wide services are stored.
pub const GLOBAL_SCOPE: &str = "_$GLOBAL$_";

/// Identifies one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentifier {
    host: String,
    port: u16,
}

impl NodeIdentifier {
    /// Creates an identifier from a host and management port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the management port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The aggregate connectivity state of a node, derived from its services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Services exist but none has been asked to connect.
    Idle,
    /// At least one service is connecting and none is usable yet.
    Connecting,
    /// Every service is connected (or idle).
    Connected,
    /// Some services are usable, others are not.
    Degraded,
    /// At least one service is tearing down and none is usable.
    Disconnecting,
    /// No services, or none of them connected.
    Disconnected,
}

/// The outcome of an add-service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddServiceOutcome {
    /// The service was created and asked to connect.
    Added,
    /// A service of this type already exists in the scope.
    AlreadyAdded,
    /// No factory is registered for the type.
    Unsupported,
    /// The node is disconnecting; the call was ignored.
    Ignored,
}

/// The outcome of a remove-service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveServiceOutcome {
    /// The service was removed and asked to disconnect.
    Removed,
    /// No service of this type exists in the scope.
    NotPresent,
    /// The node is disconnecting; the call was ignored.
    Ignored,
}

/// The outcome of a disconnect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Teardown started.
    Initiated,
    /// A previous call already started teardown.
    AlreadyRequested,
}

type ServiceMap = HashMap<String, HashMap<ServiceType, Arc<dyn Service>>>;

/// One cluster member and the services running against it.
pub struct Node {
    identifier: NodeIdentifier,
    registry: Arc<ServiceRegistry>,
    retry: Arc<RetryOrchestrator>,
    services: Mutex<Arc<ServiceMap>>,
    enabled: AtomicU32,
    disconnecting: AtomicBool,
}

impl Node {
    /// Creates a node with no services.
    pub fn new(
        identifier: NodeIdentifier,
        registry: Arc<ServiceRegistry>,
        retry: Arc<RetryOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            registry,
            retry,
            services: Mutex::new(Arc::new(HashMap::new())),
            enabled: AtomicU32::new(0),
            disconnecting: AtomicBool::new(false),
        })
    }

    /// Returns the node's identifier.
    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    /// Returns true if teardown was requested.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Returns true if a service of this type exists in any scope.
    pub fn service_enabled(&self, service_type: ServiceType) -> bool {
        self.enabled.load(Ordering::SeqCst) & (1 << service_type.index()) != 0
    }

    /// Returns true if any service type is enabled on this node.
    pub fn has_services_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) != 0
    }

    fn scope_key<'a>(service_type: ServiceType, bucket: Option<&'a str>) -> &'a str {
        match service_type.scope() {
            ServiceScope::Bucket => bucket.unwrap_or(GLOBAL_SCOPE),
            ServiceScope::Cluster => GLOBAL_SCOPE,
        }
    }

    /// Returns the current published service map.
    fn snapshot(&self) -> Arc<ServiceMap> {
        self.services
            .lock()
            .map(|services| services.clone())
            .unwrap_or_default()
    }

    /// Looks up the service instance routing would use.
    pub fn service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<Arc<dyn Service>> {
        let scope = Self::scope_key(service_type, bucket);
        self.snapshot().get(scope)?.get(&service_type).cloned()
    }

    /// Adds a service of the given type and starts connecting it.
    ///
    /// Idempotent: repeated calls for the same type and scope report
    /// [`AddServiceOutcome::AlreadyAdded`] without side effects.
    pub fn add_service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
        context: &ServiceContext,
    ) -> AddServiceOutcome {
        if self.is_disconnecting() {
            tracing::debug!(
                node = %self.identifier,
                ?service_type,
                "ignoring add_service on a disconnecting node"
            );
            return AddServiceOutcome::Ignored;
        }

        let scope = Self::scope_key(service_type, bucket).to_string();
        let service = {
            let mut published = match self.services.lock() {
                Ok(published) => published,
                Err(_) => return AddServiceOutcome::Ignored,
            };
            if published
                .get(&scope)
                .is_some_and(|in_scope| in_scope.contains_key(&service_type))
            {
                return AddServiceOutcome::AlreadyAdded;
            }
            let service = match self.registry.create(service_type, context) {
                Some(service) => service,
                None => return AddServiceOutcome::Unsupported,
            };
            let mut rebuilt = (**published).clone();
            rebuilt
                .entry(scope.clone())
                .or_default()
                .insert(service_type, service.clone());
            *published = Arc::new(rebuilt);
            self.enabled
                .fetch_or(1 << service_type.index(), Ordering::SeqCst);
            service
        };

        tracing::info!(
            node = %self.identifier,
            ?service_type,
            scope = %scope,
            "service added"
        );
        service.connect();
        AddServiceOutcome::Added
    }

    /// Removes a service and starts disconnecting it.
    pub fn remove_service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> RemoveServiceOutcome {
        if self.is_disconnecting() {
            tracing::debug!(
                node = %self.identifier,
                ?service_type,
                "ignoring remove_service on a disconnecting node"
            );
            return RemoveServiceOutcome::Ignored;
        }

        let scope = Self::scope_key(service_type, bucket);
        let removed = {
            let mut published = match self.services.lock() {
                Ok(published) => published,
                Err(_) => return RemoveServiceOutcome::Ignored,
            };
            let mut rebuilt = (**published).clone();
            let removed = rebuilt
                .get_mut(scope)
                .and_then(|in_scope| in_scope.remove(&service_type));
            if removed.is_some() {
                // The bit clears on every removal, even when another scope
                // still holds a service of this type.
                self.enabled
                    .fetch_and(!(1 << service_type.index()), Ordering::SeqCst);
                *published = Arc::new(rebuilt);
            }
            removed
        };

        match removed {
            Some(service) => {
                tracing::info!(
                    node = %self.identifier,
                    ?service_type,
                    scope = %scope,
                    "service removed"
                );
                service.disconnect();
                RemoveServiceOutcome::Removed
            }
            None => RemoveServiceOutcome::NotPresent,
        }
    }

    /// Starts tearing down every service. Only the first call acts; the
    /// node never reconnects afterwards.
    pub fn disconnect(&self) -> DisconnectOutcome {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            tracing::debug!(node = %self.identifier, "disconnect already requested");
            return DisconnectOutcome::AlreadyRequested;
        }

        tracing::info!(node = %self.identifier, "disconnecting node");
        for in_scope in self.snapshot().values() {
            for service in in_scope.values() {
                service.disconnect();
            }
        }
        DisconnectOutcome::Initiated
    }

    /// Routes a key-value request to this node's service for the bucket.
    ///
    /// A missing or unregistered service hands the request to the retry
    /// orchestrator instead of failing it outright; the topology may
    /// still be converging.
    pub fn send(&self, request: Arc<KeyValueRequest>, bucket: Option<&str>) {
        match self.service(ServiceType::KeyValue, bucket) {
            Some(service) => service.dispatch(request),
            None => {
                tracing::debug!(
                    node = %self.identifier,
                    key = %request.key(),
                    "no key-value service for this bucket, deferring to retry"
                );
                self.retry
                    .maybe_retry(request, RetryReason::EndpointNotAvailable);
            }
        }
    }

    /// Derives the node's aggregate state from its services' states.
    pub fn state(&self) -> NodeState {
        let states: Vec<ServiceState> = self
            .snapshot()
            .values()
            .flat_map(|in_scope| in_scope.values().map(|s| s.state()))
            .collect();

        if states.is_empty() {
            return NodeState::Disconnected;
        }
        let total = states.len();
        let count = |wanted: ServiceState| states.iter().filter(|s| **s == wanted).count();
        let idle = count(ServiceState::Idle);
        let connected = count(ServiceState::Connected);
        let connecting = count(ServiceState::Connecting);
        let disconnecting = count(ServiceState::Disconnecting);
        let degraded = count(ServiceState::Degraded);

        if idle == total {
            NodeState::Idle
        } else if connected + idle == total {
            NodeState::Connected
        } else if connected > 0 || degraded > 0 {
            NodeState::Degraded
        } else if connecting > 0 {
            NodeState::Connecting
        } else if disconnecting > 0 {
            NodeState::Disconnecting
        } else {
            NodeState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    use crate::config::ConnectionContext;
    use crate::request::{Operation, RequestOptions};
    use crate::retry::FailFastRetryPolicy;
    use crate::service::key_value::tests::StubService;
    use crate::VellumError;

    /// A registry whose factories hand out stubs and record them for the
    /// test to drive.
    fn stub_registry(created: Arc<Mutex<Vec<Arc<StubService>>>>) -> Arc<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        for service_type in [
            ServiceType::KeyValue,
            ServiceType::Query,
            ServiceType::Search,
        ] {
            let created = created.clone();
            registry.register(
                service_type,
                Box::new(move |_| {
                    let stub = Arc::new(StubService::new(service_type));
                    created.lock().unwrap().push(stub.clone());
                    stub as Arc<dyn Service>
                }),
            );
        }
        Arc::new(registry)
    }

    fn test_context() -> ServiceContext {
        ServiceContext {
            endpoint: "127.0.0.1:11210".to_string(),
            connection: ConnectionContext::builder("b").build(),
            retry: Arc::new(RetryOrchestrator::new(Arc::new(|_| {}))),
            probe: None,
        }
    }

    fn test_node() -> (Arc<Node>, Arc<Mutex<Vec<Arc<StubService>>>>) {
        let created = Arc::new(Mutex::new(Vec::new()));
        let node = Node::new(
            NodeIdentifier::new("10.0.0.1", 8091),
            stub_registry(created.clone()),
            Arc::new(RetryOrchestrator::new(Arc::new(|_| {}))),
        );
        (node, created)
    }

    #[test]
    fn test_identifier_display() {
        let id = NodeIdentifier::new("db1.example.com", 8091);
        assert_eq!(id.to_string(), "db1.example.com:8091");
    }

    #[test]
    fn test_add_service_is_idempotent() {
        let (node, _) = test_node();
        let ctx = test_context();
        assert_eq!(
            node.add_service(ServiceType::KeyValue, Some("travel"), &ctx),
            AddServiceOutcome::Added
        );
        assert_eq!(
            node.add_service(ServiceType::KeyValue, Some("travel"), &ctx),
            AddServiceOutcome::AlreadyAdded
        );
        assert!(node.service_enabled(ServiceType::KeyValue));
    }

    #[test]
    fn test_bucket_scoping_separates_instances() {
        let (node, created) = test_node();
        let ctx = test_context();
        assert_eq!(
            node.add_service(ServiceType::KeyValue, Some("travel"), &ctx),
            AddServiceOutcome::Added
        );
        assert_eq!(
            node.add_service(ServiceType::KeyValue, Some("beer"), &ctx),
            AddServiceOutcome::Added
        );
        assert_eq!(created.lock().unwrap().len(), 2);
        assert!(node.service(ServiceType::KeyValue, Some("travel")).is_some());
        assert!(node.service(ServiceType::KeyValue, Some("beer")).is_some());
        assert!(node.service(ServiceType::KeyValue, Some("other")).is_none());
    }

    #[test]
    fn test_cluster_scoped_service_shared_across_buckets() {
        let (node, created) = test_node();
        let ctx = test_context();
        assert_eq!(
            node.add_service(ServiceType::Query, Some("travel"), &ctx),
            AddServiceOutcome::Added
        );
        // The bucket is irrelevant for cluster scope.
        assert_eq!(
            node.add_service(ServiceType::Query, Some("beer"), &ctx),
            AddServiceOutcome::AlreadyAdded
        );
        assert_eq!(created.lock().unwrap().len(), 1);
        assert!(node.service(ServiceType::Query, None).is_some());
        assert!(node.service(ServiceType::Query, Some("anything")).is_some());
    }

    #[test]
    fn test_unregistered_type_is_unsupported() {
        let (node, _) = test_node();
        assert_eq!(
            node.add_service(ServiceType::Analytics, None, &test_context()),
            AddServiceOutcome::Unsupported
        );
        assert!(!node.service_enabled(ServiceType::Analytics));
    }

    #[test]
    fn test_remove_service_clears_enabled_bit() {
        let (node, _) = test_node();
        let ctx = test_context();
        node.add_service(ServiceType::KeyValue, Some("travel"), &ctx);
        node.add_service(ServiceType::KeyValue, Some("beer"), &ctx);

        assert_eq!(
            node.remove_service(ServiceType::KeyValue, Some("travel")),
            RemoveServiceOutcome::Removed
        );
        // Any removal clears the bit; the other scope keeps its instance.
        assert!(!node.service_enabled(ServiceType::KeyValue));
        assert!(node.service(ServiceType::KeyValue, Some("beer")).is_some());

        assert_eq!(
            node.remove_service(ServiceType::KeyValue, Some("beer")),
            RemoveServiceOutcome::Removed
        );
        assert_eq!(
            node.remove_service(ServiceType::KeyValue, Some("beer")),
            RemoveServiceOutcome::NotPresent
        );
    }

    #[test]
    fn test_has_services_enabled() {
        let (node, _) = test_node();
        assert!(!node.has_services_enabled());

        node.add_service(ServiceType::KeyValue, Some("travel"), &test_context());
        assert!(node.has_services_enabled());

        node.remove_service(ServiceType::KeyValue, Some("travel"));
        assert!(!node.has_services_enabled());
    }

    #[test]
    fn test_disconnect_only_acts_once() {
        let (node, created) = test_node();
        node.add_service(ServiceType::KeyValue, Some("travel"), &test_context());

        assert_eq!(node.disconnect(), DisconnectOutcome::Initiated);
        assert_eq!(node.disconnect(), DisconnectOutcome::AlreadyRequested);
        assert_eq!(
            created.lock().unwrap()[0].state(),
            ServiceState::Disconnected
        );
    }

    #[test]
    fn test_lifecycle_calls_ignored_while_disconnecting() {
        let (node, _) = test_node();
        node.disconnect();
        assert_eq!(
            node.add_service(ServiceType::KeyValue, Some("b"), &test_context()),
            AddServiceOutcome::Ignored
        );
        assert_eq!(
            node.remove_service(ServiceType::KeyValue, Some("b")),
            RemoveServiceOutcome::Ignored
        );
    }

    #[test]
    fn test_send_routes_to_service() {
        let (node, created) = test_node();
        node.add_service(ServiceType::KeyValue, Some("travel"), &test_context());

        let (request, _rx) = KeyValueRequest::new(Operation::Get, "k", RequestOptions::new());
        node.send(request, Some("travel"));
        assert_eq!(
            created.lock().unwrap()[0]
                .dispatched
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_send_without_service_defers_to_retry() {
        let dispatched = Arc::new(TestCounter::new(0));
        let counter = dispatched.clone();
        let node = Node::new(
            NodeIdentifier::new("h", 1),
            Arc::new(ServiceRegistry::new()),
            Arc::new(RetryOrchestrator::new(Arc::new(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }))),
        );

        let (request, rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new().retry_policy(Arc::new(FailFastRetryPolicy)),
        );
        node.send(request, Some("travel"));
        assert!(matches!(rx.await.unwrap(), Err(VellumError::Cancelled(_))));
        assert_eq!(dispatched.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    // state aggregation

    fn node_with_states(states: &[ServiceState]) -> Arc<Node> {
        let (node, created) = test_node();
        let ctx = test_context();
        let buckets: Vec<String> = (0..states.len()).map(|i| format!("b{}", i)).collect();
        for bucket in &buckets {
            node.add_service(ServiceType::KeyValue, Some(bucket), &ctx);
        }
        let created = created.lock().unwrap();
        for (stub, state) in created.iter().zip(states) {
            stub.set_state(*state);
        }
        drop(created);
        node
    }

    #[test]
    fn test_state_no_services_is_disconnected() {
        let (node, _) = test_node();
        assert_eq!(node.state(), NodeState::Disconnected);
    }

    #[test]
    fn test_state_all_idle() {
        let node = node_with_states(&[ServiceState::Idle, ServiceState::Idle]);
        assert_eq!(node.state(), NodeState::Idle);
    }

    #[test]
    fn test_state_connected_with_idle_mixture() {
        let node = node_with_states(&[ServiceState::Connected, ServiceState::Idle]);
        assert_eq!(node.state(), NodeState::Connected);

        let node = node_with_states(&[ServiceState::Connected, ServiceState::Connected]);
        assert_eq!(node.state(), NodeState::Connected);
    }

    #[test]
    fn test_state_partially_connected_is_degraded() {
        let node = node_with_states(&[ServiceState::Connected, ServiceState::Connecting]);
        assert_eq!(node.state(), NodeState::Degraded);

        let node = node_with_states(&[ServiceState::Degraded, ServiceState::Disconnected]);
        assert_eq!(node.state(), NodeState::Degraded);
    }

    #[test]
    fn test_state_connecting() {
        let node = node_with_states(&[ServiceState::Connecting, ServiceState::Disconnected]);
        assert_eq!(node.state(), NodeState::Connecting);
    }

    #[test]
    fn test_state_disconnecting() {
        let node = node_with_states(&[ServiceState::Disconnecting, ServiceState::Disconnected]);
        assert_eq!(node.state(), NodeState::Disconnecting);
    }

    #[test]
    fn test_state_all_disconnected() {
        let node = node_with_states(&[ServiceState::Disconnected, ServiceState::Disconnected]);
        assert_eq!(node.state(), NodeState::Disconnected);
    }
}
