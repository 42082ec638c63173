//! Services a node exposes and the registry that constructs them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::ConnectionContext;
use crate::durability::ReplicaProbe;
use crate::request::KeyValueRequest;
use crate::retry::RetryOrchestrator;

pub mod key_value;

pub use key_value::KeyValueService;

/// The kinds of services a node can expose.
///
/// Each type owns a stable index used in the node's enabled-services
/// bitset; the index is part of the persisted wire contract and must
/// never change for an existing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// The binary key-value service.
    KeyValue,
    /// The query service.
    Query,
    /// The full-text search service.
    Search,
    /// The analytics service.
    Analytics,
    /// The cluster management service.
    Management,
}

impl ServiceType {
    /// Returns the stable bitset index of this type.
    pub fn index(self) -> u32 {
        match self {
            ServiceType::KeyValue => 0,
            ServiceType::Query => 1,
            ServiceType::Search => 2,
            ServiceType::Analytics => 3,
            ServiceType::Management => 4,
        }
    }

    /// Returns whether instances of this type are scoped to a bucket or
    /// shared across the cluster.
    pub fn scope(self) -> ServiceScope {
        match self {
            ServiceType::KeyValue => ServiceScope::Bucket,
            _ => ServiceScope::Cluster,
        }
    }
}

/// Whether a service instance belongs to one bucket or to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceScope {
    /// One instance per bucket.
    Bucket,
    /// One shared instance per node.
    Cluster,
}

/// The connectivity state of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Constructed but not asked to connect yet.
    Idle = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// The service has a live connection.
    Connected = 2,
    /// Some but not all of the service's connections are live.
    Degraded = 3,
    /// A disconnect was requested and teardown is in progress.
    Disconnecting = 4,
    /// No connection, and none being attempted.
    Disconnected = 5,
}

/// Lock-free cell holding a [`ServiceState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ServiceState {
        match self.0.load(Ordering::SeqCst) {
            0 => ServiceState::Idle,
            1 => ServiceState::Connecting,
            2 => ServiceState::Connected,
            3 => ServiceState::Degraded,
            4 => ServiceState::Disconnecting,
            _ => ServiceState::Disconnected,
        }
    }

    pub(crate) fn store(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Transitions `from -> to` atomically; returns false if the current
    /// state differs.
    pub(crate) fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One service instance on a node.
///
/// `connect` and `disconnect` are non-blocking triggers: they start the
/// transition and return; progress is visible through `state`.
pub trait Service: Send + Sync {
    /// Returns the type of this service.
    fn service_type(&self) -> ServiceType;

    /// Returns the current connectivity state.
    fn state(&self) -> ServiceState;

    /// Starts connecting. A no-op unless the service is idle or
    /// disconnected.
    fn connect(&self);

    /// Starts disconnecting. In-flight requests are cancelled.
    fn disconnect(&self);

    /// Hands a request to this service for dispatch.
    fn dispatch(&self, request: Arc<KeyValueRequest>);
}

/// Everything a service factory needs to build an instance.
#[derive(Clone)]
pub struct ServiceContext {
    /// The host:port the service connects to.
    pub endpoint: String,
    /// Negotiated connection features.
    pub connection: ConnectionContext,
    /// The orchestrator failed dispatches are reported to.
    pub retry: Arc<RetryOrchestrator>,
    /// The probe backing client-verified durability, when available.
    pub probe: Option<Arc<dyn ReplicaProbe>>,
}

/// Constructs a service instance of one type.
pub type ServiceFactory = Box<dyn Fn(&ServiceContext) -> Arc<dyn Service> + Send + Sync>;

/// An open table of service constructors, keyed by type.
///
/// New service types plug in through [`ServiceRegistry::register`] without
/// touching node code.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<ServiceType, ServiceFactory>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in service types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            ServiceType::KeyValue,
            Box::new(|ctx| KeyValueService::new(ctx.clone()) as Arc<dyn Service>),
        );
        registry
    }

    /// Registers (or replaces) the factory for a service type.
    pub fn register(&mut self, service_type: ServiceType, factory: ServiceFactory) {
        self.factories.insert(service_type, factory);
    }

    /// Returns true if a factory exists for the type.
    pub fn supports(&self, service_type: ServiceType) -> bool {
        self.factories.contains_key(&service_type)
    }

    /// Builds a service instance, or `None` if the type is unregistered.
    pub fn create(
        &self,
        service_type: ServiceType,
        context: &ServiceContext,
    ) -> Option<Arc<dyn Service>> {
        self.factories.get(&service_type).map(|factory| factory(context))
    }
}
