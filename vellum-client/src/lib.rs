//! Client-side core for the Vellum distributed document database.
//!
//! This crate owns the moving parts of a cluster client: nodes and their
//! services, request dispatch over the binary key-value protocol, retry
//! orchestration, and durability enforcement. The wire protocol itself
//! lives in `vellum-core`; topology discovery and the public document API
//! sit above this crate.

#![warn(missing_docs)]

pub mod config;
pub mod durability;
pub mod node;
pub mod request;
pub mod retry;
pub mod service;

pub use config::{CompressionConfig, ConnectionContext};
pub use durability::{
    Durability, DurabilityLevel, ObservePoller, PersistTo, ReplicaProbe, ReplicateTo,
};
pub use node::{Node, NodeIdentifier, NodeState};
pub use request::{KeyValueRequest, KeyValueResponse, Operation, RequestOptions};
pub use retry::{
    BestEffortRetryPolicy, FailFastRetryPolicy, RetryConfig, RetryOrchestrator, RetryPolicy,
    RetryReason,
};
pub use service::{KeyValueService, Service, ServiceRegistry, ServiceState, ServiceType};
pub use vellum_core::{Expiry, MutationToken, Result, Status, SubdocError, VellumError};
