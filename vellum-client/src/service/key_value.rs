//! The binary key-value service: one TCP connection driven by an actor
//! task.
//!
//! The actor owns the socket, the framing codec, and the pending map
//! correlating responses to in-flight requests by opaque. Everything else
//! talks to it through the dispatch queue and the shutdown token, so no
//! lock is ever held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use vellum_core::protocol::{frame, PacketCodec};
use vellum_core::{Status, VellumError};

use crate::durability::{Durability, ObservePoller};
use crate::request::{KeyValueRequest, KeyValueResponse};
use crate::retry::RetryReason;
use crate::service::{Service, ServiceContext, ServiceState, ServiceType, StateCell};

type RequestQueue = mpsc::UnboundedReceiver<Arc<KeyValueRequest>>;

/// A key-value service bound to one endpoint.
pub struct KeyValueService {
    context: ServiceContext,
    state: StateCell,
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<KeyValueRequest>>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    me: Weak<KeyValueService>,
}

impl KeyValueService {
    /// Creates the service in the idle state; nothing connects until
    /// [`Service::connect`] is called.
    pub fn new(context: ServiceContext) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            context,
            state: StateCell::new(ServiceState::Idle),
            sender: Mutex::new(None),
            shutdown: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Returns the endpoint this service connects to.
    pub fn endpoint(&self) -> &str {
        &self.context.endpoint
    }

    async fn run(self: Arc<Self>, mut queue: RequestQueue, token: CancellationToken) {
        tracing::debug!(endpoint = %self.context.endpoint, "connecting key-value service");

        let stream = tokio::select! {
            _ = token.cancelled() => {
                self.state.store(ServiceState::Disconnected);
                self.drain_queue(&mut queue);
                return;
            }
            result = TcpStream::connect(&self.context.endpoint) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.context.endpoint,
                        error = %e,
                        "key-value connection failed"
                    );
                    self.state.store(ServiceState::Disconnected);
                    self.drain_queue(&mut queue);
                    return;
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        self.state.store(ServiceState::Connected);
        tracing::debug!(endpoint = %self.context.endpoint, "key-value service connected");

        let mut framed = Framed::new(stream, PacketCodec::new());
        let mut pending: HashMap<u32, Arc<KeyValueRequest>> = HashMap::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    for (_, request) in pending.drain() {
                        request.cancel("service disconnecting");
                    }
                    queue.close();
                    while let Ok(request) = queue.try_recv() {
                        request.cancel("service disconnecting");
                    }
                    self.state.store(ServiceState::Disconnected);
                    tracing::debug!(endpoint = %self.context.endpoint, "key-value service closed");
                    return;
                }
                maybe_request = queue.recv() => match maybe_request {
                    Some(request) => {
                        if request.is_completed() {
                            continue;
                        }
                        if request.record_attempt() == 1 {
                            Self::watch_deadline(request.clone());
                        }
                        let packet = match request.encode(&self.context.connection) {
                            Ok(packet) => packet,
                            Err(e) => {
                                request.fail(e);
                                continue;
                            }
                        };
                        if let Err(e) = framed.send(packet).await {
                            tracing::warn!(
                                endpoint = %self.context.endpoint,
                                error = %e,
                                "write failed, dropping connection"
                            );
                            self.context
                                .retry
                                .maybe_retry(request, RetryReason::ConnectionLost);
                            self.connection_lost(pending, queue);
                            return;
                        }
                        request.mark_dispatched(&self.context.endpoint);
                        pending.insert(request.opaque(), request);
                    }
                    None => {
                        self.state.store(ServiceState::Disconnected);
                        return;
                    }
                },
                incoming = framed.next() => match incoming {
                    Some(Ok(packet)) => self.handle_response(packet, &mut pending),
                    Some(Err(e)) => {
                        tracing::warn!(
                            endpoint = %self.context.endpoint,
                            error = %e,
                            "read failed, dropping connection"
                        );
                        self.connection_lost(pending, queue);
                        return;
                    }
                    None => {
                        tracing::debug!(
                            endpoint = %self.context.endpoint,
                            "connection closed by peer"
                        );
                        self.connection_lost(pending, queue);
                        return;
                    }
                },
            }
        }
    }

    /// Arms the request's deadline. A server that accepts the packet and
    /// never answers would otherwise leave the result slot unfulfilled;
    /// the watcher times the request out wherever it is stuck. Completion
    /// is at-most-once, so a response racing the deadline is harmless.
    fn watch_deadline(request: Arc<KeyValueRequest>) {
        tokio::spawn(async move {
            tokio::time::sleep_until(request.deadline()).await;
            let reason = format!(
                "{} of key {} did not complete within {:?}",
                request.operation().name(),
                request.key(),
                request.timeout()
            );
            if request.fail(VellumError::Timeout(reason)) {
                tracing::debug!(
                    key = %request.key(),
                    attempts = request.attempts(),
                    "request timed out in flight"
                );
            }
        });
    }

    /// The connection died with requests possibly on the wire. In-flight
    /// requests go through the orchestrator as connection losses; queued
    /// but unsent ones were never seen by the server and retry freely.
    fn connection_lost(
        &self,
        mut pending: HashMap<u32, Arc<KeyValueRequest>>,
        mut queue: RequestQueue,
    ) {
        self.state.store(ServiceState::Disconnected);
        for (_, request) in pending.drain() {
            self.context
                .retry
                .maybe_retry(request, RetryReason::ConnectionLost);
        }
        self.drain_queue(&mut queue);
    }

    fn drain_queue(&self, queue: &mut RequestQueue) {
        queue.close();
        while let Ok(request) = queue.try_recv() {
            self.context
                .retry
                .maybe_retry(request, RetryReason::EndpointNotAvailable);
        }
    }

    fn handle_response(
        &self,
        packet: bytes::Bytes,
        pending: &mut HashMap<u32, Arc<KeyValueRequest>>,
    ) {
        if packet.len() < vellum_core::protocol::constants::HEADER_SIZE {
            tracing::warn!("discarding undersized response packet");
            return;
        }
        let opaque = frame::opaque(&packet);
        let request = match pending.remove(&opaque) {
            Some(request) => request,
            None => {
                tracing::trace!(opaque, "response for unknown correlation id, dropping");
                return;
            }
        };

        let response = match request.decode(&packet, &self.context.connection) {
            Ok(response) => response,
            Err(e) => {
                request.fail(e);
                return;
            }
        };

        if response.status.is_transient() {
            let reason = if response.status == Status::NotMyPartition {
                RetryReason::PartitionMoved
            } else {
                RetryReason::TransientFailure
            };
            tracing::debug!(
                key = %request.key(),
                status = ?response.status,
                "transient response, deferring to retry"
            );
            self.context.retry.maybe_retry(request, reason);
            return;
        }

        match response.into_result(request.key()) {
            Err(e) => {
                request.fail(e);
            }
            Ok(response) => {
                if let Durability::ClientVerified {
                    persist_to,
                    replicate_to,
                } = *request.durability()
                {
                    if request.operation().is_mutation() {
                        self.verify_durability(request, response, persist_to, replicate_to);
                        return;
                    }
                }
                request.succeed(response);
            }
        }
    }

    /// The mutation committed on the active node; hold the completion back
    /// until the observed durability matches the requirement.
    fn verify_durability(
        &self,
        request: Arc<KeyValueRequest>,
        response: KeyValueResponse,
        persist_to: crate::durability::PersistTo,
        replicate_to: crate::durability::ReplicateTo,
    ) {
        let probe = match self.context.probe.clone() {
            Some(probe) => probe,
            None => {
                request.fail(VellumError::DurabilityImpossible(
                    "no replica probe is configured for client-verified durability".to_string(),
                ));
                return;
            }
        };
        tokio::spawn(async move {
            let poller = ObservePoller::new(probe);
            let owner = request.clone();
            let outcome = poller
                .enforce(
                    request.key(),
                    request.partition(),
                    response.cas,
                    persist_to,
                    replicate_to,
                    request.deadline(),
                    move || owner.is_completed(),
                )
                .await;
            match outcome {
                Ok(()) => {
                    request.succeed(response);
                }
                Err(e) => {
                    request.fail(e);
                }
            }
        });
    }
}

impl Service for KeyValueService {
    fn service_type(&self) -> ServiceType {
        ServiceType::KeyValue
    }

    fn state(&self) -> ServiceState {
        self.state.load()
    }

    fn connect(&self) {
        let started = self
            .state
            .transition(ServiceState::Idle, ServiceState::Connecting)
            || self
                .state
                .transition(ServiceState::Disconnected, ServiceState::Connecting);
        if !started {
            tracing::debug!(
                endpoint = %self.context.endpoint,
                state = ?self.state.load(),
                "connect ignored in current state"
            );
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut sender) = self.sender.lock() {
            *sender = Some(tx);
        }
        let token = CancellationToken::new();
        if let Ok(mut shutdown) = self.shutdown.lock() {
            *shutdown = Some(token.clone());
        }
        if let Some(me) = self.me.upgrade() {
            tokio::spawn(me.run(rx, token));
        }
    }

    fn disconnect(&self) {
        match self.state.load() {
            ServiceState::Disconnecting | ServiceState::Disconnected => return,
            ServiceState::Idle => {
                self.state.store(ServiceState::Disconnected);
                return;
            }
            _ => {}
        }
        self.state.store(ServiceState::Disconnecting);
        tracing::debug!(endpoint = %self.context.endpoint, "disconnecting key-value service");
        if let Ok(mut sender) = self.sender.lock() {
            *sender = None;
        }
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(token) = shutdown.take() {
                token.cancel();
            }
        }
    }

    fn dispatch(&self, request: Arc<KeyValueRequest>) {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|sender| sender.clone());
        match sender {
            Some(tx) => {
                if let Err(mpsc::error::SendError(request)) = tx.send(request) {
                    self.context
                        .retry
                        .maybe_retry(request, RetryReason::EndpointNotAvailable);
                }
            }
            None => {
                self.context
                    .retry
                    .maybe_retry(request, RetryReason::EndpointNotAvailable);
            }
        }
    }
}
