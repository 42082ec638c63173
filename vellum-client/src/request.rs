//! In-flight key-value requests and their decoded responses.
//!
//! A request is immutable after construction apart from its routing
//! partition, its attempt counter, and its one-shot result slot. Every
//! request completes exactly once: via the response path, the retry
//! orchestrator's timeout, or cancellation; later completions are
//! silently dropped.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use vellum_core::protocol::constants::DATATYPE_COMPRESSED;
use vellum_core::protocol::{compression, frame, subdoc};
use vellum_core::{Expiry, MutationToken, Opcode, Result, Status, VellumError};
use vellum_core::protocol::subdoc::{SubdocCommand, SubdocReply};

use crate::config::{self, ConnectionContext};
use crate::durability::Durability;
use crate::retry::{BestEffortRetryPolicy, RetryPolicy};

static NEXT_OPAQUE: AtomicU32 = AtomicU32::new(1);

/// Allocates the next correlation id for an outgoing request.
fn next_opaque() -> u32 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// The logical key-value operation a request performs.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Fetch a document.
    Get,
    /// Store a document unconditionally (or by cas).
    Upsert {
        /// Opaque caller flags stored alongside the document.
        flags: u32,
        /// Document expiry.
        expiry: Expiry,
    },
    /// Append raw bytes to an existing document.
    Append,
    /// Prepend raw bytes to an existing document.
    Prepend,
    /// Delete a document.
    Delete,
    /// Multi-command sub-document lookup.
    SubdocLookup {
        /// Ordered path-level commands.
        commands: Vec<SubdocCommand>,
    },
    /// Multi-command sub-document mutation.
    SubdocMutate {
        /// Ordered path-level commands.
        commands: Vec<SubdocCommand>,
    },
}

impl Operation {
    fn opcode(&self) -> Opcode {
        match self {
            Operation::Get => Opcode::Get,
            Operation::Upsert { .. } => Opcode::Set,
            Operation::Append => Opcode::Append,
            Operation::Prepend => Opcode::Prepend,
            Operation::Delete => Opcode::Delete,
            Operation::SubdocLookup { .. } => Opcode::SubdocMultiLookup,
            Operation::SubdocMutate { .. } => Opcode::SubdocMultiMutation,
        }
    }

    /// Returns true if the operation changes document state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Get | Operation::SubdocLookup { .. })
    }

    fn carries_payload(&self) -> bool {
        matches!(
            self,
            Operation::Upsert { .. } | Operation::Append | Operation::Prepend
        )
    }

    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Upsert { .. } => "upsert",
            Operation::Append => "append",
            Operation::Prepend => "prepend",
            Operation::Delete => "delete",
            Operation::SubdocLookup { .. } => "subdoc_lookup",
            Operation::SubdocMutate { .. } => "subdoc_mutate",
        }
    }
}

/// Per-request options beyond the operation itself.
pub struct RequestOptions {
    timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    cas: u64,
    payload: Bytes,
    durability: Durability,
    collection: Option<Bytes>,
}

impl RequestOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the compare-and-swap token the server must match.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the value payload for store operations.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the encoded collection prefix for the key.
    pub fn collection(mut self, prefix: impl Into<Bytes>) -> Self {
        self.collection = Some(prefix.into());
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: config::default_request_timeout(),
            retry_policy: Arc::new(BestEffortRetryPolicy::default()),
            cas: 0,
            payload: Bytes::new(),
            durability: Durability::None,
            collection: None,
        }
    }
}

/// The one-shot completion slot of a request.
#[derive(Debug)]
struct ResultSlot {
    completed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Result<KeyValueResponse>>>>,
}

impl ResultSlot {
    fn complete(&self, result: Result<KeyValueResponse>) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut tx) = self.tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(result);
            }
        }
        true
    }
}

/// A single key-value request over its whole lifetime, shared between the
/// dispatching service, the retry orchestrator, and the durability poller.
pub struct KeyValueRequest {
    operation: Operation,
    key: String,
    opaque: u32,
    partition: AtomicU16,
    cas: u64,
    payload: Bytes,
    durability: Durability,
    collection: Option<Bytes>,
    timeout: Duration,
    deadline: Instant,
    retry_policy: Arc<dyn RetryPolicy>,
    attempts: AtomicU32,
    last_endpoint: Mutex<Option<String>>,
    slot: ResultSlot,
}

impl KeyValueRequest {
    /// Creates a request and the receiver its result will arrive on.
    pub fn new(
        operation: Operation,
        key: impl Into<String>,
        options: RequestOptions,
    ) -> (Arc<Self>, oneshot::Receiver<Result<KeyValueResponse>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            operation,
            key: key.into(),
            opaque: next_opaque(),
            partition: AtomicU16::new(0),
            cas: options.cas,
            payload: options.payload,
            durability: options.durability,
            collection: options.collection,
            timeout: options.timeout,
            deadline: Instant::now() + options.timeout,
            retry_policy: options.retry_policy,
            attempts: AtomicU32::new(0),
            last_endpoint: Mutex::new(None),
            slot: ResultSlot {
                completed: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            },
        });
        (request, rx)
    }

    /// Returns the operation this request performs.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Returns the document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the correlation id carried in the packet header.
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    /// Returns the partition the key maps to.
    pub fn partition(&self) -> u16 {
        self.partition.load(Ordering::Relaxed)
    }

    /// Records the partition assigned by routing.
    pub fn set_partition(&self, partition: u16) {
        self.partition.store(partition, Ordering::Relaxed);
    }

    /// Returns the durability requirement.
    pub fn durability(&self) -> &Durability {
        &self.durability
    }

    /// Returns the request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the absolute deadline derived from the timeout.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the retry policy governing this request.
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    /// Returns how many dispatch attempts have been made.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Counts one more dispatch attempt and returns the new total.
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records the endpoint the request was last written to.
    pub fn mark_dispatched(&self, endpoint: &str) {
        if let Ok(mut last) = self.last_endpoint.lock() {
            *last = Some(endpoint.to_string());
        }
    }

    /// Returns the endpoint the request was last written to.
    pub fn last_dispatched_to(&self) -> Option<String> {
        self.last_endpoint.lock().ok().and_then(|last| last.clone())
    }

    /// Returns true once the request has completed (in any way).
    pub fn is_completed(&self) -> bool {
        self.slot.completed.load(Ordering::SeqCst)
    }

    /// Completes the request successfully. Returns false if it already
    /// completed.
    pub fn succeed(&self, response: KeyValueResponse) -> bool {
        self.slot.complete(Ok(response))
    }

    /// Completes the request with an error. Returns false if it already
    /// completed.
    pub fn fail(&self, error: VellumError) -> bool {
        self.slot.complete(Err(error))
    }

    /// Cancels the request. Returns false if it already completed.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.slot.complete(Err(VellumError::Cancelled(reason.into())))
    }

    /// The key as written to the wire, collection-prefixed when negotiated.
    fn wire_key(&self, ctx: &ConnectionContext) -> Vec<u8> {
        match &self.collection {
            Some(prefix) if ctx.collections_enabled() => {
                let mut key = Vec::with_capacity(prefix.len() + self.key.len());
                key.extend_from_slice(prefix);
                key.extend_from_slice(self.key.as_bytes());
                key
            }
            _ => self.key.as_bytes().to_vec(),
        }
    }

    fn maybe_compress(&self, ctx: &ConnectionContext, datatype: &mut u8) -> Bytes {
        let settings = ctx.compression();
        if settings.enabled() && self.payload.len() >= settings.min_size() {
            if let Some(compressed) = compression::try_compress(&self.payload, settings.min_ratio())
            {
                *datatype |= DATATYPE_COMPRESSED;
                return Bytes::from(compressed);
            }
        }
        self.payload.clone()
    }

    /// Encodes the request into a wire packet for the given connection.
    ///
    /// Re-encoding on retry is deliberate: the packet depends on the
    /// connection's negotiated features and on the current partition.
    pub fn encode(&self, ctx: &ConnectionContext) -> Result<Bytes> {
        let key = self.wire_key(ctx);
        let mut datatype = 0u8;
        let opcode = self.operation.opcode();

        let extras = match &self.operation {
            Operation::Upsert { flags, expiry } => {
                let mut extras = Vec::with_capacity(8);
                extras.extend_from_slice(&flags.to_be_bytes());
                extras.extend_from_slice(&expiry.encode()?.to_be_bytes());
                extras
            }
            _ => Vec::new(),
        };

        let value = if self.operation.carries_payload() {
            self.maybe_compress(ctx, &mut datatype)
        } else {
            match &self.operation {
                Operation::SubdocLookup { commands } | Operation::SubdocMutate { commands } => {
                    subdoc::encode_commands(commands).freeze()
                }
                _ => Bytes::new(),
            }
        };

        if self.operation.is_mutation() {
            if let Durability::Synchronous(level) = self.durability {
                if !ctx.sync_replication_enabled() {
                    return Err(VellumError::DurabilityImpossible(
                        "synchronous replication is not enabled on this connection".to_string(),
                    ));
                }
                let framing = frame::durability_framing_extras(level.raw(), self.timeout);
                let packet = frame::flexible_request(
                    opcode,
                    datatype,
                    self.partition(),
                    self.opaque,
                    self.cas,
                    &framing,
                    &extras,
                    &key,
                    &value,
                )?;
                return Ok(packet.freeze());
            }
        }

        Ok(frame::request(
            opcode,
            datatype,
            self.partition(),
            self.opaque,
            self.cas,
            &extras,
            &key,
            &value,
        )
        .freeze())
    }

    /// Decodes a response packet matched to this request by opaque.
    ///
    /// Any well-formed packet decodes to `Ok`, including server-side
    /// failures; only malformed packets are errors here. The caller turns
    /// the decoded status into the final outcome via
    /// [`KeyValueResponse::into_result`].
    pub fn decode(&self, packet: &Bytes, ctx: &ConnectionContext) -> Result<KeyValueResponse> {
        frame::verify_response(packet)?;
        let status = Status::from_raw(frame::status_raw(packet))?;
        let cas = frame::cas(packet);
        let body = frame::body(packet);

        let mutation_token = if status.is_success() && self.operation.is_mutation() {
            frame::extract_mutation_token(
                ctx.mutation_tokens_enabled(),
                self.partition(),
                packet,
                ctx.bucket(),
            )
        } else {
            None
        };

        match &self.operation {
            Operation::SubdocLookup { commands } | Operation::SubdocMutate { commands } => {
                let reply = subdoc::decode_multi(body.as_ref(), status, commands, &self.key)?;
                Ok(KeyValueResponse {
                    status: reply.status,
                    cas,
                    value: None,
                    mutation_token,
                    subdoc: Some(reply),
                })
            }
            _ => {
                let value = match body {
                    Some(body) if frame::datatype(packet) & DATATYPE_COMPRESSED != 0 => {
                        Some(Bytes::from(compression::decompress(&body)?))
                    }
                    other => other,
                };
                Ok(KeyValueResponse {
                    status,
                    cas,
                    value,
                    mutation_token,
                    subdoc: None,
                })
            }
        }
    }
}

impl std::fmt::Debug for KeyValueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueRequest")
            .field("operation", &self.operation.name())
            .field("key", &self.key)
            .field("opaque", &self.opaque)
            .field("partition", &self.partition())
            .field("attempts", &self.attempts())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The decoded outcome of a request.
#[derive(Debug)]
pub struct KeyValueResponse {
    /// The (resolved) response status.
    pub status: Status,
    /// The cas token of the document after the operation.
    pub cas: u64,
    /// The returned value, decompressed when the server compressed it.
    pub value: Option<Bytes>,
    /// The mutation token, present for negotiated successful mutations.
    pub mutation_token: Option<MutationToken>,
    /// Per-command sub-document results for multi operations.
    pub subdoc: Option<SubdocReply>,
}

impl KeyValueResponse {
    /// Converts the decoded response into the caller-facing outcome,
    /// surfacing typed errors for failure statuses.
    pub fn into_result(mut self, key: &str) -> Result<Self> {
        if let Some(reply) = self.subdoc.as_mut() {
            if let Some(error) = reply.error.take() {
                return Err(VellumError::Subdoc(error));
            }
        }
        match self.status.as_error(key) {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}
