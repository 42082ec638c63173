//! Durability requirements and client-verified observe polling.
//!
//! Two durability flavors exist: synchronous durability rides on the
//! request itself as flexible framing and is enforced server-side, while
//! client-verified durability polls the key's observed state on the
//! active and replica nodes until the requested persistence and
//! replication counts are met or the request deadline passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use vellum_core::protocol::frame;
use vellum_core::{Opcode, Result, Status, VellumError};

/// Default pause between observe polling rounds.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Server-enforced durability levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    /// Replicated to a majority of configured nodes.
    Majority = 0x01,
    /// Majority, and persisted on the active node.
    MajorityAndPersistToActive = 0x02,
    /// Persisted on a majority of configured nodes.
    PersistToMajority = 0x03,
}

impl DurabilityLevel {
    /// Returns the raw wire value of this level.
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// How many nodes must have persisted a mutation to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTo {
    /// No persistence requirement.
    None,
    /// The active node must have persisted the mutation.
    Active,
    /// At least one node (active or replica).
    One,
    /// At least two nodes.
    Two,
    /// At least three nodes.
    Three,
    /// At least four nodes.
    Four,
}

impl PersistTo {
    /// The number of nodes that must report the mutation persisted.
    pub fn nodes(self) -> u32 {
        match self {
            PersistTo::None => 0,
            PersistTo::Active | PersistTo::One => 1,
            PersistTo::Two => 2,
            PersistTo::Three => 3,
            PersistTo::Four => 4,
        }
    }
}

/// How many replicas must hold a mutation in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateTo {
    /// No replication requirement.
    None,
    /// At least one replica.
    One,
    /// At least two replicas.
    Two,
    /// At least three replicas.
    Three,
}

impl ReplicateTo {
    /// The number of replicas that must report the mutation.
    pub fn replicas(self) -> u32 {
        match self {
            ReplicateTo::None => 0,
            ReplicateTo::One => 1,
            ReplicateTo::Two => 2,
            ReplicateTo::Three => 3,
        }
    }
}

/// The durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Fire and forget; the mutation is durable only on the active node.
    None,
    /// Server-enforced durability via flexible framing.
    Synchronous(DurabilityLevel),
    /// Client-verified durability via observe polling.
    ClientVerified {
        /// Required persistence count.
        persist_to: PersistTo,
        /// Required replica count.
        replicate_to: ReplicateTo,
    },
}

impl Durability {
    /// Builds a client-verified requirement.
    ///
    /// Requiring nothing on either axis normalizes to [`Durability::None`]
    /// so no poller is ever spawned for it.
    pub fn client_verified(persist_to: PersistTo, replicate_to: ReplicateTo) -> Self {
        if persist_to == PersistTo::None && replicate_to == ReplicateTo::None {
            Durability::None
        } else {
            Durability::ClientVerified {
                persist_to,
                replicate_to,
            }
        }
    }
}

/// The observed state of a key on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveStatus {
    /// The key is in memory but not yet persisted.
    FoundNotPersisted,
    /// The key is persisted to disk.
    FoundPersisted,
    /// The key is not present on the node.
    NotFound,
    /// The key was deleted but the deletion is not yet persisted.
    LogicallyDeleted,
    /// An unrecognized observe state.
    Unknown,
}

impl ObserveStatus {
    /// Decodes the raw observe state byte.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => ObserveStatus::FoundNotPersisted,
            0x01 => ObserveStatus::FoundPersisted,
            0x80 => ObserveStatus::NotFound,
            0x81 => ObserveStatus::LogicallyDeleted,
            _ => ObserveStatus::Unknown,
        }
    }
}

/// The outcome of observing a key on one node.
#[derive(Debug, Clone, Copy)]
pub struct ObserveResult {
    /// The observed state.
    pub status: ObserveStatus,
    /// The cas the node currently holds for the key.
    pub cas: u64,
}

/// Encodes an observe request for a key.
///
/// The body repeats the partition and key; observe predates the header's
/// partition field carrying routing meaning for it.
pub fn observe_request(key: &str, partition: u16, opaque: u32) -> BytesMut {
    let key = key.as_bytes();
    let mut body = BytesMut::with_capacity(4 + key.len());
    body.put_u16(partition);
    body.put_u16(key.len() as u16);
    body.put_slice(key);
    frame::request(Opcode::Observe, 0, partition, opaque, 0, &[], &[], &body)
}

/// Decodes an observe response into the key's state on that node.
pub fn decode_observe(packet: &Bytes) -> Result<ObserveResult> {
    frame::verify_response(packet)?;
    let status = Status::from_raw(frame::status_raw(packet))?;
    if !status.is_success() {
        return Err(VellumError::Protocol(format!(
            "observe failed with status {:#06x}",
            status.raw()
        )));
    }
    let body = frame::body(packet).ok_or_else(|| {
        VellumError::Protocol("observe response carries no body".to_string())
    })?;
    let mut buf = body;
    if buf.remaining() < 4 {
        return Err(VellumError::Protocol(
            "observe response body truncated".to_string(),
        ));
    }
    buf.advance(2); // partition
    let key_len = buf.get_u16() as usize;
    if buf.remaining() < key_len + 9 {
        return Err(VellumError::Protocol(
            "observe response body truncated".to_string(),
        ));
    }
    buf.advance(key_len);
    let status = ObserveStatus::from_raw(buf.get_u8());
    let cas = buf.get_u64();
    Ok(ObserveResult { status, cas })
}

/// Observes a key's state on the active node or one of its replicas.
///
/// Node index 0 is the active; 1..=replica_count() address replicas. The
/// key-value service implements this against its live connections.
#[async_trait]
pub trait ReplicaProbe: Send + Sync {
    /// The number of configured replicas for the bucket.
    fn replica_count(&self) -> u32;

    /// Observes the key on the given node.
    async fn observe(&self, key: &str, partition: u16, node_index: u32) -> Result<ObserveResult>;
}

/// Polls observe state until a client-verified requirement holds.
pub struct ObservePoller {
    probe: Arc<dyn ReplicaProbe>,
    interval: Duration,
}

impl ObservePoller {
    /// Creates a poller over a probe with the default interval.
    pub fn new(probe: Arc<dyn ReplicaProbe>) -> Self {
        Self {
            probe,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the pause between polling rounds.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enforces a client-verified requirement for a committed mutation.
    ///
    /// Returns [`VellumError::DurabilityImpossible`] without polling when
    /// the bucket cannot satisfy the requirement, and
    /// [`VellumError::DurabilityAmbiguous`] when the deadline passes first:
    /// the mutation itself already succeeded, only its durability is
    /// unconfirmed. `abandoned` is checked before every round; once the
    /// owning request has completed (timed out, cancelled, disconnected)
    /// the poller stops probing and bows out.
    pub async fn enforce<F>(
        &self,
        key: &str,
        partition: u16,
        cas: u64,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        deadline: Instant,
        abandoned: F,
    ) -> Result<()>
    where
        F: Fn() -> bool + Send,
    {
        let replicas = self.probe.replica_count();
        if replicate_to.replicas() > replicas {
            return Err(VellumError::DurabilityImpossible(format!(
                "{} replicas required but the bucket has {}",
                replicate_to.replicas(),
                replicas
            )));
        }
        if persist_to.nodes() > replicas + 1 {
            return Err(VellumError::DurabilityImpossible(format!(
                "{} persisted copies required but the bucket has {} nodes",
                persist_to.nodes(),
                replicas + 1
            )));
        }

        loop {
            if abandoned() {
                tracing::trace!(key = %key, "request completed, stopping durability polling");
                return Err(VellumError::Cancelled(format!(
                    "request for key {} completed before durability was confirmed",
                    key
                )));
            }
            if self.round(key, partition, cas, persist_to, replicate_to).await? {
                return Ok(());
            }
            if Instant::now() + self.interval >= deadline {
                return Err(VellumError::DurabilityAmbiguous(format!(
                    "durability of key {} unconfirmed within the deadline",
                    key
                )));
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Runs one polling round. Returns true once the requirement holds.
    async fn round(
        &self,
        key: &str,
        partition: u16,
        cas: u64,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
    ) -> Result<bool> {
        let mut persisted = 0u32;
        let mut replicated = 0u32;
        let mut active_persisted = false;

        match self.probe.observe(key, partition, 0).await {
            Ok(result) => {
                if result.cas != cas {
                    // The mutation was superseded on the active; its
                    // durability can no longer be confirmed.
                    return Err(VellumError::DurabilityAmbiguous(format!(
                        "key {} was concurrently modified while verifying durability",
                        key
                    )));
                }
                if result.status == ObserveStatus::FoundPersisted {
                    persisted += 1;
                    active_persisted = true;
                }
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "active observe failed, retrying");
                return Ok(false);
            }
        }

        for index in 1..=self.probe.replica_count() {
            match self.probe.observe(key, partition, index).await {
                Ok(result) => match result.status {
                    ObserveStatus::FoundPersisted => {
                        replicated += 1;
                        persisted += 1;
                    }
                    ObserveStatus::FoundNotPersisted => {
                        replicated += 1;
                    }
                    _ => {}
                },
                Err(e) => {
                    tracing::debug!(
                        key = %key,
                        replica = index,
                        error = %e,
                        "replica observe failed, skipping this round"
                    );
                }
            }
        }

        let persistence_met = match persist_to {
            PersistTo::None => true,
            PersistTo::Active => active_persisted,
            other => persisted >= other.nodes(),
        };
        Ok(persistence_met && replicated >= replicate_to.replicas())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use vellum_core::protocol::constants::{HEADER_SIZE, MAGIC_RESPONSE};

    /// A probe whose per-node observe states advance each polling round.
    struct ScriptedProbe {
        replicas: u32,
        // one script per node index; the last entry repeats
        scripts: Mutex<Vec<Vec<ObserveResult>>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(replicas: u32, scripts: Vec<Vec<ObserveResult>>) -> Arc<Self> {
            Arc::new(Self {
                replicas,
                scripts: Mutex::new(scripts),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ReplicaProbe for ScriptedProbe {
        fn replica_count(&self) -> u32 {
            self.replicas
        }

        async fn observe(
            &self,
            _key: &str,
            _partition: u16,
            node_index: u32,
        ) -> Result<ObserveResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let script = &mut scripts[node_index as usize];
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0])
            }
        }
    }

    fn found(cas: u64, persisted: bool) -> ObserveResult {
        ObserveResult {
            status: if persisted {
                ObserveStatus::FoundPersisted
            } else {
                ObserveStatus::FoundNotPersisted
            },
            cas,
        }
    }

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_client_verified_normalizes_to_none() {
        assert_eq!(
            Durability::client_verified(PersistTo::None, ReplicateTo::None),
            Durability::None
        );
        assert!(matches!(
            Durability::client_verified(PersistTo::Active, ReplicateTo::None),
            Durability::ClientVerified { .. }
        ));
    }

    #[test]
    fn test_level_wire_values() {
        assert_eq!(DurabilityLevel::Majority.raw(), 0x01);
        assert_eq!(DurabilityLevel::MajorityAndPersistToActive.raw(), 0x02);
        assert_eq!(DurabilityLevel::PersistToMajority.raw(), 0x03);
    }

    #[test]
    fn test_observe_request_layout() {
        let packet = observe_request("doc", 7, 99);
        assert_eq!(packet[1], Opcode::Observe.raw());
        // no key in the header; the body repeats partition and key
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
        let body = &packet[HEADER_SIZE..];
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 7);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), 3);
        assert_eq!(&body[4..], b"doc");
    }

    #[test]
    fn test_decode_observe_roundtrip() {
        let mut body = BytesMut::new();
        body.put_u16(7);
        body.put_u16(3);
        body.put_slice(b"doc");
        body.put_u8(0x01);
        body.put_u64(4242);

        let mut packet = BytesMut::new();
        packet.put_u8(MAGIC_RESPONSE);
        packet.put_u8(Opcode::Observe.raw());
        packet.put_u16(0);
        packet.put_u8(0);
        packet.put_u8(0);
        packet.put_u16(Status::Success.raw());
        packet.put_u32(body.len() as u32);
        packet.put_u32(99);
        packet.put_u64(0);
        packet.put_slice(&body);

        let result = decode_observe(&packet.freeze()).unwrap();
        assert_eq!(result.status, ObserveStatus::FoundPersisted);
        assert_eq!(result.cas, 4242);
    }

    #[tokio::test]
    async fn test_satisfied_immediately() {
        let probe = ScriptedProbe::new(
            1,
            vec![vec![found(1, true)], vec![found(1, true)]],
        );
        let poller = ObservePoller::new(probe);
        poller
            .enforce("k", 0, 1, PersistTo::One, ReplicateTo::One, deadline_in(500), || false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_impossible_replica_requirement() {
        let probe = ScriptedProbe::new(1, vec![vec![found(1, true)], vec![found(1, true)]]);
        let poller = ObservePoller::new(probe.clone());
        let err = poller
            .enforce("k", 0, 1, PersistTo::None, ReplicateTo::Three, deadline_in(500), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::DurabilityImpossible(_)));
        // Infeasibility is detected before any polling happens.
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_impossible_persistence_requirement() {
        let probe = ScriptedProbe::new(1, vec![vec![found(1, true)], vec![found(1, true)]]);
        let poller = ObservePoller::new(probe);
        let err = poller
            .enforce("k", 0, 1, PersistTo::Four, ReplicateTo::None, deadline_in(500), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::DurabilityImpossible(_)));
    }

    #[tokio::test]
    async fn test_deadline_yields_ambiguous() {
        let probe = ScriptedProbe::new(1, vec![vec![found(1, false)], vec![found(1, false)]]);
        let poller = ObservePoller::new(probe).with_interval(Duration::from_millis(5));
        let err = poller
            .enforce("k", 0, 1, PersistTo::One, ReplicateTo::None, deadline_in(40), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::DurabilityAmbiguous(_)));
    }

    #[tokio::test]
    async fn test_progress_across_rounds() {
        // The active persists on the second round.
        let probe = ScriptedProbe::new(
            0,
            vec![vec![found(1, false), found(1, true)]],
        );
        let poller = ObservePoller::new(probe).with_interval(Duration::from_millis(1));
        poller
            .enforce("k", 0, 1, PersistTo::Active, ReplicateTo::None, deadline_in(500), || false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_active_requirement_not_met_by_replicas() {
        // The replica persisted but the active did not; PersistTo::Active
        // must keep polling until the deadline.
        let probe = ScriptedProbe::new(1, vec![vec![found(1, false)], vec![found(1, true)]]);
        let poller = ObservePoller::new(probe).with_interval(Duration::from_millis(5));
        let err = poller
            .enforce("k", 0, 1, PersistTo::Active, ReplicateTo::None, deadline_in(40), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::DurabilityAmbiguous(_)));
    }

    #[tokio::test]
    async fn test_concurrent_modification_is_ambiguous() {
        let probe = ScriptedProbe::new(0, vec![vec![found(99, true)]]);
        let poller = ObservePoller::new(probe);
        let err = poller
            .enforce("k", 0, 1, PersistTo::Active, ReplicateTo::None, deadline_in(500), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::DurabilityAmbiguous(_)));
    }

    #[tokio::test]
    async fn test_abandoned_request_stops_polling() {
        // The state never satisfies the requirement, but the owning
        // request completes after the first round; the poller must stop
        // probing instead of running to the deadline.
        let probe = ScriptedProbe::new(0, vec![vec![found(1, false)]]);
        let observed = probe.clone();
        let poller = ObservePoller::new(probe.clone()).with_interval(Duration::from_millis(1));
        let err = poller
            .enforce(
                "k",
                0,
                1,
                PersistTo::Active,
                ReplicateTo::None,
                deadline_in(5_000),
                move || observed.calls.load(Ordering::SeqCst) >= 1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::Cancelled(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replication_counts_unpersisted_replicas() {
        let probe = ScriptedProbe::new(
            2,
            vec![
                vec![found(1, true)],
                vec![found(1, false)],
                vec![found(1, false)],
            ],
        );
        let poller = ObservePoller::new(probe);
        poller
            .enforce("k", 0, 1, PersistTo::Active, ReplicateTo::Two, deadline_in(500), || false)
            .await
            .unwrap();
    }
}
