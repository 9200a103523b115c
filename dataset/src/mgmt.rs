//! Management protocol
//!
//! Active/Pending Get and Set requests exchanged between a commissioning
//! authority (or a reconciling node) and the leader, plus the leader's
//! Dataset-Changed notification. [`MgmtClient`] keeps one pending-response
//! record per outstanding request, keyed by message id, and retries with
//! exponential backoff until the response arrives or the budget runs out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    config::MgmtConfig,
    dataset::{Dataset, DatasetKind},
    error::{DecodeError, MgmtError, MgmtResult, TransportError},
    metrics::DatasetMetrics,
    mle::PeerId,
    tlv::{DuplicatePolicy, MeshcopTlv, Tlv, TlvSet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MgmtCommand {
    ActiveGet,
    ActiveSet,
    PendingGet,
    PendingSet,
    DatasetChanged,
}

impl MgmtCommand {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::ActiveGet => "c/ag",
            Self::ActiveSet => "c/as",
            Self::PendingGet => "c/pg",
            Self::PendingSet => "c/ps",
            Self::DatasetChanged => "c/dc",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Some(match uri {
            "c/ag" => Self::ActiveGet,
            "c/as" => Self::ActiveSet,
            "c/pg" => Self::PendingGet,
            "c/ps" => Self::PendingSet,
            "c/dc" => Self::DatasetChanged,
            _ => return None,
        })
    }

    fn get(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Active => Self::ActiveGet,
            DatasetKind::Pending => Self::PendingGet,
        }
    }

    fn set(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Active => Self::ActiveSet,
            DatasetKind::Pending => Self::PendingSet,
        }
    }
}

/// State TLV values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtState {
    Accept,
    Pending,
    Reject,
}

impl MgmtState {
    pub fn code(&self) -> u8 {
        match self {
            Self::Accept => 0x01,
            Self::Pending => 0x00,
            Self::Reject => 0xff,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Accept),
            0x00 => Some(Self::Pending),
            0xff => Some(Self::Reject),
            _ => None,
        }
    }

    fn tlv(&self) -> Tlv {
        Tlv::from_array(MeshcopTlv::State, [self.code()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtRequest {
    Get {
        kind: DatasetKind,
        /// Requested TLV types; empty means everything.
        filter: Vec<u8>,
        extra: TlvSet,
    },
    Set {
        kind: DatasetKind,
        tlvs: TlvSet,
    },
    DatasetChanged,
}

impl MgmtRequest {
    pub fn command(&self) -> MgmtCommand {
        match self {
            Self::Get { kind, .. } => MgmtCommand::get(*kind),
            Self::Set { kind, .. } => MgmtCommand::set(*kind),
            Self::DatasetChanged => MgmtCommand::DatasetChanged,
        }
    }

    /// Build a Set carrying `dataset` followed by `extra_tlvs`.
    pub fn set(kind: DatasetKind, dataset: &Dataset, extra_tlvs: &[Tlv]) -> Self {
        let mut tlvs = dataset.tlvs().clone();
        for tlv in extra_tlvs {
            tlvs.insert(tlv.clone());
        }
        Self::Set { kind, tlvs }
    }

    /// Commissioner Session ID carried by a Set, if any.
    pub fn session_id(&self) -> Option<u16> {
        match self {
            Self::Set { tlvs, .. } => commissioner_session_id(tlvs),
            _ => None,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        match self {
            Self::Get { filter, extra, .. } => {
                let mut tlvs = extra.clone();
                if !filter.is_empty() {
                    tlvs.insert(Tlv::from_short(MeshcopTlv::Get, filter.clone()));
                }
                tlvs.encode()
            }
            Self::Set { tlvs, .. } => tlvs.encode(),
            Self::DatasetChanged => Bytes::new(),
        }
    }

    /// Parse a request payload. Set payloads use last-wins for repeated
    /// types.
    pub fn decode(command: MgmtCommand, payload: &[u8]) -> Result<Self, DecodeError> {
        let kind = match command {
            MgmtCommand::ActiveGet | MgmtCommand::ActiveSet => DatasetKind::Active,
            MgmtCommand::PendingGet | MgmtCommand::PendingSet => DatasetKind::Pending,
            MgmtCommand::DatasetChanged => return Ok(Self::DatasetChanged),
        };
        let mut tlvs = TlvSet::decode(payload, DuplicatePolicy::LastWins)?;
        match command {
            MgmtCommand::ActiveSet | MgmtCommand::PendingSet => Ok(Self::Set { kind, tlvs }),
            _ => {
                let filter = tlvs
                    .remove(MeshcopTlv::Get.code())
                    .map(|t| t.value().to_vec())
                    .unwrap_or_default();
                Ok(Self::Get {
                    kind,
                    filter,
                    extra: tlvs,
                })
            }
        }
    }
}

/// Commissioner Session ID TLV value in `tlvs`.
pub fn commissioner_session_id(tlvs: &TlvSet) -> Option<u16> {
    tlvs.value(MeshcopTlv::CommissionerSessionId.code())
        .and_then(|v| v.try_into().ok())
        .map(u16::from_be_bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtResponse {
    State(MgmtState),
    Data(TlvSet),
    Ack,
}

impl MgmtResponse {
    pub fn encode_payload(&self) -> Bytes {
        match self {
            Self::State(state) => {
                let mut tlvs = TlvSet::new();
                tlvs.insert(state.tlv());
                tlvs.encode()
            }
            Self::Data(tlvs) => tlvs.encode(),
            Self::Ack => Bytes::new(),
        }
    }

    pub fn decode(command: MgmtCommand, payload: &[u8]) -> Result<Self, DecodeError> {
        match command {
            MgmtCommand::ActiveSet | MgmtCommand::PendingSet => {
                let tlvs = TlvSet::decode(payload, DuplicatePolicy::Reject)?;
                let code = MeshcopTlv::State.code();
                let value = tlvs.value(code).ok_or(DecodeError::MissingTlv(code))?;
                MeshcopTlv::State.check_length(value.len())?;
                MgmtState::from_code(value[0])
                    .map(Self::State)
                    .ok_or_else(|| DecodeError::InvalidValue {
                        tlv_type: code,
                        reason: format!("unknown state {:#04x}", value[0]),
                    })
            }
            MgmtCommand::ActiveGet | MgmtCommand::PendingGet => Ok(Self::Data(TlvSet::decode(
                payload,
                DuplicatePolicy::Reject,
            )?)),
            MgmtCommand::DatasetChanged => Ok(Self::Ack),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtDestination {
    /// The partition leader, wherever it currently is.
    Leader,
    Peer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtMessage {
    pub id: u16,
    pub to: MgmtDestination,
    pub request: MgmtRequest,
}

/// Request/response transport used by [`MgmtClient`]. Responses are routed
/// back through [`MgmtClient::handle_response`].
#[async_trait]
pub trait MgmtTransport: Send + Sync + 'static {
    async fn send(&self, message: MgmtMessage) -> Result<(), TransportError>;
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&MgmtConfig::default())
    }
}

impl From<&MgmtConfig> for RetryPolicy {
    fn from(config: &MgmtConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Removes a request's slot when the request finishes or its future is
/// dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u16, oneshot::Sender<MgmtResponse>>>,
    id: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct MgmtClient {
    transport: Arc<dyn MgmtTransport>,
    pending: Mutex<HashMap<u16, oneshot::Sender<MgmtResponse>>>,
    next_id: AtomicU16,
    retry: RetryPolicy,
    response_timeout: Duration,
    metrics: Arc<DatasetMetrics>,
}

impl MgmtClient {
    pub fn new(
        transport: Arc<dyn MgmtTransport>,
        config: &MgmtConfig,
        metrics: Arc<DatasetMetrics>,
    ) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(rand::random()),
            retry: RetryPolicy::from(config),
            response_timeout: config.response_timeout(),
            metrics,
        }
    }

    /// Number of requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver a response to the request with message id `id`. Returns
    /// false when nothing is waiting for it (late or duplicate response).
    pub fn handle_response(&self, id: u16, response: MgmtResponse) -> bool {
        match self.pending.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(id, "dropping unmatched management response");
                false
            }
        }
    }

    /// Send `request` and wait for its response, retrying on timeout.
    pub async fn request(
        &self,
        to: MgmtDestination,
        request: MgmtRequest,
    ) -> MgmtResult<MgmtResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        self.metrics.record_mgmt_request();

        self.exchange(id, to, request, rx).await
    }

    async fn exchange(
        &self,
        id: u16,
        to: MgmtDestination,
        request: MgmtRequest,
        mut rx: oneshot::Receiver<MgmtResponse>,
    ) -> MgmtResult<MgmtResponse> {
        let uri = request.command().uri();
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let message = MgmtMessage {
                id,
                to,
                request: request.clone(),
            };
            match self.transport.send(message).await {
                Ok(()) => {
                    match tokio::time::timeout(self.response_timeout, &mut rx).await {
                        Ok(Ok(response)) => {
                            debug!(id, uri, attempt, "management response received");
                            return Ok(response);
                        }
                        Ok(Err(_)) => return Err(MgmtError::Shutdown),
                        Err(_) => {
                            self.metrics.record_mgmt_timeout();
                            warn!(id, uri, attempt, "management request timed out");
                        }
                    }
                }
                Err(e) if attempt >= max_attempts => {
                    error!(id, uri, attempt, error = %e, "management request failed");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(id, uri, attempt, error = %e, "management send failed");
                }
            }

            if attempt < max_attempts {
                let delay = self.retry.backoff(attempt);
                // A late response may still land while backing off.
                tokio::select! {
                    response = &mut rx => {
                        return response.map_err(|_| MgmtError::Shutdown);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(MgmtError::Timeout {
            attempts: max_attempts,
        })
    }

    /// Send a Set for `dataset` with `extra_tlvs` (e.g. Commissioner Session
    /// ID) to the leader and return its State.
    pub async fn send_set_request(
        &self,
        kind: DatasetKind,
        dataset: &Dataset,
        extra_tlvs: &[Tlv],
    ) -> MgmtResult<MgmtState> {
        let request = MgmtRequest::set(kind, dataset, extra_tlvs);
        match self.request(MgmtDestination::Leader, request).await? {
            MgmtResponse::State(state) => {
                info!(%kind, ?state, "set request answered");
                Ok(state)
            }
            other => Err(MgmtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Fetch TLVs of the leader's `kind` dataset. An empty filter asks for
    /// every TLV; an absent dataset yields an empty set.
    pub async fn send_get_request(
        &self,
        kind: DatasetKind,
        filter: &[MeshcopTlv],
        extra_tlvs: &[Tlv],
    ) -> MgmtResult<TlvSet> {
        let request = MgmtRequest::Get {
            kind,
            filter: filter.iter().map(|t| t.code()).collect(),
            extra: extra_tlvs.iter().cloned().collect(),
        };
        match self.request(MgmtDestination::Leader, request).await? {
            MgmtResponse::Data(tlvs) => Ok(tlvs),
            other => Err(MgmtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    /// Transport that records messages and optionally answers them.
    struct Loopback {
        client: Mutex<Option<Arc<MgmtClient>>>,
        sent: Mutex<Vec<MgmtMessage>>,
        answer_after: usize,
        response: MgmtResponse,
    }

    #[async_trait]
    impl MgmtTransport for Loopback {
        async fn send(&self, message: MgmtMessage) -> Result<(), TransportError> {
            let count = {
                let mut sent = self.sent.lock();
                sent.push(message.clone());
                sent.len()
            };
            if count > self.answer_after {
                if let Some(client) = self.client.lock().clone() {
                    client.handle_response(message.id, self.response.clone());
                }
            }
            Ok(())
        }
    }

    fn setup(answer_after: usize, response: MgmtResponse) -> (Arc<Loopback>, Arc<MgmtClient>) {
        let transport = Arc::new(Loopback {
            client: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            answer_after,
            response,
        });
        let client = Arc::new(MgmtClient::new(
            transport.clone(),
            &MgmtConfig::default(),
            Arc::new(DatasetMetrics::new()),
        ));
        *transport.client.lock() = Some(client.clone());
        (transport, client)
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(6), Duration::from_millis(8000));
    }

    #[test]
    fn test_set_payload_carries_extra_tlvs() {
        let mut ds = Dataset::new(DatasetKind::Active);
        ds.set_active_timestamp(Timestamp::from_seconds(70));
        let session = Tlv::new(MeshcopTlv::CommissionerSessionId.code(), vec![0x12, 0x34]).unwrap();
        let request = MgmtRequest::set(DatasetKind::Active, &ds, &[session]);
        assert_eq!(request.session_id(), Some(0x1234));

        let decoded =
            MgmtRequest::decode(MgmtCommand::ActiveSet, &request.encode_payload()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_get_payload_filter() {
        let request = MgmtRequest::Get {
            kind: DatasetKind::Pending,
            filter: vec![MeshcopTlv::DelayTimer.code()],
            extra: TlvSet::new(),
        };
        let payload = request.encode_payload();
        assert_eq!(payload.as_ref(), &[13, 1, 52]);
        assert_eq!(
            MgmtRequest::decode(MgmtCommand::PendingGet, &payload).unwrap(),
            request
        );
    }

    #[test]
    fn test_state_response_codec() {
        let payload = MgmtResponse::State(MgmtState::Reject).encode_payload();
        assert_eq!(payload.as_ref(), &[16, 1, 0xff]);
        assert_eq!(
            MgmtResponse::decode(MgmtCommand::PendingSet, &payload).unwrap(),
            MgmtResponse::State(MgmtState::Reject)
        );
        assert!(MgmtResponse::decode(MgmtCommand::ActiveSet, &[]).is_err());
        assert!(MgmtResponse::decode(MgmtCommand::ActiveSet, &[16, 1, 7]).is_err());
    }

    #[test]
    fn test_uri_mapping() {
        for command in [
            MgmtCommand::ActiveGet,
            MgmtCommand::ActiveSet,
            MgmtCommand::PendingGet,
            MgmtCommand::PendingSet,
            MgmtCommand::DatasetChanged,
        ] {
            assert_eq!(MgmtCommand::from_uri(command.uri()), Some(command));
        }
        assert_eq!(MgmtCommand::from_uri("c/xx"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_releases_slot() {
        let (transport, client) = setup(usize::MAX, MgmtResponse::Ack);
        let request = client.request(MgmtDestination::Leader, MgmtRequest::DatasetChanged);
        let outcome = tokio::time::timeout(Duration::from_millis(100), request).await;

        assert!(outcome.is_err());
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_request_answered_first_try() {
        let (transport, client) = setup(0, MgmtResponse::State(MgmtState::Accept));
        let ds = Dataset::new(DatasetKind::Active);
        let state = client
            .send_set_request(DatasetKind::Active, &ds, &[])
            .await
            .unwrap();
        assert_eq!(state, MgmtState::Accept);
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reuses_message_id() {
        let (transport, client) = setup(2, MgmtResponse::Data(TlvSet::new()));
        let tlvs = client
            .send_get_request(DatasetKind::Pending, &[], &[])
            .await
            .unwrap();
        assert!(tlvs.is_empty());
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.id == sent[0].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_budget() {
        let (transport, client) = setup(usize::MAX, MgmtResponse::Ack);
        let err = client
            .send_get_request(DatasetKind::Active, &[MeshcopTlv::Channel], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MgmtError::Timeout { attempts: 3 }));
        assert_eq!(transport.sent.lock().len(), 3);
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.metrics.snapshot().mgmt_timeouts, 3);
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let (_transport, client) = setup(0, MgmtResponse::Ack);
        assert!(!client.handle_response(42, MgmtResponse::Ack));
    }
}
