//! Per-node dataset engine
//!
//! A synchronous state machine: every handler takes the current monotonic
//! time and returns the [`Action`]s the caller must perform (mesh sends,
//! management requests). The engine never blocks and never spawns; the
//! tokio runtime in [`crate::node`] drives it.
//!
//! Convergence rules:
//! - datasets are replaced whole, only by a copy with a strictly newer
//!   timestamp, independently for Active and Pending;
//! - only the leader accepts management Sets and bumps Leader Data versions;
//! - every node holding a Pending dataset runs its own delay timer.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::DatasetConfig,
    dataset::{Dataset, DatasetKind},
    delay_timer::{boot_remaining, DelayTimer, SystemClock, WallClock},
    error::{DatasetError, DatasetResult},
    leader::{CommissionerSession, LeaderData, LeaderState, SetOrigin},
    manager::DatasetManager,
    metrics::DatasetMetrics,
    mgmt::{commissioner_session_id, MgmtDestination, MgmtRequest, MgmtResponse, MgmtState},
    mle::{ChildIdRequest, DataRequest, DataResponse, MleMessage, PeerId},
    notifier::{DatasetEvent, Notifier},
    policy::{evaluate_active_set, evaluate_pending_set},
    security_policy::DiscoveryCapabilities,
    storage::SettingsStore,
    timestamp::{is_newer, Timestamp},
    tlv::{MeshcopTlv, TlvSet},
};

/// Work the caller performs on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Multicast(MleMessage),
    Unicast { to: PeerId, message: MleMessage },
    /// Fire-and-log management request (reconciliation pushes,
    /// Dataset-Changed notifications).
    SendMgmt {
        to: MgmtDestination,
        request: MgmtRequest,
    },
}

/// How a management request was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtDisposition {
    Reply {
        response: MgmtResponse,
        actions: Vec<Action>,
    },
    /// Sets received by a non-leader go to the leader unchanged.
    ForwardToLeader(MgmtRequest),
}

#[derive(Debug, Clone)]
pub enum Role {
    Detached,
    Attached {
        parent: PeerId,
        leader_data: LeaderData,
    },
    Leader(LeaderState),
}

/// Shared collaborators for an engine.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn SettingsStore>,
    pub clock: Arc<dyn WallClock>,
    pub notifier: Notifier,
    pub metrics: Arc<DatasetMetrics>,
}

impl EngineContext {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            notifier: Notifier::default(),
            metrics: Arc::new(DatasetMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }
}

pub struct DatasetEngine {
    config: DatasetConfig,
    rloc: PeerId,
    active: DatasetManager,
    pending: DatasetManager,
    delay: DelayTimer,
    next_checkpoint: Option<Instant>,
    role: Role,
    notifier: Notifier,
    metrics: Arc<DatasetMetrics>,
}

impl DatasetEngine {
    /// Restore both datasets from storage and re-arm the delay timer of a
    /// persisted Pending dataset according to the boot policy.
    pub fn new(
        config: DatasetConfig,
        rloc: PeerId,
        ctx: EngineContext,
        now: Instant,
    ) -> DatasetResult<Self> {
        let (active, _) =
            DatasetManager::restore(DatasetKind::Active, ctx.store.clone(), ctx.clock.clone())?;
        let (pending, record) =
            DatasetManager::restore(DatasetKind::Pending, ctx.store, ctx.clock.clone())?;

        let mut engine = Self {
            config,
            rloc,
            active,
            pending,
            delay: DelayTimer::new(),
            next_checkpoint: None,
            role: Role::Detached,
            notifier: ctx.notifier,
            metrics: ctx.metrics,
        };

        if engine.pending.read().is_some_and(|p| engine.commit_would_regress(p)) {
            warn!(
                pending_active = ?engine.pending.read().and_then(Dataset::active_timestamp),
                active = ?engine.active_timestamp(),
                "discarding restored pending dataset older than active dataset"
            );
            let retry_at = now + engine.config.delay_checkpoint_interval();
            engine.drop_pending(Some(retry_at));
        }

        let stored_delay = engine.pending.read().map(Dataset::delay_timer);
        if let (Some(stored_delay), Some(record)) = (stored_delay, record) {
            let persisted = record
                .delay_remaining_ms
                .map(|ms| Duration::from_millis(ms.into()))
                .or(stored_delay)
                .unwrap_or_default();
            let remaining = boot_remaining(
                engine.config.delay_boot_policy,
                persisted,
                record.saved_at,
                ctx.clock.now(),
            );
            info!(
                ?persisted,
                ?remaining,
                policy = ?engine.config.delay_boot_policy,
                "resuming pending dataset delay timer"
            );
            engine.arm_delay(now, remaining);
        }

        Ok(engine)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn rloc(&self) -> PeerId {
        self.rloc
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn active(&self) -> Option<&Dataset> {
        self.active.read()
    }

    pub fn pending(&self) -> Option<&Dataset> {
        self.pending.read()
    }

    pub fn dataset(&self, kind: DatasetKind) -> Option<&Dataset> {
        match kind {
            DatasetKind::Active => self.active.read(),
            DatasetKind::Pending => self.pending.read(),
        }
    }

    pub fn active_timestamp(&self) -> Option<Timestamp> {
        self.active.timestamp()
    }

    pub fn pending_timestamp(&self) -> Option<Timestamp> {
        self.pending.timestamp()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn leader_data(&self) -> Option<LeaderData> {
        match &self.role {
            Role::Detached => None,
            Role::Attached { leader_data, .. } => Some(*leader_data),
            Role::Leader(state) => Some(state.leader_data()),
        }
    }

    /// Beacon/discovery flags derived from the Active security policy.
    pub fn discovery_capabilities(&self) -> Option<DiscoveryCapabilities> {
        self.active
            .read()
            .and_then(Dataset::security_policy)
            .map(|p| p.discovery_capabilities())
    }

    pub fn delay_remaining(&self, now: Instant) -> Option<Duration> {
        self.delay.remaining(now)
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn metrics(&self) -> &Arc<DatasetMetrics> {
        &self.metrics
    }

    /// The Pending dataset as sent to peers: Delay Timer set to what is
    /// left of the countdown.
    pub fn pending_for_wire(&self, now: Instant) -> Option<Dataset> {
        let mut dataset = self.pending.read()?.clone();
        if let Some(remaining) = self.delay.remaining(now) {
            dataset.set_delay_timer(remaining);
        }
        Some(dataset)
    }

    fn dataset_for_wire(&self, kind: DatasetKind, now: Instant) -> Option<Dataset> {
        match kind {
            DatasetKind::Active => self.active.read().cloned(),
            DatasetKind::Pending => self.pending_for_wire(now),
        }
    }

    fn timestamp(&self, kind: DatasetKind) -> Option<Timestamp> {
        match kind {
            DatasetKind::Active => self.active_timestamp(),
            DatasetKind::Pending => self.pending_timestamp(),
        }
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    /// Start a partition with this node as leader. Local datasets become the
    /// partition's working copies.
    pub fn become_leader(
        &mut self,
        partition_id: u32,
        leader_router_id: u8,
        weighting: u8,
    ) -> Vec<Action> {
        let state = LeaderState::new(&mut rand::rng(), partition_id, leader_router_id, weighting);
        info!(
            rloc = %self.rloc,
            partition_id,
            data_version = state.leader_data().data_version,
            active = ?self.active_timestamp(),
            pending = ?self.pending_timestamp(),
            "became leader"
        );
        self.role = Role::Leader(state);
        self.advertisement().map(Action::Multicast).into_iter().collect()
    }

    pub fn detach(&mut self) {
        debug!(rloc = %self.rloc, "detached");
        self.role = Role::Detached;
    }

    /// Register (or clear) the active commissioner. Leader only.
    pub fn set_commissioner(&mut self, session: Option<CommissionerSession>) -> bool {
        match &mut self.role {
            Role::Leader(state) => {
                state.set_commissioner(session);
                true
            }
            _ => false,
        }
    }

    /// Child ID Request announcing this node's timestamps.
    pub fn child_id_request(&self) -> MleMessage {
        MleMessage::ChildIdRequest(ChildIdRequest {
            active_timestamp: self.active_timestamp(),
            pending_timestamp: self.pending_timestamp(),
        })
    }

    /// Multicast Data Response advertising Leader Data and timestamps.
    pub fn advertisement(&self) -> Option<MleMessage> {
        Some(MleMessage::DataResponse(DataResponse {
            leader_data: self.leader_data()?,
            active_timestamp: self.active_timestamp(),
            pending_timestamp: self.pending_timestamp(),
            active_dataset: None,
            pending_dataset: None,
        }))
    }

    /// Periodic advertisement; only the leader originates one.
    pub fn periodic_advertisement(&self) -> Option<Action> {
        if self.is_leader() {
            self.advertisement().map(Action::Multicast)
        } else {
            None
        }
    }

    /// Bump versions when leader and advertise the change.
    fn leader_changed(&mut self, stable_changed: bool) -> Vec<Action> {
        match &mut self.role {
            Role::Leader(state) => state.bump_versions(stable_changed),
            _ => return Vec::new(),
        }
        self.advertisement().map(Action::Multicast).into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Local provisioning
    // ------------------------------------------------------------------

    /// Provision the Active dataset directly, bypassing the acceptance
    /// policy.
    pub fn save_local_active(&mut self, dataset: Dataset) -> DatasetResult<Vec<Action>> {
        let previous = self.active.read().cloned();
        self.active.save_local(dataset)?;
        self.after_active_replaced(previous.as_ref());
        Ok(self.leader_changed(true))
    }

    /// Provision the Pending dataset directly and start its delay timer.
    pub fn save_local_pending(
        &mut self,
        dataset: Dataset,
        now: Instant,
    ) -> DatasetResult<Vec<Action>> {
        let delay = dataset.delay_timer().unwrap_or_default();
        self.pending.save_local(dataset)?;
        self.arm_delay(now, delay);
        self.notifier.signal(DatasetEvent::PendingDatasetChanged);
        Ok(self.leader_changed(true))
    }

    fn arm_delay(&mut self, now: Instant, delay: Duration) {
        self.delay.schedule(now, delay);
        self.next_checkpoint = Some(now + self.config.delay_checkpoint_interval());
    }

    /// Events for a replaced Active dataset, and discard of a Pending
    /// dataset the new Active one already covers.
    fn after_active_replaced(&mut self, previous: Option<&Dataset>) {
        let Some(current) = self.active.read() else {
            return;
        };
        let events = DatasetEvent::for_active_change(previous, current);
        let new_ts = current.active_timestamp();
        self.notifier.signal_all(events);

        let pending_active_ts = self.pending.read().and_then(Dataset::active_timestamp);
        let old_ts = previous.and_then(Dataset::active_timestamp);
        let forward = is_newer(pending_active_ts, old_ts);
        let covered = matches!((new_ts, pending_active_ts), (Some(n), Some(p)) if n >= p);
        if forward && covered {
            info!(
                pending_active = ?pending_active_ts,
                active = ?new_ts,
                "pending dataset superseded by newer active dataset"
            );
            self.drop_pending(None);
            self.notifier.signal(DatasetEvent::PendingDatasetChanged);
        }
    }

    /// Drop the Pending dataset and stop its timer. A record the store
    /// failed to delete is retried from the checkpoint deadline (`retry_at`
    /// when none is scheduled).
    fn drop_pending(&mut self, retry_at: Option<Instant>) {
        self.delay.cancel();
        match self.pending.clear() {
            Ok(()) => self.next_checkpoint = None,
            Err(e) => {
                error!(error = %e, "failed to delete pending dataset record, retrying later");
                self.next_checkpoint = self.next_checkpoint.or(retry_at);
            }
        }
    }

    /// Applying `pending` would not move the Active Timestamp forward and
    /// does not rotate the network key.
    fn commit_would_regress(&self, pending: &Dataset) -> bool {
        let Some(current) = self.active.read() else {
            return false;
        };
        let key_change = pending
            .network_key()
            .is_some_and(|key| Some(key) != current.network_key());
        !key_change && !is_newer(pending.active_timestamp(), current.active_timestamp())
    }

    // ------------------------------------------------------------------
    // Management requests
    // ------------------------------------------------------------------

    /// Handle a management request addressed to this node.
    pub fn handle_mgmt(
        &mut self,
        from: PeerId,
        request: MgmtRequest,
        now: Instant,
    ) -> MgmtDisposition {
        match request {
            MgmtRequest::Get { kind, filter, .. } => MgmtDisposition::Reply {
                response: MgmtResponse::Data(self.get_response(kind, &filter, now)),
                actions: Vec::new(),
            },
            MgmtRequest::DatasetChanged => {
                info!(%from, "leader reports dataset change");
                self.notifier.signal(DatasetEvent::LeaderDatasetChanged);
                MgmtDisposition::Reply {
                    response: MgmtResponse::Ack,
                    actions: Vec::new(),
                }
            }
            request @ MgmtRequest::Set { .. } if !self.is_leader() => {
                debug!(%from, "forwarding set request to leader");
                MgmtDisposition::ForwardToLeader(request)
            }
            MgmtRequest::Set { kind, tlvs } => {
                let session_id = commissioner_session_id(&tlvs);
                match self.process_set(kind, &tlvs, session_id, now) {
                    Ok(actions) => MgmtDisposition::Reply {
                        response: MgmtResponse::State(MgmtState::Accept),
                        actions,
                    },
                    Err(e) => {
                        warn!(%from, %kind, reason = e.kind(), error = %e, "set request rejected");
                        self.metrics.record_set(kind, false);
                        MgmtDisposition::Reply {
                            response: MgmtResponse::State(MgmtState::Reject),
                            actions: Vec::new(),
                        }
                    }
                }
            }
        }
    }

    /// TLVs answering a Get. The Network Key is withheld when the Active
    /// security policy disables obtaining it.
    pub fn get_response(&self, kind: DatasetKind, filter: &[u8], now: Instant) -> TlvSet {
        let Some(dataset) = self.dataset_for_wire(kind, now) else {
            return TlvSet::new();
        };
        let mut tlvs = dataset.select(filter);
        let key_obtainable = self
            .active
            .read()
            .and_then(Dataset::security_policy)
            .map_or(true, |p| p.obtain_network_key_enabled());
        if !key_obtainable {
            tlvs.remove(MeshcopTlv::NetworkKey.code());
        }
        tlvs
    }

    /// Leader-side evaluation and application of a Set request.
    pub fn process_set(
        &mut self,
        kind: DatasetKind,
        request: &TlvSet,
        session_id: Option<u16>,
        now: Instant,
    ) -> DatasetResult<Vec<Action>> {
        let origin = match &self.role {
            Role::Leader(state) => state.check_session(session_id)?,
            _ => return Err(DatasetError::invalid_field("role", "not the leader")),
        };

        let mut actions = match kind {
            DatasetKind::Active => {
                let accepted = evaluate_active_set(request, self.active.read(), &self.config)?;
                let previous = self.active.read().cloned();
                self.active.save(accepted.dataset, None)?;
                self.after_active_replaced(previous.as_ref());
                info!(ts = ?self.active_timestamp(), ?origin, "active dataset updated by set");
                self.leader_changed(accepted.stable_changed)
            }
            DatasetKind::Pending => {
                let accepted = evaluate_pending_set(
                    request,
                    self.active.read(),
                    self.pending.read(),
                    &self.config,
                )?;
                if accepted.clamped {
                    self.metrics.record_delay_clamp();
                }
                self.pending.save(accepted.dataset, Some(accepted.delay))?;
                self.arm_delay(now, accepted.delay);
                self.notifier.signal(DatasetEvent::PendingDatasetChanged);
                info!(
                    ts = ?self.pending_timestamp(),
                    delay = ?accepted.delay,
                    key_change = accepted.changes_network_key,
                    ?origin,
                    "pending dataset updated by set"
                );
                self.leader_changed(true)
            }
        };
        self.metrics.record_set(kind, true);

        if origin == SetOrigin::Node {
            if let Role::Leader(state) = &self.role {
                if let Some(commissioner) = state.commissioner() {
                    actions.push(Action::SendMgmt {
                        to: MgmtDestination::Peer(commissioner.peer),
                        request: MgmtRequest::DatasetChanged,
                    });
                }
            }
        }
        Ok(actions)
    }

    // ------------------------------------------------------------------
    // Mesh propagation
    // ------------------------------------------------------------------

    pub fn handle_mle(&mut self, from: PeerId, message: MleMessage, now: Instant) -> Vec<Action> {
        match message {
            MleMessage::DataRequest(req) => self.handle_data_request(from, req, now),
            MleMessage::DataResponse(resp) => self.handle_data_response(from, resp, now),
            MleMessage::ChildIdRequest(req) => self.handle_child_id_request(from, req, now),
            MleMessage::ChildIdResponse(resp) => self.handle_child_id_response(from, resp, now),
        }
    }

    /// Response carrying every dataset whose timestamp differs from the
    /// peer's.
    fn response_for(
        &self,
        peer_active: Option<Timestamp>,
        peer_pending: Option<Timestamp>,
        wanted: impl Fn(DatasetKind) -> bool,
        now: Instant,
    ) -> Option<DataResponse> {
        let include = |kind: DatasetKind, peer: Option<Timestamp>| {
            (wanted(kind) && self.timestamp(kind) != peer)
                .then(|| self.dataset_for_wire(kind, now))
                .flatten()
        };
        Some(DataResponse {
            leader_data: self.leader_data()?,
            active_timestamp: self.active_timestamp(),
            pending_timestamp: self.pending_timestamp(),
            active_dataset: include(DatasetKind::Active, peer_active),
            pending_dataset: include(DatasetKind::Pending, peer_pending),
        })
    }

    pub fn handle_data_request(&mut self, from: PeerId, req: DataRequest, now: Instant) -> Vec<Action> {
        let Some(resp) = self.response_for(
            req.active_timestamp,
            req.pending_timestamp,
            |kind| req.wants(kind),
            now,
        ) else {
            debug!(%from, "ignoring data request while detached");
            return Vec::new();
        };
        vec![Action::Unicast {
            to: from,
            message: MleMessage::DataResponse(resp),
        }]
    }

    pub fn handle_child_id_request(
        &mut self,
        from: PeerId,
        req: ChildIdRequest,
        now: Instant,
    ) -> Vec<Action> {
        let Some(resp) =
            self.response_for(req.active_timestamp, req.pending_timestamp, |_| true, now)
        else {
            debug!(%from, "cannot accept child while detached");
            return Vec::new();
        };
        vec![Action::Unicast {
            to: from,
            message: MleMessage::ChildIdResponse(resp),
        }]
    }

    pub fn handle_data_response(
        &mut self,
        from: PeerId,
        resp: DataResponse,
        now: Instant,
    ) -> Vec<Action> {
        let known = match &self.role {
            Role::Attached { leader_data, .. } => *leader_data,
            Role::Leader(_) => return Vec::new(),
            Role::Detached => {
                debug!(%from, "ignoring data response while detached");
                return Vec::new();
            }
        };
        if resp.leader_data.partition_id != known.partition_id {
            debug!(
                %from,
                partition = resp.leader_data.partition_id,
                "ignoring data response from another partition"
            );
            return Vec::new();
        }

        let mut changed = false;
        let mut missing = Vec::new();
        for kind in [DatasetKind::Active, DatasetKind::Pending] {
            if !is_newer(resp.timestamp(kind), self.timestamp(kind)) {
                continue;
            }
            match resp.dataset(kind) {
                Some(dataset) => changed |= self.adopt(kind, dataset.clone(), now),
                None => missing.push(kind),
            }
        }

        if resp.leader_data.is_newer_than(&known) {
            if let Role::Attached { leader_data, .. } = &mut self.role {
                *leader_data = resp.leader_data;
            }
            changed = true;
        }

        let mut actions = Vec::new();
        if !missing.is_empty() {
            debug!(%from, ?missing, "requesting newer datasets");
            actions.push(Action::Unicast {
                to: from,
                message: MleMessage::DataRequest(DataRequest {
                    requested: missing,
                    active_timestamp: self.active_timestamp(),
                    pending_timestamp: self.pending_timestamp(),
                }),
            });
        }
        if changed {
            actions.extend(self.advertisement().map(Action::Multicast));
        }
        actions
    }

    /// Attach completed: take the parent's newer datasets and push our own
    /// newer ones to the leader.
    pub fn handle_child_id_response(
        &mut self,
        from: PeerId,
        resp: DataResponse,
        now: Instant,
    ) -> Vec<Action> {
        info!(
            parent = %from,
            partition = resp.leader_data.partition_id,
            "attached"
        );
        self.role = Role::Attached {
            parent: from,
            leader_data: resp.leader_data,
        };

        let mut actions = Vec::new();
        let mut missing = Vec::new();
        for kind in [DatasetKind::Active, DatasetKind::Pending] {
            let remote = resp.timestamp(kind);
            let local = self.timestamp(kind);
            if is_newer(remote, local) {
                match resp.dataset(kind) {
                    Some(dataset) => {
                        self.adopt(kind, dataset.clone(), now);
                    }
                    None => missing.push(kind),
                }
            } else if is_newer(local, remote) {
                // Re-read: adopting Active may have discarded our Pending.
                if let Some(dataset) = self.dataset_for_wire(kind, now) {
                    info!(
                        %kind,
                        local = ?local,
                        leader = ?remote,
                        "local dataset newer than partition, pushing to leader"
                    );
                    self.metrics.record_reconcile_push();
                    actions.push(Action::SendMgmt {
                        to: MgmtDestination::Leader,
                        request: MgmtRequest::set(kind, &dataset, &[]),
                    });
                }
            }
        }
        if !missing.is_empty() {
            actions.push(Action::Unicast {
                to: from,
                message: MleMessage::DataRequest(DataRequest {
                    requested: missing,
                    active_timestamp: self.active_timestamp(),
                    pending_timestamp: self.pending_timestamp(),
                }),
            });
        }
        actions
    }

    /// Replace the local `kind` dataset with a newer copy from the network.
    fn adopt(&mut self, kind: DatasetKind, dataset: Dataset, now: Instant) -> bool {
        let dataset = dataset.with_kind(kind);
        let ts = dataset.timestamp();
        let result = match kind {
            DatasetKind::Active => {
                let previous = self.active.read().cloned();
                self.active.save(dataset, None).map(|()| {
                    self.after_active_replaced(previous.as_ref());
                })
            }
            DatasetKind::Pending => {
                let delay = dataset.delay_timer().unwrap_or_default();
                self.pending.save(dataset, Some(delay)).map(|()| {
                    self.arm_delay(now, delay);
                    self.notifier.signal(DatasetEvent::PendingDatasetChanged);
                })
            }
        };
        match result {
            Ok(()) => {
                info!(%kind, ?ts, "adopted newer dataset");
                self.metrics.record_adopted();
                true
            }
            Err(e) => {
                error!(%kind, ?ts, error = %e, "failed to persist adopted dataset");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Delay timer
    // ------------------------------------------------------------------

    /// Earliest instant at which [`Self::handle_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.delay.deadline(), self.next_checkpoint) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timer(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.delay.take_expired(now) {
            actions = self.commit_pending(now);
        }
        if self.next_checkpoint.is_some_and(|at| at <= now) {
            if let Err(e) = self.checkpoint_delay(now) {
                warn!(error = %e, "failed to checkpoint pending delay");
                self.next_checkpoint = Some(now + self.config.delay_checkpoint_interval());
            }
        }
        actions
    }

    /// Promote the Pending dataset to Active. A no-op without a Pending
    /// dataset.
    pub fn commit_pending(&mut self, now: Instant) -> Vec<Action> {
        let Some(pending) = self.pending.read().cloned() else {
            debug!("commit requested without pending dataset");
            self.delay.cancel();
            return Vec::new();
        };
        self.delay.cancel();
        let retry_at = now + self.config.delay_checkpoint_interval();

        if self.commit_would_regress(&pending) {
            warn!(
                pending_active = ?pending.active_timestamp(),
                active = ?self.active_timestamp(),
                "refusing to commit pending dataset older than active dataset"
            );
            self.next_checkpoint = None;
            self.drop_pending(Some(retry_at));
            self.notifier.signal(DatasetEvent::PendingDatasetChanged);
            return self.leader_changed(true);
        }

        let previous = self.active.read().cloned();
        let mut committed = previous
            .clone()
            .unwrap_or_else(|| Dataset::new(DatasetKind::Active));
        committed.overlay(&pending.with_kind(DatasetKind::Active));
        committed.remove(MeshcopTlv::PendingTimestamp);
        committed.remove(MeshcopTlv::DelayTimer);

        if let Err(e) = self.active.save(committed, None) {
            error!(error = %e, "failed to commit pending dataset, retrying later");
            self.arm_delay(now, self.config.delay_checkpoint_interval());
            return Vec::new();
        }
        self.next_checkpoint = None;
        self.drop_pending(Some(retry_at));

        info!(active = ?self.active_timestamp(), "pending dataset committed");
        self.after_active_replaced(previous.as_ref());
        self.notifier.signal(DatasetEvent::PendingDatasetChanged);
        self.metrics.record_commit();
        self.leader_changed(true)
    }

    /// Persist the remaining delay so a restart resumes from here.
    pub fn checkpoint_delay(&mut self, now: Instant) -> DatasetResult<()> {
        if self.pending.has_stale_record() {
            self.pending.clear()?;
            info!("deleted leftover pending dataset record");
        }
        let remaining = self.delay.remaining(now);
        let (Some(dataset), Some(remaining)) = (self.pending_for_wire(now), remaining) else {
            self.next_checkpoint = None;
            return Ok(());
        };
        self.pending.save(dataset, Some(remaining))?;
        debug!(?remaining, "pending delay checkpointed");
        self.next_checkpoint = Some(now + self.config.delay_checkpoint_interval());
        Ok(())
    }

    /// Final checkpoint before the node stops.
    pub fn shutdown(&mut self, now: Instant) {
        if let Err(e) = self.checkpoint_delay(now) {
            warn!(error = %e, "failed to persist pending delay at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Channel, MeshLocalPrefix, NetworkKey},
        security_policy::{PolicyFlags, SecurityPolicy},
        storage::{MemorySettings, SettingsKey},
        tlv::Tlv,
    };

    const LEADER: PeerId = PeerId(0x0000);
    const CHILD: PeerId = PeerId(0x0401);
    const COMMISSIONER: PeerId = PeerId(0x0c00);

    fn engine(rloc: PeerId, store: Arc<MemorySettings>, now: Instant) -> DatasetEngine {
        DatasetEngine::new(DatasetConfig::default(), rloc, EngineContext::new(store), now)
            .unwrap()
    }

    fn network(seconds: u64) -> Dataset {
        let mut rng = rand::rng();
        let mut ds = Dataset::generate_network(&mut rng, Channel::new(15), "engine").unwrap();
        ds.set_active_timestamp(Timestamp::from_seconds(seconds));
        ds
    }

    fn leader_with(active: Dataset, now: Instant) -> DatasetEngine {
        let mut leader = engine(LEADER, Arc::new(MemorySettings::new()), now);
        leader.save_local_active(active).unwrap();
        leader.become_leader(7, 0, 64);
        leader
    }

    fn pending_set(pending: u64, active: u64, delay: Duration) -> TlvSet {
        let mut req = Dataset::new(DatasetKind::Pending);
        req.set_pending_timestamp(Timestamp::from_seconds(pending));
        req.set_active_timestamp(Timestamp::from_seconds(active));
        req.set_delay_timer(delay);
        req.set_mesh_local_prefix(MeshLocalPrefix([0xfd, 0, 0x0d, 0xb8, 0, 0, 0, 1]));
        req.into_tlvs()
    }

    fn unicast(actions: Vec<Action>, to: PeerId) -> MleMessage {
        actions
            .into_iter()
            .find_map(|a| match a {
                Action::Unicast { to: dst, message } if dst == to => Some(message),
                _ => None,
            })
            .expect("no unicast for peer")
    }

    fn attach(child: &mut DatasetEngine, leader: &mut DatasetEngine, now: Instant) -> Vec<Action> {
        let reply = leader.handle_mle(child.rloc(), child.child_id_request(), now);
        child.handle_mle(leader.rloc(), unicast(reply, child.rloc()), now)
    }

    #[test]
    fn test_commit_merges_pending_and_is_idempotent() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let version = leader.leader_data().unwrap().data_version;

        leader
            .process_set(
                DatasetKind::Pending,
                &pending_set(1, 20, Duration::from_secs(60)),
                None,
                now,
            )
            .unwrap();
        assert_eq!(leader.delay_remaining(now), Some(Duration::from_secs(60)));
        assert!(leader.handle_timer(now + Duration::from_secs(59)).is_empty());

        let actions = leader.handle_timer(now + Duration::from_secs(60));
        assert!(matches!(actions.as_slice(), [Action::Multicast(_)]));
        let active = leader.active().unwrap();
        assert_eq!(active.active_timestamp(), Some(Timestamp::from_seconds(20)));
        assert_eq!(
            active.mesh_local_prefix(),
            Some(MeshLocalPrefix([0xfd, 0, 0x0d, 0xb8, 0, 0, 0, 1]))
        );
        assert!(!active.contains(MeshcopTlv::PendingTimestamp));
        assert!(!active.contains(MeshcopTlv::DelayTimer));
        assert!(leader.pending().is_none());
        assert!(leader.next_deadline().is_none());
        assert_ne!(leader.leader_data().unwrap().data_version, version);

        let committed = leader.active().cloned();
        assert!(leader.commit_pending(now + Duration::from_secs(61)).is_empty());
        assert_eq!(leader.active().cloned(), committed);
        assert_eq!(leader.metrics().snapshot().pending_commits, 1);
    }

    #[test]
    fn test_get_withholds_network_key_without_obtain_flag() {
        let now = Instant::now();
        let mut ds = network(10);
        let mut leader = leader_with(ds.clone(), now);

        let all = leader.get_response(DatasetKind::Active, &[], now);
        assert!(all.contains(MeshcopTlv::NetworkKey.code()));

        let mut policy = SecurityPolicy::default();
        policy.flags.remove(PolicyFlags::OBTAIN_NETWORK_KEY);
        ds.set_security_policy(policy);
        ds.set_active_timestamp(Timestamp::from_seconds(11));
        leader.save_local_active(ds).unwrap();

        let all = leader.get_response(DatasetKind::Active, &[], now);
        assert!(!all.contains(MeshcopTlv::NetworkKey.code()));
        assert!(all.contains(MeshcopTlv::Pskc.code()));

        let filtered = leader.get_response(
            DatasetKind::Active,
            &[MeshcopTlv::NetworkKey.code(), MeshcopTlv::PanId.code()],
            now,
        );
        assert_eq!(filtered.types().collect::<Vec<_>>(), vec![MeshcopTlv::PanId.code()]);
        assert!(!leader.discovery_capabilities().unwrap().network_key_obtainable);
    }

    #[test]
    fn test_get_pending_reports_remaining_delay() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        assert!(leader.get_response(DatasetKind::Pending, &[], now).is_empty());

        leader
            .process_set(
                DatasetKind::Pending,
                &pending_set(1, 20, Duration::from_secs(100)),
                None,
                now,
            )
            .unwrap();
        let later = now + Duration::from_secs(40);
        let tlvs = leader.get_response(DatasetKind::Pending, &[], later);
        let delay = Dataset::from_tlvs(DatasetKind::Pending, tlvs)
            .unwrap()
            .delay_timer();
        assert_eq!(delay, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_set_forwarded_by_non_leader() {
        let now = Instant::now();
        let mut child = engine(CHILD, Arc::new(MemorySettings::new()), now);
        let request = MgmtRequest::set(DatasetKind::Active, &network(30), &[]);
        assert_eq!(
            child.handle_mgmt(COMMISSIONER, request.clone(), now),
            MgmtDisposition::ForwardToLeader(request)
        );
    }

    #[test]
    fn test_rejected_set_replies_reject_and_counts() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let stale = MgmtRequest::set(DatasetKind::Active, &network(10), &[]);
        let MgmtDisposition::Reply { response, actions } =
            leader.handle_mgmt(COMMISSIONER, stale, now)
        else {
            panic!("leader must reply");
        };
        assert_eq!(response, MgmtResponse::State(MgmtState::Reject));
        assert!(actions.is_empty());
        assert_eq!(leader.metrics().snapshot().active_sets_rejected, 1);
        assert_eq!(leader.active_timestamp(), Some(Timestamp::from_seconds(10)));
    }

    #[test]
    fn test_node_origin_set_notifies_commissioner() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        assert!(leader.set_commissioner(Some(CommissionerSession {
            session_id: 0x1234,
            peer: COMMISSIONER,
        })));

        let session = Tlv::new(
            MeshcopTlv::CommissionerSessionId.code(),
            0x1234u16.to_be_bytes().to_vec(),
        )
        .unwrap();
        let from_commissioner = MgmtRequest::set(DatasetKind::Active, &network(20), &[session]);
        let MgmtDisposition::Reply { response, actions } =
            leader.handle_mgmt(COMMISSIONER, from_commissioner, now)
        else {
            panic!("leader must reply");
        };
        assert_eq!(response, MgmtResponse::State(MgmtState::Accept));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SendMgmt { .. })));
        // Session id is not stored in the dataset
        assert!(!leader
            .active()
            .unwrap()
            .tlvs()
            .contains(MeshcopTlv::CommissionerSessionId.code()));

        let from_node = MgmtRequest::set(DatasetKind::Active, &network(30), &[]);
        let MgmtDisposition::Reply { actions, .. } = leader.handle_mgmt(CHILD, from_node, now)
        else {
            panic!("leader must reply");
        };
        assert!(actions.contains(&Action::SendMgmt {
            to: MgmtDestination::Peer(COMMISSIONER),
            request: MgmtRequest::DatasetChanged,
        }));
    }

    #[test]
    fn test_wrong_session_rejected() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let err = leader
            .process_set(DatasetKind::Active, network(20).tlvs(), Some(0x0bad), now)
            .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidCommissionerSession {
                received: 0x0bad,
                expected: None
            }
        ));
        assert_eq!(leader.active_timestamp(), Some(Timestamp::from_seconds(10)));
    }

    #[test]
    fn test_child_adopts_newer_dataset_after_advertisement() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let mut child = engine(CHILD, Arc::new(MemorySettings::new()), now);

        attach(&mut child, &mut leader, now);
        assert_eq!(child.active_timestamp(), Some(Timestamp::from_seconds(10)));

        let mut update = leader.active().unwrap().clone();
        update.set_active_timestamp(Timestamp::from_seconds(30));
        update.set_pan_id(0x4321);
        let actions = leader
            .process_set(DatasetKind::Active, update.tlvs(), None, now)
            .unwrap();
        let [Action::Multicast(advert)] = actions.as_slice() else {
            panic!("expected one advertisement");
        };

        let request = unicast(child.handle_mle(LEADER, advert.clone(), now), LEADER);
        let response = unicast(leader.handle_mle(CHILD, request, now), CHILD);
        let actions = child.handle_mle(LEADER, response, now);

        assert_eq!(child.active().unwrap().pan_id(), Some(0x4321));
        assert_eq!(child.leader_data(), leader.leader_data());
        // Re-advertised to its own neighbours
        assert!(matches!(actions.as_slice(), [Action::Multicast(_)]));
        // Same advertisement again changes nothing
        assert!(child.handle_mle(LEADER, advert.clone(), now).is_empty());
    }

    #[test]
    fn test_attach_pushes_newer_local_dataset_to_leader() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let mut child = engine(CHILD, Arc::new(MemorySettings::new()), now);
        child.save_local_active(network(50)).unwrap();

        let actions = attach(&mut child, &mut leader, now);
        assert_eq!(child.active_timestamp(), Some(Timestamp::from_seconds(50)));
        let push = actions
            .into_iter()
            .find_map(|a| match a {
                Action::SendMgmt {
                    to: MgmtDestination::Leader,
                    request,
                } => Some(request),
                _ => None,
            })
            .expect("push to leader");
        assert_eq!(push.session_id(), None);

        let MgmtDisposition::Reply { response, .. } = leader.handle_mgmt(CHILD, push, now) else {
            panic!("leader must reply");
        };
        assert_eq!(response, MgmtResponse::State(MgmtState::Accept));
        assert_eq!(leader.active_timestamp(), Some(Timestamp::from_seconds(50)));
        assert_eq!(child.metrics().snapshot().reconcile_pushes, 1);
    }

    #[test]
    fn test_adopting_active_discards_superseded_pending() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let mut child = engine(CHILD, Arc::new(MemorySettings::new()), now);
        attach(&mut child, &mut leader, now);

        // Child alone holds a pending dataset targeting active 20.
        let mut pending = child.active().unwrap().clone().with_kind(DatasetKind::Pending);
        pending.set_pending_timestamp(Timestamp::from_seconds(5));
        pending.set_active_timestamp(Timestamp::from_seconds(20));
        pending.set_delay_timer(Duration::from_secs(300));
        child.save_local_pending(pending, now).unwrap();

        let mut update = leader.active().unwrap().clone();
        update.set_active_timestamp(Timestamp::from_seconds(25));
        let actions = leader
            .process_set(DatasetKind::Active, update.tlvs(), None, now)
            .unwrap();
        let [Action::Multicast(advert)] = actions.as_slice() else {
            panic!("expected one advertisement");
        };
        let request = unicast(child.handle_mle(LEADER, advert.clone(), now), LEADER);
        let response = unicast(leader.handle_mle(CHILD, request, now), CHILD);
        child.handle_mle(LEADER, response, now);

        assert_eq!(child.active_timestamp(), Some(Timestamp::from_seconds(25)));
        assert!(child.pending().is_none());
        assert!(child.delay_remaining(now).is_none());
    }

    #[test]
    fn test_restart_resumes_pending_delay() {
        let now = Instant::now();
        let store = Arc::new(MemorySettings::new());
        let mut first = engine(CHILD, store.clone(), now);
        first.save_local_active(network(10)).unwrap();
        let mut pending = network(20).with_kind(DatasetKind::Pending);
        pending.set_pending_timestamp(Timestamp::from_seconds(2));
        pending.set_delay_timer(Duration::from_secs(120));
        first.save_local_pending(pending, now).unwrap();

        let later = now + Duration::from_secs(70);
        first.checkpoint_delay(later).unwrap();
        drop(first);

        let second = engine(CHILD, store, later);
        assert_eq!(second.pending_timestamp(), Some(Timestamp::from_seconds(2)));
        assert_eq!(second.delay_remaining(later), Some(Duration::from_secs(50)));
    }

    #[test]
    fn test_failed_pending_delete_never_rolls_active_back() {
        let now = Instant::now();
        let store = Arc::new(MemorySettings::new());
        let mut leader = engine(LEADER, store.clone(), now);
        leader.save_local_active(network(10)).unwrap();
        leader.become_leader(7, 0, 64);
        leader
            .process_set(
                DatasetKind::Pending,
                &pending_set(1, 20, Duration::from_secs(60)),
                None,
                now,
            )
            .unwrap();

        store.set_fail_deletes(true);
        let commit_at = now + Duration::from_secs(60);
        leader.handle_timer(commit_at);
        assert_eq!(leader.active_timestamp(), Some(Timestamp::from_seconds(20)));
        assert!(leader.pending().is_none());
        assert!(leader.advertisement().is_some_and(|m| match m {
            MleMessage::DataResponse(resp) => resp.pending_timestamp.is_none(),
            _ => false,
        }));
        assert!(store.read(SettingsKey::PendingDataset).unwrap().is_some());
        assert!(leader.next_deadline().is_some());

        let mut newer = leader.active().cloned().unwrap();
        newer.set_active_timestamp(Timestamp::from_seconds(50));
        leader
            .process_set(DatasetKind::Active, newer.tlvs(), None, commit_at)
            .unwrap();

        // Reboot on the store still holding the committed Pending record.
        let boot = commit_at + Duration::from_secs(1);
        let mut rebooted = engine(LEADER, store.clone(), boot);
        assert_eq!(rebooted.active_timestamp(), Some(Timestamp::from_seconds(50)));
        assert!(rebooted.pending().is_none());
        rebooted.handle_timer(boot + Duration::from_secs(61));
        assert_eq!(rebooted.active_timestamp(), Some(Timestamp::from_seconds(50)));

        store.set_fail_deletes(false);
        rebooted.handle_timer(boot + Duration::from_secs(122));
        assert!(store.read(SettingsKey::PendingDataset).unwrap().is_none());
        assert!(rebooted.next_deadline().is_none());

        rebooted.become_leader(7, 0, 64);
        rebooted
            .process_set(
                DatasetKind::Pending,
                &pending_set(1, 60, Duration::from_secs(60)),
                None,
                boot,
            )
            .unwrap();
        assert_eq!(rebooted.pending_timestamp(), Some(Timestamp::from_seconds(1)));
    }

    #[test]
    fn test_commit_refuses_pending_behind_active_without_key_change() {
        let now = Instant::now();
        let mut child = engine(CHILD, Arc::new(MemorySettings::new()), now);
        let active = network(50);
        child.save_local_active(active.clone()).unwrap();
        let mut stale = active.with_kind(DatasetKind::Pending);
        stale.set_active_timestamp(Timestamp::from_seconds(20));
        stale.set_pending_timestamp(Timestamp::from_seconds(4));
        stale.set_delay_timer(Duration::from_secs(30));
        child.save_local_pending(stale, now).unwrap();

        child.handle_timer(now + Duration::from_secs(30));
        assert_eq!(child.active_timestamp(), Some(Timestamp::from_seconds(50)));
        assert!(child.pending().is_none());
        assert_eq!(child.metrics().snapshot().pending_commits, 0);
    }

    #[test]
    fn test_key_change_set_clamped_and_counted() {
        let now = Instant::now();
        let mut leader = leader_with(network(10), now);
        let mut request = pending_set(1, 5, Duration::from_secs(60));
        request.insert(Tlv::new(MeshcopTlv::NetworkKey.code(), vec![0x42; 16]).unwrap());

        leader
            .process_set(DatasetKind::Pending, &request, None, now)
            .unwrap();
        assert_eq!(leader.delay_remaining(now), Some(Duration::from_secs(300)));
        assert_eq!(
            leader.pending().unwrap().network_key(),
            Some(NetworkKey([0x42; 16]))
        );
        assert_eq!(leader.metrics().snapshot().delay_clamps, 1);
    }
}
