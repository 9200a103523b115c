//! Tokio runtime for a [`DatasetEngine`]
//!
//! One task owns the engine and serialises everything that touches it:
//! inbound mesh frames, management requests, local provisioning and the
//! delay/checkpoint deadlines. Outbound management requests run in their
//! own tasks so a slow leader never stalls the loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing as log;
use tracing::{instrument, Instrument};

use crate::{
    dataset::{Dataset, DatasetKind},
    engine::{Action, DatasetEngine, MgmtDisposition},
    error::{DatasetResult, NodeError, NodeResult, TransportError},
    leader::CommissionerSession,
    metrics::{DatasetMetrics, MetricsSnapshot},
    mgmt::{MgmtClient, MgmtDestination, MgmtRequest, MgmtResponse, MgmtState, MgmtTransport},
    mle::{MleMessage, PeerId},
    notifier::{DatasetEvent, Notifier},
};

const INBOX_CAPACITY: usize = 256;

/// Datagram side of the mesh: MLE frames to neighbours.
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    async fn multicast(&self, message: MleMessage) -> Result<(), TransportError>;

    async fn unicast(&self, to: PeerId, message: MleMessage) -> Result<(), TransportError>;
}

pub enum NodeCommand {
    Mle {
        from: PeerId,
        message: MleMessage,
    },
    Mgmt {
        from: PeerId,
        request: MgmtRequest,
        reply: oneshot::Sender<MgmtResponse>,
    },
    SaveLocal {
        dataset: Dataset,
        reply: oneshot::Sender<DatasetResult<()>>,
    },
    Read {
        kind: DatasetKind,
        reply: oneshot::Sender<Option<Dataset>>,
    },
    BecomeLeader {
        partition_id: u32,
        leader_router_id: u8,
        weighting: u8,
    },
    Attach {
        parent: PeerId,
    },
    Detach,
    SetCommissioner(Option<CommissionerSession>),
}

/// Cloneable handle to a running [`DatasetNode`].
#[derive(Clone)]
pub struct NodeHandle {
    rloc: PeerId,
    tx: mpsc::Sender<NodeCommand>,
    mgmt: Arc<MgmtClient>,
    notifier: Notifier,
    metrics: Arc<DatasetMetrics>,
}

impl NodeHandle {
    pub fn rloc(&self) -> PeerId {
        self.rloc
    }

    async fn send(&self, command: NodeCommand) -> NodeResult<()> {
        self.tx.send(command).await.map_err(|_| NodeError::Stopped)
    }

    /// Deliver a decoded MLE message from a neighbour.
    pub async fn deliver_mle(&self, from: PeerId, message: MleMessage) -> NodeResult<()> {
        self.send(NodeCommand::Mle { from, message }).await
    }

    /// Decode and deliver a raw MLE frame.
    pub async fn deliver_frame(&self, frame: &[u8]) -> NodeResult<()> {
        let (from, message) = MleMessage::decode(frame).map_err(|e| NodeError::Dataset(e.into()))?;
        self.deliver_mle(from, message).await
    }

    /// Handle a management request addressed to this node and wait for the
    /// reply (forwarded to the leader when this node is not the leader).
    pub async fn mgmt(&self, from: PeerId, request: MgmtRequest) -> NodeResult<MgmtResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Mgmt {
            from,
            request,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Route a response to one of this node's outbound management requests.
    pub fn mgmt_response(&self, id: u16, response: MgmtResponse) -> bool {
        self.mgmt.handle_response(id, response)
    }

    /// Client for issuing management requests from this node.
    pub fn mgmt_client(&self) -> &Arc<MgmtClient> {
        &self.mgmt
    }

    pub async fn read(&self, kind: DatasetKind) -> NodeResult<Option<Dataset>> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Read { kind, reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Provision a dataset locally, bypassing the acceptance policy.
    pub async fn save_local(&self, dataset: Dataset) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::SaveLocal { dataset, reply }).await?;
        Ok(rx.await.map_err(|_| NodeError::Stopped)??)
    }

    pub async fn become_leader(
        &self,
        partition_id: u32,
        leader_router_id: u8,
        weighting: u8,
    ) -> NodeResult<()> {
        self.send(NodeCommand::BecomeLeader {
            partition_id,
            leader_router_id,
            weighting,
        })
        .await
    }

    pub async fn attach(&self, parent: PeerId) -> NodeResult<()> {
        self.send(NodeCommand::Attach { parent }).await
    }

    pub async fn detach(&self) -> NodeResult<()> {
        self.send(NodeCommand::Detach).await
    }

    pub async fn set_commissioner(&self, session: Option<CommissionerSession>) -> NodeResult<()> {
        self.send(NodeCommand::SetCommissioner(session)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatasetEvent> {
        self.notifier.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub struct DatasetNode {
    engine: DatasetEngine,
    mesh: Arc<dyn MeshTransport>,
    mgmt: Arc<MgmtClient>,
    inbox: mpsc::Receiver<NodeCommand>,
}

impl DatasetNode {
    pub fn new(
        engine: DatasetEngine,
        mesh: Arc<dyn MeshTransport>,
        mgmt_transport: Arc<dyn MgmtTransport>,
    ) -> (Self, NodeHandle) {
        let mgmt = Arc::new(MgmtClient::new(
            mgmt_transport,
            &engine.config().mgmt,
            engine.metrics().clone(),
        ));
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let handle = NodeHandle {
            rloc: engine.rloc(),
            tx,
            mgmt: mgmt.clone(),
            notifier: engine.notifier().clone(),
            metrics: engine.metrics().clone(),
        };
        let node = Self {
            engine,
            mesh,
            mgmt,
            inbox,
        };
        (node, handle)
    }

    /// Run until `signal` fires or every handle is dropped. The remaining
    /// pending delay is checkpointed on the way out.
    #[instrument(fields(rloc = %self.engine.rloc()), skip(self, signal))]
    pub async fn event_loop(mut self, mut signal: watch::Receiver<()>) {
        let period = self.engine.config().advertise_interval();
        let mut advertise = tokio::time::interval_at(Instant::now() + period, period);
        advertise.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                _ = signal.changed() => {
                    log::info!("Shutdown signal received, stopping dataset node");
                    break;
                }
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        log::info!("All node handles dropped, stopping dataset node");
                        break;
                    };
                    self.dispatch(command).await;
                }
                _ = sleep_until(deadline) => {
                    let actions = self.engine.handle_timer(Instant::now());
                    self.perform(actions).await;
                }
                _ = advertise.tick() => {
                    if let Some(action) = self.engine.periodic_advertisement() {
                        self.perform(vec![action]).await;
                    }
                }
            }
        }

        self.engine.shutdown(Instant::now());
    }

    async fn dispatch(&mut self, command: NodeCommand) {
        let now = Instant::now();
        match command {
            NodeCommand::Mle { from, message } => {
                log::trace!(%from, command = ?message.command(), "mle message");
                let actions = self.engine.handle_mle(from, message, now);
                self.perform(actions).await;
            }
            NodeCommand::Mgmt {
                from,
                request,
                reply,
            } => {
                let uri = request.command().uri();
                match self.engine.handle_mgmt(from, request, now) {
                    MgmtDisposition::Reply { response, actions } => {
                        if reply.send(response).is_err() {
                            log::debug!(%from, uri, "requester gone before reply");
                        }
                        self.perform(actions).await;
                    }
                    MgmtDisposition::ForwardToLeader(request) => {
                        self.forward(from, request, reply);
                    }
                }
            }
            NodeCommand::SaveLocal { dataset, reply } => {
                let result = match dataset.kind() {
                    DatasetKind::Active => self.engine.save_local_active(dataset),
                    DatasetKind::Pending => self.engine.save_local_pending(dataset, now),
                };
                match result {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        self.perform(actions).await;
                    }
                    Err(e) => {
                        log::warn!(error = %e, "Local dataset save failed");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeCommand::Read { kind, reply } => {
                let dataset = match kind {
                    DatasetKind::Active => self.engine.active().cloned(),
                    DatasetKind::Pending => self.engine.pending_for_wire(now),
                };
                let _ = reply.send(dataset);
            }
            NodeCommand::BecomeLeader {
                partition_id,
                leader_router_id,
                weighting,
            } => {
                let actions = self
                    .engine
                    .become_leader(partition_id, leader_router_id, weighting);
                self.perform(actions).await;
            }
            NodeCommand::Attach { parent } => {
                let request = self.engine.child_id_request();
                self.perform(vec![Action::Unicast {
                    to: parent,
                    message: request,
                }])
                .await;
            }
            NodeCommand::Detach => self.engine.detach(),
            NodeCommand::SetCommissioner(session) => {
                if !self.engine.set_commissioner(session) {
                    log::warn!("Ignoring commissioner registration on a non-leader");
                }
            }
        }
    }

    /// Relay a Set to the leader and pass its State back to the requester.
    fn forward(&self, from: PeerId, request: MgmtRequest, reply: oneshot::Sender<MgmtResponse>) {
        let client = self.mgmt.clone();
        tokio::spawn(
            async move {
                let response = match client.request(MgmtDestination::Leader, request).await {
                    Ok(response) => response,
                    Err(e) => {
                        log::warn!(%from, error = %e, "Forwarding set request to leader failed");
                        MgmtResponse::State(MgmtState::Reject)
                    }
                };
                let _ = reply.send(response);
            }
            .in_current_span(),
        );
    }

    async fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Multicast(message) => {
                    if let Err(e) = self.mesh.multicast(message).await {
                        log::warn!(error = %e, "Multicast failed");
                    }
                }
                Action::Unicast { to, message } => {
                    if let Err(e) = self.mesh.unicast(to, message).await {
                        log::warn!(%to, error = %e, "Unicast failed");
                    }
                }
                Action::SendMgmt { to, request } => {
                    let client = self.mgmt.clone();
                    let uri = request.command().uri();
                    tokio::spawn(
                        async move {
                            match client.request(to, request).await {
                                Ok(response) => {
                                    log::debug!(uri, ?response, "Management request answered")
                                }
                                Err(e) => log::warn!(uri, error = %e, "Management request failed"),
                            }
                        }
                        .in_current_span(),
                    );
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
