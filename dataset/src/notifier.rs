//! Dataset change notifications
//!
//! Subscribers receive [`DatasetEvent`]s over a tokio broadcast channel.
//! Slow subscribers may observe `Lagged` and should re-read the datasets.

use tokio::sync::broadcast;
use tracing::trace;

use crate::{dataset::Dataset, tlv::MeshcopTlv};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetEvent {
    ActiveDatasetChanged,
    PendingDatasetChanged,
    NetworkKeyChanged,
    SecurityPolicyChanged,
    ChannelChanged,
    PanIdChanged,
    MeshLocalPrefixChanged,
    NetworkNameChanged,
    /// The leader reported that datasets changed outside this commissioner.
    LeaderDatasetChanged,
}

impl DatasetEvent {
    /// Field-level event for a changed Active dataset field.
    fn for_field(field: MeshcopTlv) -> Option<Self> {
        Some(match field {
            MeshcopTlv::NetworkKey => Self::NetworkKeyChanged,
            MeshcopTlv::SecurityPolicy => Self::SecurityPolicyChanged,
            MeshcopTlv::Channel => Self::ChannelChanged,
            MeshcopTlv::PanId => Self::PanIdChanged,
            MeshcopTlv::MeshLocalPrefix => Self::MeshLocalPrefixChanged,
            MeshcopTlv::NetworkName => Self::NetworkNameChanged,
            _ => return None,
        })
    }

    /// Events for replacing Active `previous` with `current`.
    pub fn for_active_change(previous: Option<&Dataset>, current: &Dataset) -> Vec<Self> {
        let mut events = vec![Self::ActiveDatasetChanged];
        events.extend(
            current
                .changed_fields(previous)
                .into_iter()
                .filter_map(Self::for_field),
        );
        events
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<DatasetEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatasetEvent> {
        self.tx.subscribe()
    }

    pub fn signal(&self, event: DatasetEvent) {
        // No subscribers is not an error.
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(?event, receivers, "dataset event");
    }

    pub fn signal_all(&self, events: impl IntoIterator<Item = DatasetEvent>) {
        for event in events {
            self.signal(event);
        }
    }
}
