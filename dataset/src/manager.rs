//! Dataset managers
//!
//! A [`DatasetManager`] owns one kind of dataset on one node together with
//! its persisted record. Updates are persisted before the in-memory copy is
//! replaced, so a failed write leaves both untouched. Clearing always drops
//! the in-memory copy; a record the store failed to delete is remembered
//! until a later [`DatasetManager::clear`] or save removes it.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    dataset::{Dataset, DatasetKind},
    delay_timer::WallClock,
    error::DatasetResult,
    storage::{PersistedDataset, SettingsKey, SettingsStore},
    timestamp::Timestamp,
};

pub struct DatasetManager {
    kind: DatasetKind,
    local: Option<Dataset>,
    stale_record: bool,
    store: Arc<dyn SettingsStore>,
    clock: Arc<dyn WallClock>,
}

impl std::fmt::Debug for DatasetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetManager")
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp())
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl DatasetManager {
    pub fn new(kind: DatasetKind, store: Arc<dyn SettingsStore>, clock: Arc<dyn WallClock>) -> Self {
        Self {
            kind,
            local: None,
            stale_record: false,
            store,
            clock,
        }
    }

    /// Load the persisted record, if any. An undecodable record is ignored
    /// and the manager starts empty.
    pub fn restore(
        kind: DatasetKind,
        store: Arc<dyn SettingsStore>,
        clock: Arc<dyn WallClock>,
    ) -> DatasetResult<(Self, Option<PersistedDataset>)> {
        let mut manager = Self::new(kind, store, clock);
        let record = manager.store.read(kind.into())?;
        if let Some(record) = &record {
            match Dataset::decode(kind, &record.tlvs) {
                Ok(dataset) => {
                    info!(
                        %kind,
                        timestamp = ?dataset.timestamp(),
                        saved_at = %record.saved_at,
                        "restored dataset"
                    );
                    manager.local = Some(dataset);
                }
                Err(e) => {
                    warn!(%kind, error = %e, "ignoring undecodable persisted dataset");
                    return Ok((manager, None));
                }
            }
        }
        Ok((manager, record))
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn read(&self) -> Option<&Dataset> {
        self.local.as_ref()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.local.as_ref().and_then(Dataset::timestamp)
    }

    /// Unconditional local save, bypassing the acceptance policy. Used for
    /// initial provisioning.
    pub fn save_local(&mut self, dataset: Dataset) -> DatasetResult<()> {
        let dataset = dataset.with_kind(self.kind);
        let delay = dataset.delay_timer();
        self.save(dataset, delay)
    }

    /// Persist `dataset` (with `delay_remaining` for Pending) and make it the
    /// local copy.
    pub fn save(&mut self, dataset: Dataset, delay_remaining: Option<Duration>) -> DatasetResult<()> {
        let record = PersistedDataset {
            tlvs: dataset.encode().to_vec(),
            delay_remaining_ms: delay_remaining
                .map(|d| u32::try_from(d.as_millis()).unwrap_or(u32::MAX)),
            saved_at: self.clock.now(),
        };
        self.store.write(SettingsKey::from(self.kind), &record)?;
        debug!(
            kind = %self.kind,
            timestamp = ?dataset.timestamp(),
            len = record.tlvs.len(),
            "dataset saved"
        );
        self.local = Some(dataset);
        self.stale_record = false;
        Ok(())
    }

    /// True when the persisted record outlived a cleared dataset.
    pub fn has_stale_record(&self) -> bool {
        self.stale_record
    }

    /// Drop the dataset and delete its record. On a failed delete the
    /// dataset is still gone from memory and the error is returned so the
    /// caller can retry.
    pub fn clear(&mut self) -> DatasetResult<()> {
        if self.local.take().is_none() && !self.stale_record {
            return Ok(());
        }
        if let Err(e) = self.store.delete(SettingsKey::from(self.kind)) {
            self.stale_record = true;
            return Err(e.into());
        }
        debug!(kind = %self.kind, "dataset cleared");
        self.stale_record = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::Channel,
        delay_timer::SystemClock,
        error::DatasetError,
        storage::MemorySettings,
    };

    fn sample() -> Dataset {
        let mut rng = rand::rng();
        Dataset::generate_network(&mut rng, Channel::new(20), "mgr").unwrap()
    }

    #[test]
    fn test_save_then_restore() {
        let store = Arc::new(MemorySettings::new());
        let mut manager =
            DatasetManager::new(DatasetKind::Active, store.clone(), Arc::new(SystemClock));
        let ds = sample();
        manager.save_local(ds.clone()).unwrap();
        assert_eq!(manager.read(), Some(&ds));

        let (restored, record) =
            DatasetManager::restore(DatasetKind::Active, store, Arc::new(SystemClock)).unwrap();
        assert_eq!(restored.read(), Some(&ds));
        assert_eq!(record.unwrap().delay_remaining_ms, None);
    }

    #[test]
    fn test_failed_write_keeps_previous_copy() {
        let store = Arc::new(MemorySettings::new());
        let mut manager =
            DatasetManager::new(DatasetKind::Active, store.clone(), Arc::new(SystemClock));
        let first = sample();
        manager.save_local(first.clone()).unwrap();

        store.set_fail_writes(true);
        let err = manager.save_local(sample()).unwrap_err();
        assert!(matches!(err, DatasetError::Storage(_)));
        assert_eq!(manager.read(), Some(&first));
    }

    #[test]
    fn test_failed_delete_drops_copy_and_retries() {
        let store = Arc::new(MemorySettings::new());
        let mut manager =
            DatasetManager::new(DatasetKind::Active, store.clone(), Arc::new(SystemClock));
        manager.save_local(sample()).unwrap();

        store.set_fail_deletes(true);
        assert!(manager.clear().is_err());
        assert!(manager.read().is_none());
        assert!(manager.has_stale_record());
        assert!(store.read(SettingsKey::ActiveDataset).unwrap().is_some());

        store.set_fail_deletes(false);
        manager.clear().unwrap();
        assert!(!manager.has_stale_record());
        assert!(store.read(SettingsKey::ActiveDataset).unwrap().is_none());
    }

    #[test]
    fn test_pending_save_records_remaining_delay() {
        let store = Arc::new(MemorySettings::new());
        let mut manager =
            DatasetManager::new(DatasetKind::Pending, store.clone(), Arc::new(SystemClock));
        let mut ds = sample().with_kind(DatasetKind::Pending);
        ds.set_pending_timestamp(Timestamp::from_seconds(3));
        ds.set_delay_timer(Duration::from_secs(90));
        manager.save_local(ds).unwrap();

        let record = store.read(SettingsKey::PendingDataset).unwrap().unwrap();
        assert_eq!(record.delay_remaining_ms, Some(90_000));
        assert_eq!(manager.timestamp(), Some(Timestamp::from_seconds(3)));
    }

    #[test]
    fn test_undecodable_record_is_ignored() {
        let store = Arc::new(MemorySettings::new());
        store
            .write(
                SettingsKey::ActiveDataset,
                &PersistedDataset {
                    tlvs: vec![0x01, 0x05, 0x00],
                    delay_remaining_ms: None,
                    saved_at: chrono::Utc::now(),
                },
            )
            .unwrap();
        let (manager, record) =
            DatasetManager::restore(DatasetKind::Active, store, Arc::new(SystemClock)).unwrap();
        assert!(manager.read().is_none());
        assert!(record.is_none());
    }
}
