//! Leader acceptance policy for management Set requests
//!
//! Pure functions over the request TLVs and the leader's current datasets.
//! Checks run in a fixed order: timestamps present, timestamps newer,
//! channel supported, field values valid, merged dataset complete, then the
//! key-change delay floor.

use std::time::Duration;

use tracing::debug;

use crate::{
    config::DatasetConfig,
    dataset::{Dataset, DatasetKind},
    error::{DatasetError, DatasetResult, DecodeError},
    security_policy::{SecurityPolicy, MIN_ROTATION_TIME_HOURS},
    timestamp::Timestamp,
    tlv::{MeshcopTlv, TlvSet},
};

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedActive {
    pub dataset: Dataset,
    /// A recognised configuration field (not just a timestamp) changed.
    pub stable_changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedPending {
    pub dataset: Dataset,
    pub delay: Duration,
    pub changes_network_key: bool,
    /// The requested delay was raised to the key-change floor.
    pub clamped: bool,
}

fn request_timestamp(
    request: &TlvSet,
    tlv: MeshcopTlv,
    which: &'static str,
) -> DatasetResult<Timestamp> {
    let value = request
        .value(tlv.code())
        .ok_or(DatasetError::MissingTimestamp(which))?;
    Ok(Timestamp::decode(tlv.code(), value)?)
}

fn check_newer(
    which: &'static str,
    received: Timestamp,
    stored: Option<Timestamp>,
) -> DatasetResult<()> {
    match stored {
        Some(stored) if received <= stored => Err(DatasetError::StaleTimestamp {
            which,
            received,
            stored,
        }),
        _ => Ok(()),
    }
}

fn check_channel(request: &Dataset, config: &DatasetConfig) -> DatasetResult<()> {
    if let Some(channel) = request.channel() {
        if channel.page != 0 || !config.supported_channels().contains(channel.number) {
            return Err(DatasetError::UnsupportedChannel {
                page: channel.page,
                channel: channel.number,
            });
        }
    }
    Ok(())
}

fn check_fields(request: &Dataset, config: &DatasetConfig) -> DatasetResult<()> {
    if request.pan_id() == Some(0xffff) {
        return Err(DatasetError::invalid_field("pan id", "broadcast PAN ID"));
    }
    if let Some(value) = request.tlvs().value(MeshcopTlv::SecurityPolicy.code()) {
        let policy = SecurityPolicy::decode(value)?;
        if policy.rotation_time_hours < MIN_ROTATION_TIME_HOURS {
            return Err(DatasetError::invalid_field(
                "security policy",
                format!(
                    "rotation time {}h below {}h",
                    policy.rotation_time_hours, MIN_ROTATION_TIME_HOURS
                ),
            ));
        }
    }
    if let Some(delay) = request.delay_timer() {
        if delay > config.max_delay() {
            return Err(DatasetError::invalid_field(
                "delay timer",
                format!("{:?} exceeds maximum {:?}", delay, config.max_delay()),
            ));
        }
    }
    Ok(())
}

/// Keep only TLVs a dataset of `kind` stores, validating each.
fn dataset_fields(kind: DatasetKind, request: &TlvSet) -> Result<Dataset, DecodeError> {
    let tlvs = request
        .iter()
        .filter(|t| kind.stores(t.tlv_type()))
        .cloned()
        .collect();
    Dataset::from_tlvs(kind, tlvs)
}

/// Overlay `fields` on `base`, or start from `fields` alone.
fn merge_over(kind: DatasetKind, base: Option<&Dataset>, fields: &Dataset) -> Dataset {
    let mut merged = base
        .cloned()
        .map(|b| b.with_kind(kind))
        .unwrap_or_else(|| Dataset::new(kind));
    merged.overlay(fields);
    merged
}

fn check_complete(merged: &Dataset, config: &DatasetConfig) -> DatasetResult<()> {
    let missing = merged.missing_fields();
    if !missing.is_empty() {
        return Err(DatasetError::Incomplete(missing));
    }
    if merged.encoded_len() > config.max_dataset_len {
        return Err(DecodeError::TooLong {
            length: merged.encoded_len(),
            max: config.max_dataset_len,
        }
        .into());
    }
    Ok(())
}

/// Configuration changes, ignoring the version fields.
fn config_changed(merged: &Dataset, previous: Option<&Dataset>) -> bool {
    merged.changed_fields(previous).into_iter().any(|f| {
        !matches!(
            f,
            MeshcopTlv::ActiveTimestamp | MeshcopTlv::PendingTimestamp | MeshcopTlv::DelayTimer
        )
    })
}

/// Evaluate an Active-Set request against the leader's Active dataset.
pub fn evaluate_active_set(
    request: &TlvSet,
    current_active: Option<&Dataset>,
    config: &DatasetConfig,
) -> DatasetResult<AcceptedActive> {
    let received = request_timestamp(request, MeshcopTlv::ActiveTimestamp, "active")?;
    check_newer(
        "active",
        received,
        current_active.and_then(Dataset::active_timestamp),
    )?;

    let fields = dataset_fields(DatasetKind::Active, request)?;
    check_channel(&fields, config)?;
    check_fields(&fields, config)?;

    let merged = merge_over(DatasetKind::Active, current_active, &fields);
    check_complete(&merged, config)?;

    let stable_changed = config_changed(&merged, current_active);
    debug!(%received, stable_changed, "active set accepted");
    Ok(AcceptedActive {
        dataset: merged,
        stable_changed,
    })
}

/// Evaluate a Pending-Set request. The Pending dataset is built over the
/// current Active dataset so that it is complete once committed.
pub fn evaluate_pending_set(
    request: &TlvSet,
    current_active: Option<&Dataset>,
    current_pending: Option<&Dataset>,
    config: &DatasetConfig,
) -> DatasetResult<AcceptedPending> {
    let pending_ts = request_timestamp(request, MeshcopTlv::PendingTimestamp, "pending")?;
    let active_ts = request_timestamp(request, MeshcopTlv::ActiveTimestamp, "active")?;

    let fields = dataset_fields(DatasetKind::Pending, request)?;
    let current_key = current_active.and_then(Dataset::network_key);
    let changes_network_key = fields
        .network_key()
        .is_some_and(|key| Some(key) != current_key);

    check_newer(
        "pending",
        pending_ts,
        current_pending.and_then(Dataset::pending_timestamp),
    )?;
    if !changes_network_key {
        check_newer(
            "active",
            active_ts,
            current_active.and_then(Dataset::active_timestamp),
        )?;
    }

    check_channel(&fields, config)?;
    check_fields(&fields, config)?;

    let mut merged = merge_over(DatasetKind::Pending, current_active, &fields);
    check_complete(&merged, config)?;

    let requested = merged.delay_timer().unwrap_or_default();
    let floor = config.min_key_change_delay();
    let clamped = changes_network_key && requested < floor;
    let delay = if clamped { floor } else { requested };
    if clamped {
        merged.set_delay_timer(delay);
    }

    debug!(
        %pending_ts,
        %active_ts,
        changes_network_key,
        ?delay,
        clamped,
        "pending set accepted"
    );
    Ok(AcceptedPending {
        dataset: merged,
        delay,
        changes_network_key,
        clamped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Channel, MeshLocalPrefix, NetworkKey},
        tlv::Tlv,
    };

    fn active(seconds: u64) -> Dataset {
        let mut rng = rand::rng();
        let mut ds = Dataset::generate_network(&mut rng, Channel::new(11), "net").unwrap();
        ds.set_active_timestamp(Timestamp::from_seconds(seconds));
        ds
    }

    fn pending_request(pending: u64, active: u64, delay_secs: u64) -> Dataset {
        let mut req = Dataset::new(DatasetKind::Pending);
        req.set_pending_timestamp(Timestamp::from_seconds(pending));
        req.set_active_timestamp(Timestamp::from_seconds(active));
        req.set_delay_timer(Duration::from_secs(delay_secs));
        req
    }

    #[test]
    fn test_active_set_requires_timestamp() {
        let current = active(10);
        let mut req = TlvSet::new();
        req.insert(Tlv::new(MeshcopTlv::PanId.code(), vec![0, 1]).unwrap());
        let err = evaluate_active_set(&req, Some(&current), &DatasetConfig::default()).unwrap_err();
        assert!(matches!(err, DatasetError::MissingTimestamp("active")));
    }

    #[test]
    fn test_active_set_rejects_equal_or_older() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(10));
        let err = evaluate_active_set(req.tlvs(), Some(&current), &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, DatasetError::StaleTimestamp { which: "active", .. }));
    }

    #[test]
    fn test_active_set_merges_over_current() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(15));
        req.set_network_name("renamed").unwrap();
        // session id must not end up in the dataset
        let mut tlvs = req.tlvs().clone();
        tlvs.insert(Tlv::new(MeshcopTlv::CommissionerSessionId.code(), vec![0, 1]).unwrap());

        let accepted =
            evaluate_active_set(&tlvs, Some(&current), &DatasetConfig::default()).unwrap();
        assert_eq!(accepted.dataset.network_name(), Some("renamed"));
        assert_eq!(accepted.dataset.pan_id(), current.pan_id());
        assert!(!accepted
            .dataset
            .contains(MeshcopTlv::CommissionerSessionId));
        assert!(accepted.stable_changed);
    }

    #[test]
    fn test_active_set_only_unknown_tlv_keeps_stable_version() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(11));
        req.insert(Tlv::new(0xc4, vec![1, 2]).unwrap()).unwrap();
        let accepted =
            evaluate_active_set(req.tlvs(), Some(&current), &DatasetConfig::default()).unwrap();
        assert!(!accepted.stable_changed);
        assert!(accepted.dataset.tlvs().contains(0xc4));
    }

    #[test]
    fn test_unsupported_channel() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(11));
        req.set_channel(Channel::new(63));
        let err = evaluate_active_set(req.tlvs(), Some(&current), &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::UnsupportedChannel {
                page: 0,
                channel: 63
            }
        ));

        req.set_channel(Channel {
            page: 2,
            number: 11,
        });
        assert!(matches!(
            evaluate_active_set(req.tlvs(), Some(&current), &DatasetConfig::default()),
            Err(DatasetError::UnsupportedChannel { page: 2, .. })
        ));
    }

    #[test]
    fn test_first_active_set_must_be_complete() {
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(1));
        req.set_channel(Channel::new(12));
        let err = evaluate_active_set(req.tlvs(), None, &DatasetConfig::default()).unwrap_err();
        match err {
            DatasetError::Incomplete(missing) => {
                assert!(missing.contains(&"network key"));
                assert!(!missing.contains(&"channel"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pending_set_requires_both_timestamps() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Pending);
        req.set_pending_timestamp(Timestamp::from_seconds(1));
        let err = evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, DatasetError::MissingTimestamp("active")));
    }

    #[test]
    fn test_pending_rollback_without_key_change_rejected() {
        let current = active(20_000);
        let req = pending_request(10, 20, 300);
        let err = evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, DatasetError::StaleTimestamp { which: "active", .. }));
    }

    #[test]
    fn test_pending_rollback_with_key_change_accepted() {
        let current = active(20_000);
        let mut req = pending_request(10, 20, 300);
        req.set_network_key(NetworkKey([0x11; 16]));
        let accepted =
            evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
                .unwrap();
        assert!(accepted.changes_network_key);
        assert_eq!(
            accepted.dataset.active_timestamp(),
            Some(Timestamp::from_seconds(20))
        );
        assert_eq!(accepted.delay, Duration::from_secs(300));
        assert!(!accepted.clamped);
    }

    #[test]
    fn test_same_key_is_not_a_key_change() {
        let current = active(20_000);
        let mut req = pending_request(10, 20, 300);
        req.set_network_key(current.network_key().unwrap());
        assert!(evaluate_pending_set(
            req.tlvs(),
            Some(&current),
            None,
            &DatasetConfig::default()
        )
        .is_err());
    }

    #[test]
    fn test_key_change_delay_clamped_up_not_down() {
        let current = active(10);
        let config = DatasetConfig::default();

        let mut short = pending_request(30, 210, 60);
        short.set_network_key(NetworkKey([0x22; 16]));
        let accepted = evaluate_pending_set(short.tlvs(), Some(&current), None, &config).unwrap();
        assert!(accepted.clamped);
        assert_eq!(accepted.delay, Duration::from_secs(300));
        assert_eq!(accepted.dataset.delay_timer(), Some(Duration::from_secs(300)));

        let mut long = pending_request(30, 210, 500);
        long.set_network_key(NetworkKey([0x22; 16]));
        let accepted = evaluate_pending_set(long.tlvs(), Some(&current), None, &config).unwrap();
        assert!(!accepted.clamped);
        assert_eq!(accepted.delay, Duration::from_secs(500));
    }

    #[test]
    fn test_short_delay_without_key_change_is_kept() {
        let current = active(10);
        let mut req = pending_request(30, 210, 60);
        req.set_mesh_local_prefix(MeshLocalPrefix([0xfd, 0, 0xd, 0xb8, 0, 0, 0, 0]));
        let accepted =
            evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
                .unwrap();
        assert_eq!(accepted.delay, Duration::from_secs(60));
        assert!(accepted.dataset.is_complete());
    }

    #[test]
    fn test_pending_timestamp_must_advance() {
        let current = active(10);
        let existing = {
            let mut p = current.clone().with_kind(DatasetKind::Pending);
            p.set_pending_timestamp(Timestamp::from_seconds(30));
            p.set_delay_timer(Duration::from_secs(100));
            p
        };
        let req = pending_request(30, 70, 100);
        let err = evaluate_pending_set(
            req.tlvs(),
            Some(&current),
            Some(&existing),
            &DatasetConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::StaleTimestamp { which: "pending", .. }));
    }

    #[test]
    fn test_delay_over_maximum_is_invalid() {
        let current = active(10);
        let req = pending_request(1, 70, 73 * 3600);
        let err = evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidField {
                field: "delay timer",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_delay_is_incomplete() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Pending);
        req.set_pending_timestamp(Timestamp::from_seconds(1));
        req.set_active_timestamp(Timestamp::from_seconds(70));
        let err = evaluate_pending_set(req.tlvs(), Some(&current), None, &DatasetConfig::default())
            .unwrap_err();
        assert!(matches!(err, DatasetError::Incomplete(m) if m == vec!["delay timer"]));
    }

    #[test]
    fn test_short_rotation_time_is_invalid() {
        let current = active(10);
        let mut req = Dataset::new(DatasetKind::Active);
        req.set_active_timestamp(Timestamp::from_seconds(11));
        req.set_security_policy(SecurityPolicy {
            rotation_time_hours: 1,
            ..SecurityPolicy::default()
        });
        assert!(matches!(
            evaluate_active_set(req.tlvs(), Some(&current), &DatasetConfig::default()),
            Err(DatasetError::InvalidField {
                field: "security policy",
                ..
            })
        ));
    }
}
