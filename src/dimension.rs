// Dimension Merge Engine - SCD1 / SCD2 with a policy flag
// One engine maintains slowly changing entities under either policy:
// overwrite keeps a single current record per natural key, versioned keeps
// the full interval history. Close-then-insert for a changed key executes
// inside one warehouse transaction so no reader ever observes a natural key
// with zero current versions.

use crate::db::{self, Warehouse};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// No history kept: a changed snapshot replaces the single record
    Overwrite,
    /// SCD2: close the current version and open a new one
    Versioned,
}

// ============================================================================
// SNAPSHOT / VERSION
// ============================================================================

/// Incoming attribute snapshot for one natural key.
/// Attributes live in an ordered map so change detection and surrogate-key
/// hashing are independent of field insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionSnapshot {
    pub natural_key: String,
    pub attributes: BTreeMap<String, String>,
    pub effective_at: DateTime<Utc>,
}

impl DimensionSnapshot {
    pub fn new(natural_key: &str, effective_at: DateTime<Utc>) -> Self {
        DimensionSnapshot {
            natural_key: natural_key.to_string(),
            attributes: BTreeMap::new(),
            effective_at,
        }
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }
}

/// One stored version of a dimension entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionVersion {
    pub surrogate_key: i64,
    pub natural_key: String,
    pub attributes: BTreeMap<String, String>,
    pub valid_from: DateTime<Utc>,
    /// None while this is the open (current) interval
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl DimensionVersion {
    /// Interval membership: inclusive lower bound, exclusive upper bound,
    /// open upper bound means still current
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |until| until > at)
    }
}

// ============================================================================
// SURROGATE KEYS
// ============================================================================

/// Deterministic surrogate key from (dimension, natural_key, effective time).
/// Reproducible across re-runs; always non-negative, so it never collides
/// with the -1 unresolved-reference sentinel.
pub fn surrogate_key_for(dimension: &str, natural_key: &str, effective_at: DateTime<Utc>) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(dimension.as_bytes());
    hasher.update(b"|");
    hasher.update(natural_key.as_bytes());
    hasher.update(b"|");
    hasher.update(db::format_ts(effective_at).as_bytes());

    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes) & i64::MAX
}

// ============================================================================
// CHANGE CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

/// Compare a snapshot against the current version for its key
pub fn classify_change(
    current: Option<&DimensionVersion>,
    snapshot: &DimensionSnapshot,
) -> ChangeKind {
    match current {
        None => ChangeKind::New,
        Some(version) if version.attributes == snapshot.attributes => ChangeKind::Unchanged,
        Some(_) => ChangeKind::Changed,
    }
}

// ============================================================================
// MERGE REPORT
// ============================================================================

/// Out-of-order snapshot that was skipped instead of producing a
/// negative-length interval
#[derive(Debug, Clone, Serialize)]
pub struct TemporalConflict {
    pub natural_key: String,
    pub effective_at: DateTime<Utc>,
    pub open_valid_from: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub dimension: String,
    pub inserted: usize,
    pub closed: usize,
    pub unchanged: usize,
    pub conflicts: Vec<TemporalConflict>,
}

impl MergeReport {
    pub fn total(&self) -> usize {
        self.inserted + self.unchanged + self.conflicts.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Merge {}: {} inserted, {} closed, {} unchanged, {} temporal conflicts",
            self.dimension,
            self.inserted,
            self.closed,
            self.unchanged,
            self.conflicts.len()
        )
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct DimensionMergeEngine {
    dimension: String,
    policy: MergePolicy,
}

impl DimensionMergeEngine {
    pub fn new(dimension: &str, policy: MergePolicy) -> Self {
        DimensionMergeEngine {
            dimension: dimension.to_string(),
            policy,
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Merge a batch of snapshots into the warehouse. The whole batch runs
    /// inside one transaction: either every accepted change lands or none
    /// does, and close + insert for a key are never separated.
    ///
    /// Unchanged snapshots write nothing, so re-running a merge with the
    /// same input produces zero new versions. Out-of-order snapshots are
    /// reported as conflicts and the rest of the batch proceeds.
    pub fn merge(
        &self,
        warehouse: &mut Warehouse,
        snapshots: &[DimensionSnapshot],
    ) -> Result<MergeReport> {
        let mut report = MergeReport {
            dimension: self.dimension.clone(),
            inserted: 0,
            closed: 0,
            unchanged: 0,
            conflicts: Vec::new(),
        };

        let tx = warehouse.transaction()?;
        let mut current = db::load_current_versions(&tx, &self.dimension)?;

        for snapshot in snapshots {
            match current.get(&snapshot.natural_key).cloned() {
                None => {
                    let version = self.open_version(snapshot);
                    db::insert_version(&tx, &self.dimension, &version)?;
                    report.inserted += 1;
                    current.insert(snapshot.natural_key.clone(), version);
                }
                Some(open) => {
                    if open.attributes == snapshot.attributes {
                        report.unchanged += 1;
                        continue;
                    }

                    if snapshot.effective_at <= open.valid_from {
                        report.conflicts.push(TemporalConflict {
                            natural_key: snapshot.natural_key.clone(),
                            effective_at: snapshot.effective_at,
                            open_valid_from: open.valid_from,
                        });
                        continue;
                    }

                    match self.policy {
                        MergePolicy::Versioned => {
                            db::close_version(
                                &tx,
                                &self.dimension,
                                open.surrogate_key,
                                snapshot.effective_at,
                            )?;
                            report.closed += 1;
                        }
                        MergePolicy::Overwrite => {
                            db::delete_versions(&tx, &self.dimension, &snapshot.natural_key)?;
                        }
                    }

                    let version = self.open_version(snapshot);
                    db::insert_version(&tx, &self.dimension, &version)?;
                    report.inserted += 1;
                    current.insert(snapshot.natural_key.clone(), version);
                }
            }
        }

        tx.commit()?;
        Ok(report)
    }

    fn open_version(&self, snapshot: &DimensionSnapshot) -> DimensionVersion {
        DimensionVersion {
            surrogate_key: surrogate_key_for(
                &self.dimension,
                &snapshot.natural_key,
                snapshot.effective_at,
            ),
            natural_key: snapshot.natural_key.clone(),
            attributes: snapshot.attributes.clone(),
            valid_from: snapshot.effective_at,
            valid_to: None,
            is_current: true,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn customer_snapshot(key: &str, loyalty: &str, effective: DateTime<Utc>) -> DimensionSnapshot {
        let mut snapshot = DimensionSnapshot::new(key, effective);
        snapshot.set_attribute("loyalty_status", loyalty);
        snapshot.set_attribute("city", "Taipei");
        snapshot
    }

    #[test]
    fn test_classify_change() {
        let snapshot = customer_snapshot("C1", "Silver", t(1));
        assert_eq!(classify_change(None, &snapshot), ChangeKind::New);

        let version = DimensionVersion {
            surrogate_key: 7,
            natural_key: "C1".to_string(),
            attributes: snapshot.attributes.clone(),
            valid_from: t(1),
            valid_to: None,
            is_current: true,
        };
        assert_eq!(
            classify_change(Some(&version), &snapshot),
            ChangeKind::Unchanged
        );

        let changed = customer_snapshot("C1", "Gold", t(2));
        assert_eq!(
            classify_change(Some(&version), &changed),
            ChangeKind::Changed
        );
    }

    #[test]
    fn test_surrogate_keys_deterministic_and_distinct() {
        let a = surrogate_key_for("customer", "C1001", t(1));
        let b = surrogate_key_for("customer", "C1001", t(1));
        let c = surrogate_key_for("customer", "C1001", t(2));
        let d = surrogate_key_for("product", "C1001", t(1));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a >= 0 && c >= 0 && d >= 0);
    }

    #[test]
    fn test_scd2_history_silver_to_gold() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);

        // C1001 created at T1 with Silver, updated at T2 to Gold
        let first = engine
            .merge(&mut wh, &[customer_snapshot("C1001", "Silver", t(1))])
            .unwrap();
        assert_eq!(first.inserted, 1);

        let second = engine
            .merge(&mut wh, &[customer_snapshot("C1001", "Gold", t(2))])
            .unwrap();
        assert_eq!(second.inserted, 1);
        assert_eq!(second.closed, 1);

        let history = db::version_history(wh.connection(), "customer", "C1001").unwrap();
        assert_eq!(history.len(), 2);

        // [T1, T2) Silver, closed
        assert_eq!(history[0].valid_from, t(1));
        assert_eq!(history[0].valid_to, Some(t(2)));
        assert!(!history[0].is_current);
        assert_eq!(
            history[0].attributes.get("loyalty_status").map(String::as_str),
            Some("Silver")
        );

        // [T2, null) Gold, current
        assert_eq!(history[1].valid_from, t(2));
        assert_eq!(history[1].valid_to, None);
        assert!(history[1].is_current);
        assert_eq!(
            history[1].attributes.get("loyalty_status").map(String::as_str),
            Some("Gold")
        );
    }

    #[test]
    fn test_unchanged_snapshot_writes_nothing() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);

        let snapshot = customer_snapshot("C1", "Silver", t(1));
        engine.merge(&mut wh, &[snapshot.clone()]).unwrap();

        // Re-run with the same snapshot (even at a later effective time)
        let rerun = engine
            .merge(&mut wh, &[customer_snapshot("C1", "Silver", t(5))])
            .unwrap();

        assert_eq!(rerun.inserted, 0);
        assert_eq!(rerun.unchanged, 1);
        assert_eq!(
            db::version_history(wh.connection(), "customer", "C1")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_out_of_order_snapshot_reports_conflict() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);

        engine
            .merge(&mut wh, &[customer_snapshot("C1", "Silver", t(10))])
            .unwrap();

        // Late snapshot dated before the open interval, plus a healthy key;
        // the conflict must not block the rest of the batch
        let report = engine
            .merge(
                &mut wh,
                &[
                    customer_snapshot("C1", "Gold", t(3)),
                    customer_snapshot("C2", "Bronze", t(4)),
                ],
            )
            .unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].natural_key, "C1");
        assert_eq!(report.conflicts[0].open_valid_from, t(10));
        assert_eq!(report.inserted, 1);

        // C1 history untouched
        let history = db::version_history(wh.connection(), "customer", "C1").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
    }

    #[test]
    fn test_at_most_one_current_version_per_key() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);

        for (day, loyalty) in [(1, "Bronze"), (3, "Silver"), (7, "Gold"), (9, "Platinum")] {
            engine
                .merge(&mut wh, &[customer_snapshot("C1", loyalty, t(day))])
                .unwrap();
        }

        let history = db::version_history(wh.connection(), "customer", "C1").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);

        // Closed intervals are contiguous and never overlap
        for pair in history.windows(2) {
            assert_eq!(pair[0].valid_to, Some(pair[1].valid_from));
        }
        assert_eq!(history.last().unwrap().valid_to, None);
    }

    #[test]
    fn test_overwrite_policy_keeps_single_record() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let engine = DimensionMergeEngine::new("product", MergePolicy::Overwrite);

        let mut v1 = DimensionSnapshot::new("P100", t(1));
        v1.set_attribute("product_name", "Kettle");
        v1.set_attribute("brand", "Acme");
        engine.merge(&mut wh, &[v1]).unwrap();

        let mut v2 = DimensionSnapshot::new("P100", t(4));
        v2.set_attribute("product_name", "Kettle 2L");
        v2.set_attribute("brand", "Acme");
        let report = engine.merge(&mut wh, &[v2]).unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.closed, 0);

        // No interval bookkeeping: exactly one row, the latest state
        let history = db::version_history(wh.connection(), "product", "P100").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
        assert_eq!(history[0].valid_to, None);
        assert_eq!(
            history[0].attributes.get("product_name").map(String::as_str),
            Some("Kettle 2L")
        );
    }

    #[test]
    fn test_interval_contains() {
        let version = DimensionVersion {
            surrogate_key: 1,
            natural_key: "C1".to_string(),
            attributes: BTreeMap::new(),
            valid_from: t(5),
            valid_to: Some(t(10)),
            is_current: false,
        };

        assert!(version.contains(t(5))); // inclusive lower bound
        assert!(version.contains(t(7)));
        assert!(!version.contains(t(10))); // exclusive upper bound
        assert!(!version.contains(t(4)));
    }
}
