// Audit Recorder - Append-only run outcomes
// One immutable entry per run of each pipeline stage. Prior entries are
// never mutated; pipeline-health reporting reads this log.

use crate::db::{self, Warehouse};
use anyhow::Result;
use chrono::{DateTime, Utc};

// ============================================================================
// CATEGORIES / STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCategory {
    Classification,
    Deduplication,
    DimensionMerge,
    FactAssembly,
    Pipeline,
}

impl RunCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunCategory::Classification => "CLASSIFICATION",
            RunCategory::Deduplication => "DEDUPLICATION",
            RunCategory::DimensionMerge => "DIMENSION_MERGE",
            RunCategory::FactAssembly => "FACT_ASSEMBLY",
            RunCategory::Pipeline => "PIPELINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLASSIFICATION" => Some(RunCategory::Classification),
            "DEDUPLICATION" => Some(RunCategory::Deduplication),
            "DIMENSION_MERGE" => Some(RunCategory::DimensionMerge),
            "FACT_ASSEMBLY" => Some(RunCategory::FactAssembly),
            "PIPELINE" => Some(RunCategory::Pipeline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// AUDIT ENTRY
// ============================================================================

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    pub category: RunCategory,
    pub status: RunStatus,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(
        run_id: &str,
        category: RunCategory,
        status: RunStatus,
        total: i64,
        passed: i64,
        failed: i64,
        detail: &str,
    ) -> Self {
        AuditEntry {
            run_id: run_id.to_string(),
            recorded_at: Utc::now(),
            category,
            status,
            total,
            passed,
            failed,
            detail: detail.to_string(),
        }
    }

    pub fn failure(run_id: &str, category: RunCategory, detail: &str) -> Self {
        Self::new(run_id, category, RunStatus::Failed, 0, 0, 0, detail)
    }
}

// ============================================================================
// AUDIT RECORDER
// ============================================================================

pub struct AuditRecorder;

impl AuditRecorder {
    pub fn new() -> Self {
        AuditRecorder
    }

    /// Append one entry; existing entries are never touched
    pub fn record(&self, warehouse: &Warehouse, entry: &AuditEntry) -> Result<()> {
        db::insert_audit_entry(warehouse.connection(), entry)
    }

    pub fn entries_for_run(&self, warehouse: &Warehouse, run_id: &str) -> Result<Vec<AuditEntry>> {
        db::audit_entries_for_run(warehouse.connection(), run_id)
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_status_round_trip() {
        for category in [
            RunCategory::Classification,
            RunCategory::Deduplication,
            RunCategory::DimensionMerge,
            RunCategory::FactAssembly,
            RunCategory::Pipeline,
        ] {
            assert_eq!(RunCategory::parse(category.as_str()), Some(category));
        }

        assert_eq!(RunStatus::parse("SUCCESS"), Some(RunStatus::Success));
        assert_eq!(RunStatus::parse("FAILED"), Some(RunStatus::Failed));
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_entries_append_in_order() {
        let wh = Warehouse::open_in_memory().unwrap();
        let recorder = AuditRecorder::new();

        let classification = AuditEntry::new(
            "run-42",
            RunCategory::Classification,
            RunStatus::Success,
            15,
            13,
            2,
            "2 quarantined",
        );
        let assembly = AuditEntry::new(
            "run-42",
            RunCategory::FactAssembly,
            RunStatus::Success,
            13,
            13,
            0,
            "1 unresolved reference",
        );

        recorder.record(&wh, &classification).unwrap();
        recorder.record(&wh, &assembly).unwrap();

        let entries = recorder.entries_for_run(&wh, "run-42").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].category, RunCategory::Classification);
        assert_eq!(entries[0].total, 15);
        assert_eq!(entries[0].passed, 13);
        assert_eq!(entries[1].category, RunCategory::FactAssembly);
    }

    #[test]
    fn test_failed_run_leaves_failed_entry_and_no_new_facts() {
        use crate::db;
        use crate::facts::FactRecord;
        use chrono::TimeZone;
        use std::path::Path;

        let wh = Warehouse::open_in_memory().unwrap();
        let recorder = AuditRecorder::new();

        // A fact committed by an earlier, successful run
        let committed = FactRecord {
            transaction_id: "TX0".to_string(),
            customer_sk: 42,
            product_id: "P1".to_string(),
            event_time: Utc.with_ymd_and_hms(2025, 1, 5, 10, 0, 0).unwrap(),
            quantity: 1,
            unit_price: 5.0,
            amount: 5.0,
            source_system: "pos".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 5, 10, 1, 0).unwrap(),
        };
        assert!(db::insert_fact(wh.connection(), &committed).unwrap());

        // The next run dies in its first stage: the CRM extract is unreadable.
        // The runner records the failure and never reaches fact assembly.
        let result = db::load_customer_snapshots(Path::new("/nonexistent/crm.csv"));
        let error = result.err().unwrap();

        let failure = AuditEntry::failure("run-9", RunCategory::Pipeline, &format!("{:#}", error));
        recorder.record(&wh, &failure).unwrap();

        let entries = recorder.entries_for_run(&wh, "run-9").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, RunCategory::Pipeline);
        assert_eq!(entries[0].status, RunStatus::Failed);
        assert!(entries[0].detail.contains("crm.csv"));

        // Only the earlier run's fact remains
        assert_eq!(db::fact_count(wh.connection()).unwrap(), 1);
    }

    #[test]
    fn test_prior_entries_survive_later_appends() {
        let wh = Warehouse::open_in_memory().unwrap();
        let recorder = AuditRecorder::new();

        let first = AuditEntry::new(
            "run-1",
            RunCategory::Classification,
            RunStatus::Success,
            10,
            10,
            0,
            "clean batch",
        );
        recorder.record(&wh, &first).unwrap();

        let failure = AuditEntry::failure("run-1", RunCategory::Pipeline, "compute layer down");
        recorder.record(&wh, &failure).unwrap();

        let entries = recorder.entries_for_run(&wh, "run-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, RunStatus::Success);
        assert_eq!(entries[0].detail, "clean batch");
        assert_eq!(entries[1].status, RunStatus::Failed);
    }
}
