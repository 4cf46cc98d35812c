// Fact Assembler - Point-in-time dimension resolution
// Each deduplicated, cleansed transaction resolves to the customer version
// whose validity interval contains the transaction's business timestamp.
// Records that predate any version keep an explicit sentinel reference;
// nothing is ever dropped.

use crate::classifier::CleanRecord;
use crate::db::{self, Warehouse};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Unresolved-reference sentinel for facts whose customer version cannot be
/// located at the business timestamp
pub const UNRESOLVED_CUSTOMER_SK: i64 = -1;

// ============================================================================
// FACT RECORD
// ============================================================================

/// Immutable fact row. Corrections are new records, never in-place updates.
#[derive(Debug, Clone, Serialize)]
pub struct FactRecord {
    pub transaction_id: String,
    pub customer_sk: i64,
    pub product_id: String,
    pub event_time: DateTime<Utc>,
    pub quantity: i64,
    pub unit_price: f64,
    pub amount: f64,
    pub source_system: String,
    pub created_at: DateTime<Utc>,
}

impl FactRecord {
    pub fn is_resolved(&self) -> bool {
        self.customer_sk != UNRESOLVED_CUSTOMER_SK
    }
}

// ============================================================================
// ASSEMBLY REPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub total: usize,
    pub inserted: usize,
    /// Identities already present from an earlier run (idempotent skip)
    pub already_present: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

impl AssemblyReport {
    pub fn summary(&self) -> String {
        format!(
            "Assembly: {} records, {} inserted, {} already present, {} unresolved references",
            self.total, self.inserted, self.already_present, self.unresolved
        )
    }
}

// ============================================================================
// FACT ASSEMBLER
// ============================================================================

pub struct FactAssembler {
    customer_dimension: String,
}

impl FactAssembler {
    pub fn new() -> Self {
        FactAssembler {
            customer_dimension: "customer".to_string(),
        }
    }

    pub fn with_dimension(customer_dimension: &str) -> Self {
        FactAssembler {
            customer_dimension: customer_dimension.to_string(),
        }
    }

    /// Assemble fact rows for a deduplicated batch. Runs in one warehouse
    /// transaction; an identity already present in the fact table is skipped
    /// rather than duplicated, so re-running over already-assembled input
    /// changes nothing.
    pub fn assemble(
        &self,
        warehouse: &mut Warehouse,
        records: &[CleanRecord],
        created_at: DateTime<Utc>,
    ) -> Result<AssemblyReport> {
        let mut report = AssemblyReport {
            total: records.len(),
            inserted: 0,
            already_present: 0,
            resolved: 0,
            unresolved: 0,
        };

        let tx = warehouse.transaction()?;

        for record in records {
            let customer_sk = db::resolve_surrogate_at(
                &tx,
                &self.customer_dimension,
                &record.customer_id,
                record.event_time,
            )?
            .unwrap_or(UNRESOLVED_CUSTOMER_SK);

            if customer_sk == UNRESOLVED_CUSTOMER_SK {
                report.unresolved += 1;
            } else {
                report.resolved += 1;
            }

            let fact = FactRecord {
                transaction_id: record.transaction_id.clone(),
                customer_sk,
                product_id: record.product_id.clone(),
                event_time: record.event_time,
                quantity: record.quantity,
                unit_price: record.unit_price,
                amount: record.amount,
                source_system: record.source_system.clone(),
                created_at,
            };

            if db::insert_fact(&tx, &fact)? {
                report.inserted += 1;
            } else {
                report.already_present += 1;
            }
        }

        tx.commit()?;
        Ok(report)
    }
}

impl Default for FactAssembler {
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
    use crate::dimension::{DimensionMergeEngine, DimensionSnapshot, MergePolicy};
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap()
    }

    fn clean_record(transaction_id: &str, customer_id: &str, event_day: u32) -> CleanRecord {
        CleanRecord {
            transaction_id: transaction_id.to_string(),
            store_id: "S001".to_string(),
            customer_id: customer_id.to_string(),
            product_id: "P100".to_string(),
            event_type: "SALE".to_string(),
            quantity: 2,
            unit_price: 7.50,
            amount: 15.0,
            currency: "USD".to_string(),
            event_time: t(event_day),
            source_system: "pos".to_string(),
            ingested_at: t(event_day),
        }
    }

    fn merge_customer(wh: &mut Warehouse, key: &str, loyalty: &str, day: u32) {
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);
        let mut snapshot = DimensionSnapshot::new(key, t(day));
        snapshot.set_attribute("loyalty_status", loyalty);
        engine.merge(wh, &[snapshot]).unwrap();
    }

    #[test]
    fn test_resolves_version_containing_business_timestamp() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        merge_customer(&mut wh, "C1", "Silver", 1);
        merge_customer(&mut wh, "C1", "Gold", 10);

        let assembler = FactAssembler::new();
        // Business timestamp on day 5 falls in the closed Silver interval
        let report = assembler
            .assemble(&mut wh, &[clean_record("TX1", "C1", 5)], t(11))
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.resolved, 1);

        let fact = db::get_fact(wh.connection(), "TX1").unwrap().unwrap();
        let expected = crate::dimension::surrogate_key_for("customer", "C1", t(1));
        assert_eq!(fact.customer_sk, expected);
        assert!(fact.is_resolved());
    }

    #[test]
    fn test_open_interval_resolves_current_version() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        merge_customer(&mut wh, "C1", "Silver", 1);
        merge_customer(&mut wh, "C1", "Gold", 10);

        let assembler = FactAssembler::new();
        let report = assembler
            .assemble(&mut wh, &[clean_record("TX2", "C1", 20)], t(21))
            .unwrap();
        assert_eq!(report.resolved, 1);

        let fact = db::get_fact(wh.connection(), "TX2").unwrap().unwrap();
        let expected = crate::dimension::surrogate_key_for("customer", "C1", t(10));
        assert_eq!(fact.customer_sk, expected);
    }

    #[test]
    fn test_pre_history_fact_gets_sentinel_not_dropped() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        merge_customer(&mut wh, "C1", "Silver", 10);

        let assembler = FactAssembler::new();
        // Business timestamp precedes any version for this customer
        let report = assembler
            .assemble(&mut wh, &[clean_record("TX3", "C1", 2)], t(11))
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.unresolved, 1);

        let fact = db::get_fact(wh.connection(), "TX3").unwrap().unwrap();
        assert_eq!(fact.customer_sk, UNRESOLVED_CUSTOMER_SK);
        assert!(!fact.is_resolved());
    }

    #[test]
    fn test_unknown_customer_gets_sentinel() {
        let mut wh = Warehouse::open_in_memory().unwrap();

        let assembler = FactAssembler::new();
        let report = assembler
            .assemble(&mut wh, &[clean_record("TX4", "C404", 2)], t(3))
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.unresolved, 1);
    }

    #[test]
    fn test_rerun_produces_no_duplicate_rows() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        merge_customer(&mut wh, "C1", "Silver", 1);

        let batch = vec![clean_record("TX1", "C1", 5), clean_record("TX2", "C1", 6)];
        let assembler = FactAssembler::new();

        let first = assembler.assemble(&mut wh, &batch, t(7)).unwrap();
        assert_eq!(first.inserted, 2);

        let second = assembler.assemble(&mut wh, &batch, t(8)).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_present, 2);
        assert_eq!(db::fact_count(wh.connection()).unwrap(), 2);
    }
}
