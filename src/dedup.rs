// Deduplicator - Late-arrival resolution for the fact stream
// Sources redeliver after transient failures and the same sale can land from
// both the POS and e-commerce feeds, so transaction identities repeat in
// staging. Exactly one candidate survives per identity: the most recently
// ingested one, with arrival order as the deterministic tie-breaker.

use crate::classifier::CleanRecord;
use std::collections::HashMap;

// ============================================================================
// DEDUP OUTCOME
// ============================================================================

#[derive(Debug)]
pub struct DedupOutcome {
    /// Exactly one record per distinct transaction identity,
    /// ordered by transaction_id for reproducible downstream runs
    pub survivors: Vec<CleanRecord>,
    pub duplicates_dropped: usize,
}

// ============================================================================
// DEDUPLICATOR
// ============================================================================

pub struct Deduplicator;

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator
    }

    /// Resolve duplicates: max ingested_at wins, ties go to the later
    /// arrival. The survivor set depends only on the input set, not on
    /// input ordering or batch boundaries, so re-runs are idempotent.
    pub fn deduplicate(&self, records: Vec<CleanRecord>) -> DedupOutcome {
        let total = records.len();

        // transaction_id -> (arrival index, record held so far)
        let mut best: HashMap<String, (usize, CleanRecord)> = HashMap::new();

        for (index, record) in records.into_iter().enumerate() {
            match best.get(&record.transaction_id) {
                Some((held_index, held)) => {
                    let newer = record.ingested_at > held.ingested_at
                        || (record.ingested_at == held.ingested_at && index > *held_index);
                    if newer {
                        best.insert(record.transaction_id.clone(), (index, record));
                    }
                }
                None => {
                    best.insert(record.transaction_id.clone(), (index, record));
                }
            }
        }

        let mut survivors: Vec<CleanRecord> =
            best.into_values().map(|(_, record)| record).collect();
        survivors.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        DedupOutcome {
            duplicates_dropped: total - survivors.len(),
            survivors,
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
