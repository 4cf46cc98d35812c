// GigMart Warehouse - Core Library
// Dimensional transformation engine: cleansing, deduplication, SCD merge,
// point-in-time fact assembly and run auditing over a shared warehouse.

pub mod db;
pub mod classifier;
pub mod dedup;
pub mod dimension;
pub mod facts;
pub mod audit;

// Re-export commonly used types
pub use db::{
    Warehouse, StagingRecord, StagingBatch, QuarantineStat,
    load_staging_csv, load_staging_jsonl,
    load_customer_snapshots, load_product_snapshots,
    quarantine_summary,
};
pub use classifier::{
    QualityClassifier, QualityRule, RejectionReason,
    CleanRecord, QuarantineRecord, Partition,
};
pub use dedup::{
    Deduplicator, DedupOutcome,
};
pub use dimension::{
    DimensionMergeEngine, MergePolicy, DimensionSnapshot, DimensionVersion,
    ChangeKind, MergeReport, TemporalConflict, surrogate_key_for,
};
pub use facts::{
    FactAssembler, FactRecord, AssemblyReport, UNRESOLVED_CUSTOMER_SK,
};
pub use audit::{
    AuditRecorder, AuditEntry, RunCategory, RunStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
