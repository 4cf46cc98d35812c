use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::path::PathBuf;

use gigmart_warehouse::{
    db, AuditEntry, AuditRecorder, Deduplicator, DimensionMergeEngine, FactAssembler,
    MergePolicy, QualityClassifier, RunCategory, RunStatus, StagingRecord, Warehouse,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("run") => run_command(&args[2..]),
        Some("summary") => summary_command(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("GigMart Warehouse v{}", gigmart_warehouse::VERSION);
    println!();
    println!("Usage:");
    println!("  gigmart-warehouse run <warehouse.db> [options]");
    println!("      --run-id <id>          run identifier from the scheduler");
    println!("      --pos <file.jsonl>     POS staging batch (repeatable)");
    println!("      --ecommerce <file.jsonl>  e-commerce staging batch (repeatable)");
    println!("      --pos-csv <file.csv>   POS staging batch as CSV (repeatable)");
    println!("      --ecommerce-csv <file.csv>  e-commerce staging batch as CSV (repeatable)");
    println!("      --customers <crm.csv>  CRM customer snapshots");
    println!("      --products <erp.csv>   ERP product snapshots");
    println!("      --since <rfc3339>      effective-time window lower bound");
    println!("      --until <rfc3339>      effective-time window upper bound");
    println!("  gigmart-warehouse summary <warehouse.db>");
}

// ============================================================================
// RUN OPTIONS (the scheduling trigger: run id + effective-time window)
// ============================================================================

struct RunOptions {
    warehouse_path: PathBuf,
    run_id: String,
    pos_files: Vec<PathBuf>,
    ecommerce_files: Vec<PathBuf>,
    pos_csv_files: Vec<PathBuf>,
    ecommerce_csv_files: Vec<PathBuf>,
    customers_file: Option<PathBuf>,
    products_file: Option<PathBuf>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

fn parse_run_options(args: &[String]) -> Result<RunOptions> {
    let mut iter = args.iter();

    let warehouse_path = match iter.next() {
        Some(path) => PathBuf::from(path),
        None => bail!("Missing warehouse path. See: gigmart-warehouse"),
    };

    let mut options = RunOptions {
        warehouse_path,
        run_id: String::new(),
        pos_files: Vec::new(),
        ecommerce_files: Vec::new(),
        pos_csv_files: Vec::new(),
        ecommerce_csv_files: Vec::new(),
        customers_file: None,
        products_file: None,
        since: None,
        until: None,
    };

    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .with_context(|| format!("Flag {} requires a value", flag))?;

        match flag.as_str() {
            "--run-id" => options.run_id = value.clone(),
            "--pos" => options.pos_files.push(PathBuf::from(value)),
            "--ecommerce" => options.ecommerce_files.push(PathBuf::from(value)),
            "--pos-csv" => options.pos_csv_files.push(PathBuf::from(value)),
            "--ecommerce-csv" => options.ecommerce_csv_files.push(PathBuf::from(value)),
            "--customers" => options.customers_file = Some(PathBuf::from(value)),
            "--products" => options.products_file = Some(PathBuf::from(value)),
            "--since" => options.since = Some(parse_window_bound(value)?),
            "--until" => options.until = Some(parse_window_bound(value)?),
            other => bail!("Unknown flag: {}", other),
        }
    }

    if options.run_id.is_empty() {
        options.run_id = uuid::Uuid::new_v4().to_string();
    }

    Ok(options)
}

fn parse_window_bound(raw: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid window bound: {}", raw))?;
    Ok(dt.with_timezone(&Utc))
}

fn within_window(options: &RunOptions, record: &StagingRecord) -> bool {
    if let Some(since) = options.since {
        if record.ingested_at < since {
            return false;
        }
    }
    if let Some(until) = options.until {
        if record.ingested_at >= until {
            return false;
        }
    }
    true
}

// ============================================================================
// RUN COMMAND
// ============================================================================

fn run_command(args: &[String]) -> Result<()> {
    let options = parse_run_options(args)?;

    println!("🏭 GigMart Warehouse - transformation run {}", options.run_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut warehouse = Warehouse::open(&options.warehouse_path)?;
    let recorder = AuditRecorder::new();

    match execute_run(&mut warehouse, &recorder, &options) {
        Ok(()) => {
            println!("\n✅ Run {} completed", options.run_id);
            Ok(())
        }
        Err(e) => {
            // Run-level failure: surface a failed status in the audit log and
            // escalate whole to the orchestrator, which owns retry policy
            let failure = AuditEntry::failure(
                &options.run_id,
                RunCategory::Pipeline,
                &format!("{:#}", e),
            );
            let _ = recorder.record(&warehouse, &failure);
            eprintln!("\n❌ Run {} failed: {:#}", options.run_id, e);
            Err(e)
        }
    }
}

fn execute_run(
    warehouse: &mut Warehouse,
    recorder: &AuditRecorder,
    options: &RunOptions,
) -> Result<()> {
    // 1. Dimension merges first, so facts can resolve against fresh state.
    //    Customers are historized (SCD2); products carry no history.
    if let Some(path) = &options.customers_file {
        println!("\n👤 Merging customer dimension...");
        let snapshots = db::load_customer_snapshots(path)?;
        let engine = DimensionMergeEngine::new("customer", MergePolicy::Versioned);
        let report = engine.merge(warehouse, &snapshots)?;
        println!("✓ {}", report.summary());

        recorder.record(
            warehouse,
            &AuditEntry::new(
                &options.run_id,
                RunCategory::DimensionMerge,
                RunStatus::Success,
                report.total() as i64,
                (report.inserted + report.unchanged) as i64,
                report.conflicts.len() as i64,
                &report.summary(),
            ),
        )?;
    }

    if let Some(path) = &options.products_file {
        println!("\n📦 Merging product dimension...");
        let snapshots = db::load_product_snapshots(path)?;
        let engine = DimensionMergeEngine::new("product", MergePolicy::Overwrite);
        let report = engine.merge(warehouse, &snapshots)?;
        println!("✓ {}", report.summary());

        recorder.record(
            warehouse,
            &AuditEntry::new(
                &options.run_id,
                RunCategory::DimensionMerge,
                RunStatus::Success,
                report.total() as i64,
                (report.inserted + report.unchanged) as i64,
                report.conflicts.len() as i64,
                &report.summary(),
            ),
        )?;
    }

    // 2. Land the staging batches inside the effective-time window
    println!("\n📂 Loading staging batches...");
    let mut staging = Vec::new();
    let mut malformed = 0;

    for path in &options.pos_files {
        let batch = db::load_staging_jsonl(path, "pos")?;
        malformed += batch.malformed;
        staging.extend(batch.records);
    }
    for path in &options.ecommerce_files {
        let batch = db::load_staging_jsonl(path, "ecommerce")?;
        malformed += batch.malformed;
        staging.extend(batch.records);
    }
    for path in &options.pos_csv_files {
        let batch = db::load_staging_csv(path, "pos")?;
        malformed += batch.malformed;
        staging.extend(batch.records);
    }
    for path in &options.ecommerce_csv_files {
        let batch = db::load_staging_csv(path, "ecommerce")?;
        malformed += batch.malformed;
        staging.extend(batch.records);
    }

    staging.retain(|record| within_window(options, record));
    println!(
        "✓ Loaded {} staging records ({} malformed lines skipped)",
        staging.len(),
        malformed
    );

    // 3. Classify into clean / quarantine
    println!("\n🔎 Classifying staging batch...");
    let classifier = QualityClassifier::new();
    let partition = classifier.classify(&staging, Utc::now());
    println!(
        "✓ {} clean, {} quarantined",
        partition.clean.len(),
        partition.quarantine.len()
    );

    {
        let tx = warehouse.transaction()?;
        db::insert_quarantine_records(&tx, &partition.quarantine)?;
        tx.commit()?;
    }

    recorder.record(
        warehouse,
        &AuditEntry::new(
            &options.run_id,
            RunCategory::Classification,
            RunStatus::Success,
            partition.total() as i64,
            partition.clean.len() as i64,
            partition.quarantine.len() as i64,
            &format!("{} malformed lines skipped by loader", malformed),
        ),
    )?;

    // 4. Resolve duplicates and late arrivals
    println!("\n🔁 Deduplicating...");
    let dedup = Deduplicator::new();
    let clean_total = partition.clean.len();
    let outcome = dedup.deduplicate(partition.clean);
    println!(
        "✓ {} survivors, {} duplicates dropped",
        outcome.survivors.len(),
        outcome.duplicates_dropped
    );

    recorder.record(
        warehouse,
        &AuditEntry::new(
            &options.run_id,
            RunCategory::Deduplication,
            RunStatus::Success,
            clean_total as i64,
            outcome.survivors.len() as i64,
            outcome.duplicates_dropped as i64,
            "latest ingestion wins",
        ),
    )?;

    // 5. Assemble facts with point-in-time dimension references
    println!("\n🧾 Assembling facts...");
    let assembler = FactAssembler::new();
    let report = assembler.assemble(warehouse, &outcome.survivors, Utc::now())?;
    println!("✓ {}", report.summary());

    recorder.record(
        warehouse,
        &AuditEntry::new(
            &options.run_id,
            RunCategory::FactAssembly,
            RunStatus::Success,
            report.total as i64,
            (report.inserted + report.already_present) as i64,
            0,
            &report.summary(),
        ),
    )?;

    // 6. Quarantine health snapshot
    print_quarantine_summary(warehouse)?;

    Ok(())
}

// ============================================================================
// SUMMARY COMMAND
// ============================================================================

fn summary_command(args: &[String]) -> Result<()> {
    let path = match args.first() {
        Some(path) => PathBuf::from(path),
        None => bail!("Missing warehouse path. See: gigmart-warehouse"),
    };

    let warehouse = Warehouse::open(&path)?;
    print_quarantine_summary(&warehouse)?;

    let facts = db::fact_count(warehouse.connection())?;
    println!("\n✓ Fact table contains {} transactions", facts);

    Ok(())
}

fn print_quarantine_summary(warehouse: &Warehouse) -> Result<()> {
    let stats = db::quarantine_summary(warehouse.connection())?;

    println!("\n📋 Quarantine by source and reason:");
    if stats.is_empty() {
        println!("   (empty)");
    }
    for stat in stats {
        println!(
            "   {:<12} {:<24} {}",
            stat.source_system, stat.rejection_reason, stat.record_count
        );
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_run_options_accepts_csv_and_jsonl_staging() {
        let options = parse_run_options(&args(&[
            "wh.db",
            "--pos",
            "pos.jsonl",
            "--pos-csv",
            "pos.csv",
            "--ecommerce-csv",
            "shop.csv",
            "--run-id",
            "run-7",
        ]))
        .unwrap();

        assert_eq!(options.run_id, "run-7");
        assert_eq!(options.pos_files, vec![PathBuf::from("pos.jsonl")]);
        assert_eq!(options.pos_csv_files, vec![PathBuf::from("pos.csv")]);
        assert_eq!(options.ecommerce_csv_files, vec![PathBuf::from("shop.csv")]);
        assert!(options.ecommerce_files.is_empty());
    }

    #[test]
    fn test_parse_run_options_rejects_unknown_flag() {
        assert!(parse_run_options(&args(&["wh.db", "--bogus", "x"])).is_err());
    }
}
