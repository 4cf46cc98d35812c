// Quality Classifier - Rules as Data
// Partitions each staging batch into clean and quarantine via an ordered
// rule list. The first failing rule, in list order, is the rejection reason;
// rule order is part of the contract because downstream consumers key on
// specific reason codes.

use crate::db::StagingRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// REJECTION REASONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    NullTransactionId,
    NullCustomerId,
    InvalidAmount,
    AmountSignMismatch,
    InvalidQuantity,
    MissingTimestamp,
    /// Catch-all: passed every named rule but still not convertible
    Unknown,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NullTransactionId => "NULL_TRANSACTION_ID",
            RejectionReason::NullCustomerId => "NULL_CUSTOMER_ID",
            RejectionReason::InvalidAmount => "INVALID_AMOUNT",
            RejectionReason::AmountSignMismatch => "AMOUNT_SIGN_MISMATCH",
            RejectionReason::InvalidQuantity => "INVALID_QUANTITY",
            RejectionReason::MissingTimestamp => "MISSING_TIMESTAMP",
            RejectionReason::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CLEAN / QUARANTINE RECORDS
// ============================================================================

/// Fully typed projection of a staging record that passed every rule
#[derive(Debug, Clone, Serialize)]
pub struct CleanRecord {
    pub transaction_id: String,
    pub store_id: String,
    pub customer_id: String,
    pub product_id: String,
    pub event_type: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub amount: f64,
    pub currency: String,
    pub event_time: DateTime<Utc>,
    pub source_system: String,
    pub ingested_at: DateTime<Utc>,
}

/// Rejected staging record, preserved untouched for investigation
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub record: StagingRecord,
    pub rejection_reason: RejectionReason,
    pub quarantined_at: DateTime<Utc>,
}

/// Classifier output: clean and quarantine together cover the whole batch
#[derive(Debug)]
pub struct Partition {
    pub clean: Vec<CleanRecord>,
    pub quarantine: Vec<QuarantineRecord>,
}

impl Partition {
    pub fn total(&self) -> usize {
        self.clean.len() + self.quarantine.len()
    }
}

// ============================================================================
// FIELD PARSERS
// ============================================================================

fn is_blank(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null")
}

/// Parse a raw amount string; tolerates a currency symbol and well-formed
/// thousands separators, rejects anything else non-numeric or non-finite
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_start_matches('$');

    let cleaned = if trimmed.contains(',') {
        strip_thousands_separators(trimmed)?
    } else {
        trimmed.to_string()
    };

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

// Commas count only as thousands separators: the leading group is one to
// three digits and every following group exactly three, all before the
// decimal point. "1,2,3" and "12,34" are malformed, not 123 and 1234.
fn strip_thousands_separators(s: &str) -> Option<String> {
    let (sign, unsigned) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };

    if frac_part.map_or(false, |f| f.contains(',')) {
        return None;
    }

    let mut groups = int_part.split(',');
    let first = groups.next()?;
    let all_digits = |g: &str| g.chars().all(|c| c.is_ascii_digit());
    if first.is_empty() || first.len() > 3 || !all_digits(first) {
        return None;
    }
    for group in groups {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
    }

    let mut cleaned = String::with_capacity(s.len());
    cleaned.push_str(sign);
    cleaned.push_str(&int_part.replace(',', ""));
    if let Some(frac) = frac_part {
        cleaned.push('.');
        cleaned.push_str(frac);
    }
    Some(cleaned)
}

pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// QUALITY RULES
// ============================================================================

/// One named quality rule: `fails` returns true when the record must be
/// quarantined with this rule's reason
pub struct QualityRule {
    pub name: &'static str,
    pub reason: RejectionReason,
    pub fails: fn(&StagingRecord) -> bool,
}

fn fails_transaction_id(r: &StagingRecord) -> bool {
    is_blank(&r.transaction_id)
}

fn fails_customer_id(r: &StagingRecord) -> bool {
    is_blank(&r.customer_id)
}

fn fails_amount(r: &StagingRecord) -> bool {
    parse_amount(&r.amount).is_none()
}

// Sign convention: sales are non-negative, returns and refunds non-positive.
// Unknown event types carry no sign constraint. Records with an unparseable
// amount pass here; the amount rule ahead of this one already catches them.
fn fails_amount_sign(r: &StagingRecord) -> bool {
    let amount = match parse_amount(&r.amount) {
        Some(a) => a,
        None => return false,
    };

    match r.event_type.trim().to_ascii_uppercase().as_str() {
        "SALE" => amount < 0.0,
        "RETURN" | "REFUND" => amount > 0.0,
        _ => false,
    }
}

fn fails_quantity(r: &StagingRecord) -> bool {
    r.quantity <= 0
}

fn fails_event_time(r: &StagingRecord) -> bool {
    parse_event_time(&r.event_time).is_none()
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct QualityClassifier {
    rules: Vec<QualityRule>,
}

impl QualityClassifier {
    /// The contractual rule order. Earlier rules win when a record violates
    /// several of them.
    pub fn new() -> Self {
        QualityClassifier {
            rules: vec![
                QualityRule {
                    name: "identity missing",
                    reason: RejectionReason::NullTransactionId,
                    fails: fails_transaction_id,
                },
                QualityRule {
                    name: "dimension key blank",
                    reason: RejectionReason::NullCustomerId,
                    fails: fails_customer_id,
                },
                QualityRule {
                    name: "measure not numeric",
                    reason: RejectionReason::InvalidAmount,
                    fails: fails_amount,
                },
                QualityRule {
                    name: "amount sign inconsistent with event type",
                    reason: RejectionReason::AmountSignMismatch,
                    fails: fails_amount_sign,
                },
                QualityRule {
                    name: "quantity not positive",
                    reason: RejectionReason::InvalidQuantity,
                    fails: fails_quantity,
                },
                QualityRule {
                    name: "timestamp missing",
                    reason: RejectionReason::MissingTimestamp,
                    fails: fails_event_time,
                },
            ],
        }
    }

    pub fn with_rules(rules: Vec<QualityRule>) -> Self {
        QualityClassifier { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// First failing rule's reason, or None when the record is clean
    pub fn classify_record(&self, record: &StagingRecord) -> Option<RejectionReason> {
        self.rules
            .iter()
            .find(|rule| (rule.fails)(record))
            .map(|rule| rule.reason)
    }

    /// Partition a batch. Deterministic and side-effect-free: the quarantine
    /// timestamp is supplied by the caller, and every input record lands in
    /// exactly one of the two outputs.
    pub fn classify(&self, batch: &[StagingRecord], quarantined_at: DateTime<Utc>) -> Partition {
        let mut clean = Vec::new();
        let mut quarantine = Vec::new();

        for record in batch {
            if let Some(reason) = self.classify_record(record) {
                quarantine.push(QuarantineRecord {
                    record: record.clone(),
                    rejection_reason: reason,
                    quarantined_at,
                });
                continue;
            }

            match convert(record) {
                Some(clean_record) => clean.push(clean_record),
                // Totality guard: structurally invalid but matching no rule
                None => quarantine.push(QuarantineRecord {
                    record: record.clone(),
                    rejection_reason: RejectionReason::Unknown,
                    quarantined_at,
                }),
            }
        }

        Partition { clean, quarantine }
    }
}

impl Default for QualityClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn convert(record: &StagingRecord) -> Option<CleanRecord> {
    let amount = parse_amount(&record.amount)?;
    let event_time = parse_event_time(&record.event_time)?;

    Some(CleanRecord {
        transaction_id: record.transaction_id.trim().to_string(),
        store_id: record.store_id.clone(),
        customer_id: record.customer_id.trim().to_string(),
        product_id: record.product_id.clone(),
        event_type: record.event_type.trim().to_ascii_uppercase(),
        quantity: record.quantity,
        unit_price: record.unit_price,
        amount,
        currency: record.currency.clone(),
        event_time,
        source_system: record.source_system.clone(),
        ingested_at: record.ingested_at,
    })
}

// ============================================================================
// TESTS
// ============================================================================
