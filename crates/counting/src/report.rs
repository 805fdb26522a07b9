//! Discrepancy reporter: audit statistics over a session. Read-only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocktake_core::UserId;

use crate::Quantity;
use crate::ids::{CountNumber, CountableItemId, SessionId};
use crate::item::{CountEntry, CountableItem, FlagReason, ResolutionMethod};
use crate::session::CountingSession;
use crate::status::SessionStatus;
use crate::views::MethodCounts;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unsupported report format: {0}")]
    UnsupportedFormat(String),

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ReportFormat::Json => "application/json",
            ReportFormat::Csv => "text/csv",
        }
    }
}

impl core::str::FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(ReportError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_items: usize,
    pub flagged_items: usize,
    pub unresolved_items: usize,
    pub unexpected_items: usize,
    pub by_method: MethodCounts,
}

/// Sum of variances over resolved items, split by sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarianceTotals {
    pub positive: Quantity,
    pub negative: Quantity,
    pub net: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterPerformance {
    pub counter: UserId,
    pub count_numbers: Vec<CountNumber>,
    pub items_counted: usize,
    /// Entries equal to another count of the same item.
    pub matched_other_counter: usize,
    pub matched_theoretical: usize,
    /// Entries that lost a majority-of-three decision.
    pub overruled_by_third_count: usize,
    pub matched_final: usize,
    /// `matched_final / items_counted`, four decimals; `None` without entries.
    pub accuracy_rate: Option<Decimal>,
}

impl CounterPerformance {
    fn new(counter: UserId) -> Self {
        Self {
            counter,
            count_numbers: Vec::new(),
            items_counted: 0,
            matched_other_counter: 0,
            matched_theoretical: 0,
            overruled_by_third_count: 0,
            matched_final: 0,
            accuracy_rate: None,
        }
    }
}

/// An item whose outcome differs from the books or still needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyLine {
    pub item_id: CountableItemId,
    pub sku: String,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub location_name: String,
    pub warehouse_name: String,
    pub theoretical_qty: Quantity,
    pub final_qty: Option<Quantity>,
    pub variance: Option<Quantity>,
    pub variance_percentage: Option<Quantity>,
    pub resolution_method: ResolutionMethod,
    pub is_flagged: bool,
    pub flag_reason: Option<FlagReason>,
}

impl DiscrepancyLine {
    fn of(item: &CountableItem) -> Self {
        let d = item.descriptor();
        Self {
            item_id: item.item_id(),
            sku: d.sku.clone(),
            product_name: d.product_name.clone(),
            variant_name: d.variant_name.clone(),
            location_name: d.location_name.clone(),
            warehouse_name: d.warehouse_name.clone(),
            theoretical_qty: item.theoretical_qty(),
            final_qty: item.final_qty(),
            variance: item.variance(),
            variance_percentage: item.variance_percentage(),
            resolution_method: item.resolution_method(),
            is_flagged: item.is_flagged(),
            flag_reason: item.flag_reason(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub variance: VarianceTotals,
    pub counters: Vec<CounterPerformance>,
    pub discrepancies: Vec<DiscrepancyLine>,
}

impl DiscrepancyReport {
    pub fn build(session: &CountingSession, generated_at: DateTime<Utc>) -> Self {
        let items = session.items();

        let mut variance = VarianceTotals::default();
        for v in items.iter().filter_map(|i| i.variance()) {
            if v > Decimal::ZERO {
                variance.positive += v;
            } else {
                variance.negative += v;
            }
            variance.net += v;
        }

        let mut counters: BTreeMap<UserId, CounterPerformance> = BTreeMap::new();
        for item in items {
            tally_item(item, &mut counters);
        }
        let counters = counters
            .into_values()
            .map(|mut p| {
                p.count_numbers.sort();
                p.count_numbers.dedup();
                if p.items_counted > 0 {
                    let rate = Decimal::from(p.matched_final as u64)
                        / Decimal::from(p.items_counted as u64);
                    p.accuracy_rate = Some(rate.round_dp(4));
                }
                p
            })
            .collect();

        let discrepancies = items
            .iter()
            .filter(|i| i.is_pending() || i.is_flagged() || i.variance().is_some_and(|v| !v.is_zero()))
            .map(DiscrepancyLine::of)
            .collect();

        Self {
            session_id: session.id_typed(),
            status: session.status(),
            generated_at,
            summary: ReportSummary {
                total_items: items.len(),
                flagged_items: items.iter().filter(|i| i.is_flagged()).count(),
                unresolved_items: items.iter().filter(|i| i.is_pending()).count(),
                unexpected_items: items.iter().filter(|i| i.is_unexpected()).count(),
                by_method: MethodCounts::tally(items),
            },
            variance,
            counters,
            discrepancies,
        }
    }

    pub fn export(&self, format: ReportFormat) -> Result<Vec<u8>, ReportError> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            ReportFormat::Csv => self.to_csv(),
        }
    }

    /// Sectioned CSV: the first column names the section of each row.
    fn to_csv(&self) -> Result<Vec<u8>, ReportError> {
        let mut wtr = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());

        let s = &self.summary;
        let m = &s.by_method;
        wtr.write_record(["section", "metric", "value"])?;
        let summary_rows = [
            ("session_id", self.session_id.to_string()),
            ("status", self.status.to_string()),
            ("generated_at", self.generated_at.to_rfc3339()),
            ("total_items", s.total_items.to_string()),
            ("flagged_items", s.flagged_items.to_string()),
            ("unresolved_items", s.unresolved_items.to_string()),
            ("unexpected_items", s.unexpected_items.to_string()),
            ("pending", m.pending.to_string()),
            ("auto_all_match", m.auto_all_match.to_string()),
            ("auto_counters_agree", m.auto_counters_agree.to_string()),
            ("third_count_decisive", m.third_count_decisive.to_string()),
            ("manual_override", m.manual_override.to_string()),
            ("variance_positive", self.variance.positive.to_string()),
            ("variance_negative", self.variance.negative.to_string()),
            ("variance_net", self.variance.net.to_string()),
        ];
        for (metric, value) in summary_rows {
            wtr.write_record(["summary", metric, value.as_str()])?;
        }

        wtr.write_record([
            "section",
            "counter",
            "count_numbers",
            "items_counted",
            "matched_other_counter",
            "matched_theoretical",
            "overruled_by_third_count",
            "matched_final",
            "accuracy_rate",
        ])?;
        for p in &self.counters {
            let counts: Vec<String> = p.count_numbers.iter().map(|c| c.as_u8().to_string()).collect();
            wtr.write_record([
                "counter".to_string(),
                p.counter.to_string(),
                counts.join("|"),
                p.items_counted.to_string(),
                p.matched_other_counter.to_string(),
                p.matched_theoretical.to_string(),
                p.overruled_by_third_count.to_string(),
                p.matched_final.to_string(),
                opt(p.accuracy_rate),
            ])?;
        }

        wtr.write_record([
            "section",
            "item_id",
            "sku",
            "product_name",
            "variant_name",
            "location_name",
            "warehouse_name",
            "theoretical_qty",
            "final_qty",
            "variance",
            "variance_percentage",
            "resolution_method",
            "flag_reason",
        ])?;
        for d in &self.discrepancies {
            wtr.write_record([
                "discrepancy".to_string(),
                d.item_id.to_string(),
                d.sku.clone(),
                d.product_name.clone(),
                d.variant_name.clone().unwrap_or_default(),
                d.location_name.clone(),
                d.warehouse_name.clone(),
                d.theoretical_qty.to_string(),
                opt(d.final_qty),
                opt(d.variance),
                opt(d.variance_percentage),
                d.resolution_method.as_str().to_string(),
                d.flag_reason.map(|f| f.as_str().to_string()).unwrap_or_default(),
            ])?;
        }

        wtr.flush().map_err(csv::Error::from)?;
        wtr.into_inner()
            .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))
    }
}

fn opt(value: Option<Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn tally_item(item: &CountableItem, counters: &mut BTreeMap<UserId, CounterPerformance>) {
    let current: Vec<(CountNumber, &CountEntry)> = CountNumber::ALL
        .iter()
        .filter_map(|&n| item.entry(n).map(|e| (n, e)))
        .collect();
    let archived = item
        .prior_third_counts()
        .iter()
        .map(|a| (CountNumber::Third, &a.entry));
    let all: Vec<(CountNumber, &CountEntry)> = current.iter().copied().chain(archived).collect();

    let decided_by_third = item.resolution_method() == ResolutionMethod::ThirdCountDecisive;
    for &(count, entry) in &all {
        let p = counters
            .entry(entry.submitted_by)
            .or_insert_with(|| CounterPerformance::new(entry.submitted_by));
        p.count_numbers.push(count);
        p.items_counted += 1;

        let matched_other = all.iter().any(|(_, other)| {
            other.submitted_by != entry.submitted_by && other.quantity == entry.quantity
        });
        if matched_other {
            p.matched_other_counter += 1;
        }
        if entry.quantity == item.theoretical_qty() {
            p.matched_theoretical += 1;
        }
        if let Some(final_qty) = item.final_qty() {
            if entry.quantity == final_qty {
                p.matched_final += 1;
            } else if decided_by_third {
                p.overruled_by_third_count += 1;
            }
        }
    }
}
