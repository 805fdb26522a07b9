//! Countable items: the per-(product, variant, location) child records of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{Entity, UserId, ValueObject};

use crate::Quantity;
use crate::ids::{CountNumber, CountableItemId, LocationId, ProductId, VariantId, WarehouseId};
use crate::scope::{LocationInfo, ProductInfo, ResolvedItem};

/// Descriptive metadata snapshotted from the catalog when the item materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub sku: String,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub location_name: String,
    pub warehouse_name: String,
    pub unit_of_measure: String,
    pub barcode: Option<String>,
}

impl ItemDescriptor {
    pub fn from_catalog(
        product: &ProductInfo,
        variant_id: Option<VariantId>,
        location: &LocationInfo,
    ) -> Self {
        let variant = variant_id.and_then(|id| product.variants.iter().find(|v| v.id == id));
        Self {
            sku: product.sku.clone(),
            product_name: product.name.clone(),
            variant_name: variant.map(|v| v.name.clone()),
            location_name: location.name.clone(),
            warehouse_name: location.warehouse_name.clone(),
            unit_of_measure: product.unit_of_measure.clone(),
            barcode: variant
                .and_then(|v| v.barcode.clone())
                .or_else(|| product.barcode.clone()),
        }
    }
}

/// A resolved item together with the identity it gets inside the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCountableItem {
    pub item_id: CountableItemId,
    pub resolved: ResolvedItem,
}

/// One counter's measurement for one count number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub quantity: Quantity,
    pub submitted_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub submitted_by: UserId,
}

impl ValueObject for CountEntry {}

/// The rule (or manual act) that produced an item's final quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Pending,
    AutoAllMatch,
    AutoCountersAgree,
    ThirdCountDecisive,
    ManualOverride,
}

impl ResolutionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionMethod::Pending => "pending",
            ResolutionMethod::AutoAllMatch => "auto_all_match",
            ResolutionMethod::AutoCountersAgree => "auto_counters_agree",
            ResolutionMethod::ThirdCountDecisive => "third_count_decisive",
            ResolutionMethod::ManualOverride => "manual_override",
        }
    }

    /// Resolutions only move forward: out of `pending`, and `manual_override`
    /// may supersede anything.
    pub fn may_be_replaced_by(self, next: ResolutionMethod) -> bool {
        match next {
            ResolutionMethod::Pending => false,
            ResolutionMethod::ManualOverride => true,
            _ => self == ResolutionMethod::Pending,
        }
    }
}

/// Why an item needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// Counts 1 and 2 disagree: third-count candidate.
    NeedsAttention,
    /// All three counts differ: only a manual override closes the item.
    ManualOverrideRequired,
    /// Single-count session whose count differs from the theoretical quantity.
    CountMismatch,
    /// Auto-resolved, but |variance %| is above the session's threshold.
    VarianceExceedsThreshold,
}

impl FlagReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagReason::NeedsAttention => "needs_attention",
            FlagReason::ManualOverrideRequired => "manual_override_required",
            FlagReason::CountMismatch => "count_mismatch",
            FlagReason::VarianceExceedsThreshold => "variance_exceeds_threshold",
        }
    }
}

/// One entry of the append-only resolution audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub method: ResolutionMethod,
    pub final_qty: Quantity,
    pub variance: Quantity,
    pub notes: Option<String>,
    pub decided_by: Option<UserId>,
    pub decided_at: DateTime<Utc>,
}

/// A third count from an earlier round, kept when the item re-enters a new round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedThirdCount {
    pub round: u32,
    pub entry: CountEntry,
}

/// Child entity of a counting session.
///
/// `theoretical_qty` is only reachable through [`CountableItem::theoretical_qty`],
/// which the counter-facing projections never call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountableItem {
    id: CountableItemId,
    product_id: ProductId,
    variant_id: Option<VariantId>,
    location_id: LocationId,
    warehouse_id: WarehouseId,
    descriptor: ItemDescriptor,
    theoretical_qty: Quantity,
    unexpected: bool,

    count_1: Option<CountEntry>,
    count_2: Option<CountEntry>,
    count_3: Option<CountEntry>,
    third_count_round: Option<u32>,
    prior_third_counts: Vec<ArchivedThirdCount>,

    final_qty: Option<Quantity>,
    variance: Option<Quantity>,
    variance_percentage: Option<Quantity>,
    resolution_method: ResolutionMethod,
    resolution_notes: Option<String>,
    is_flagged: bool,
    flag_reason: Option<FlagReason>,
    resolution_history: Vec<ResolutionRecord>,
}

impl Entity for CountableItem {
    type Id = CountableItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl CountableItem {
    pub(crate) fn materialize(new: &NewCountableItem, unexpected: bool) -> Self {
        let r = &new.resolved;
        Self {
            id: new.item_id,
            product_id: r.product_id,
            variant_id: r.variant_id,
            location_id: r.location_id,
            warehouse_id: r.warehouse_id,
            descriptor: r.descriptor.clone(),
            theoretical_qty: r.theoretical_qty,
            unexpected,
            count_1: None,
            count_2: None,
            count_3: None,
            third_count_round: None,
            prior_third_counts: Vec::new(),
            final_qty: None,
            variance: None,
            variance_percentage: None,
            resolution_method: ResolutionMethod::Pending,
            resolution_notes: None,
            is_flagged: false,
            flag_reason: None,
            resolution_history: Vec::new(),
        }
    }

    pub fn item_id(&self) -> CountableItemId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn variant_id(&self) -> Option<VariantId> {
        self.variant_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    pub fn descriptor(&self) -> &ItemDescriptor {
        &self.descriptor
    }

    /// Expected quantity at resolution time (supervisor/engine use only).
    pub fn theoretical_qty(&self) -> Quantity {
        self.theoretical_qty
    }

    pub fn is_unexpected(&self) -> bool {
        self.unexpected
    }

    pub fn entry(&self, count: CountNumber) -> Option<&CountEntry> {
        match count {
            CountNumber::First => self.count_1.as_ref(),
            CountNumber::Second => self.count_2.as_ref(),
            CountNumber::Third => self.count_3.as_ref(),
        }
    }

    pub fn third_count_round(&self) -> Option<u32> {
        self.third_count_round
    }

    pub fn prior_third_counts(&self) -> &[ArchivedThirdCount] {
        &self.prior_third_counts
    }

    pub fn final_qty(&self) -> Option<Quantity> {
        self.final_qty
    }

    pub fn variance(&self) -> Option<Quantity> {
        self.variance
    }

    pub fn variance_percentage(&self) -> Option<Quantity> {
        self.variance_percentage
    }

    pub fn resolution_method(&self) -> ResolutionMethod {
        self.resolution_method
    }

    pub fn resolution_notes(&self) -> Option<&str> {
        self.resolution_notes.as_deref()
    }

    pub fn is_flagged(&self) -> bool {
        self.is_flagged
    }

    pub fn flag_reason(&self) -> Option<FlagReason> {
        self.flag_reason
    }

    pub fn resolution_history(&self) -> &[ResolutionRecord] {
        &self.resolution_history
    }

    pub fn is_pending(&self) -> bool {
        self.resolution_method == ResolutionMethod::Pending
    }

    /// Counts 1 and 2 are both present and disagree, and nothing closed the item yet.
    pub fn is_third_count_candidate(&self) -> bool {
        self.is_pending()
            && matches!(
                (&self.count_1, &self.count_2),
                (Some(a), Some(b)) if a.quantity != b.quantity
            )
    }

    pub(crate) fn record_entry(&mut self, count: CountNumber, entry: CountEntry) {
        match count {
            CountNumber::First => self.count_1 = Some(entry),
            CountNumber::Second => self.count_2 = Some(entry),
            CountNumber::Third => self.count_3 = Some(entry),
        }
    }

    pub(crate) fn enter_third_round(&mut self, round: u32) {
        if let (Some(prev_round), Some(prev)) = (self.third_count_round, self.count_3.take()) {
            self.prior_third_counts.push(ArchivedThirdCount {
                round: prev_round,
                entry: prev,
            });
        }
        self.third_count_round = Some(round);
    }

    pub(crate) fn flag(&mut self, reason: FlagReason) {
        self.is_flagged = true;
        self.flag_reason = Some(reason);
    }

    pub(crate) fn resolve(
        &mut self,
        record: ResolutionRecord,
        variance_percentage: Option<Quantity>,
        flag: Option<FlagReason>,
    ) {
        self.final_qty = Some(record.final_qty);
        self.variance = Some(record.variance);
        self.variance_percentage = variance_percentage;
        self.resolution_method = record.method;
        self.resolution_notes = record.notes.clone();
        self.is_flagged = flag.is_some();
        self.flag_reason = flag;
        self.resolution_history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_methods_only_move_forward() {
        use ResolutionMethod::*;
        assert!(Pending.may_be_replaced_by(AutoAllMatch));
        assert!(Pending.may_be_replaced_by(ThirdCountDecisive));
        assert!(!AutoCountersAgree.may_be_replaced_by(ThirdCountDecisive));
        assert!(!AutoCountersAgree.may_be_replaced_by(Pending));
        assert!(AutoCountersAgree.may_be_replaced_by(ManualOverride));
        assert!(ManualOverride.may_be_replaced_by(ManualOverride));
    }
}
