//! Read projections over one session.
//!
//! Counters and supervisors get two different families of types. The
//! counter-facing ones ([`CounterSessionView`], [`CounterItemView`],
//! [`BarcodeLookup`]) have no field that could hold a theoretical quantity
//! or another counter's entry, so nothing has to be filtered at
//! serialization time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::UserId;

use crate::Quantity;
use crate::assignment::{AssignmentStatus, CountingAssignment};
use crate::error::CountingError;
use crate::ids::{
    CountNumber, CountableItemId, LocationId, ProductId, SessionId, VariantId, WarehouseId,
};
use crate::item::{
    ArchivedThirdCount, CountEntry, CountableItem, FlagReason, ResolutionMethod, ResolutionRecord,
};
use crate::scope::ScopeType;
use crate::session::CountingSession;
use crate::status::{ExecutionMode, SessionStatus};

/// Session header shared by both surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub share_id: uuid::Uuid,
    pub status: SessionStatus,
    pub scope_type: ScopeType,
    pub execution_mode: ExecutionMode,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    pub fn of(session: &CountingSession) -> Self {
        Self {
            session_id: session.id_typed(),
            share_id: session.share_id(),
            status: session.status(),
            scope_type: session.scope().scope_type(),
            execution_mode: session.execution_mode(),
            scheduled_start: session.scheduled_start(),
            scheduled_end: session.scheduled_end(),
            instructions: session.instructions().map(str::to_string),
            activated_at: session.activated_at(),
        }
    }
}

// -------------------------
// Counter (blind) surface
// -------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRef {
    pub id: VariantId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    pub id: LocationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRef {
    pub id: WarehouseId,
    pub name: String,
}

/// One item as its counter sees it: descriptive metadata and their own entry only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterItemView {
    pub item_id: CountableItemId,
    pub product: ProductRef,
    pub variant: Option<VariantRef>,
    pub location: LocationRef,
    pub warehouse: WarehouseRef,
    pub unit_of_measure: String,
    pub barcode: Option<String>,
    pub is_counted: bool,
    pub my_count: Option<Quantity>,
    pub my_count_at: Option<DateTime<Utc>>,
    pub my_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterProgress {
    pub total_items: usize,
    pub counted_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAssignmentView {
    pub count_number: CountNumber,
    pub round: u32,
    pub status: AssignmentStatus,
    pub writable: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSessionView {
    pub session: SessionSummary,
    pub my_count_number: CountNumber,
    pub my_assignment: CounterAssignmentView,
    pub items: Vec<CounterItemView>,
    pub progress: CounterProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarcodeLookup {
    pub found: bool,
    pub item: Option<CounterItemView>,
}

/// The counter's writable assignment, else their most recent one.
fn counter_assignment(
    session: &CountingSession,
    counter: UserId,
) -> Result<&CountingAssignment, CountingError> {
    session
        .active_assignment_for(counter)
        .or_else(|| session.latest_assignment_for(counter))
        .ok_or(CountingError::Unauthorized)
}

fn item_view(item: &CountableItem, count: CountNumber) -> CounterItemView {
    let d = item.descriptor();
    let mine = item.entry(count);
    CounterItemView {
        item_id: item.item_id(),
        product: ProductRef {
            id: item.product_id(),
            sku: d.sku.clone(),
            name: d.product_name.clone(),
        },
        variant: item.variant_id().map(|id| VariantRef {
            id,
            name: d.variant_name.clone(),
        }),
        location: LocationRef {
            id: item.location_id(),
            name: d.location_name.clone(),
        },
        warehouse: WarehouseRef {
            id: item.warehouse_id(),
            name: d.warehouse_name.clone(),
        },
        unit_of_measure: d.unit_of_measure.clone(),
        barcode: d.barcode.clone(),
        is_counted: mine.is_some(),
        my_count: mine.map(|e| e.quantity),
        my_count_at: mine.map(|e| e.submitted_at),
        my_notes: mine.and_then(|e| e.notes.clone()),
    }
}

pub fn counter_session_view(
    session: &CountingSession,
    counter: UserId,
    now: DateTime<Utc>,
) -> Result<CounterSessionView, CountingError> {
    let assignment = counter_assignment(session, counter)?;
    let count = assignment.count_number;
    let items: Vec<CounterItemView> = session
        .assignment_items(assignment)
        .map(|item| item_view(item, count))
        .collect();
    let counted_items = items.iter().filter(|i| i.is_counted).count();

    Ok(CounterSessionView {
        session: SessionSummary::of(session),
        my_count_number: count,
        my_assignment: CounterAssignmentView {
            count_number: count,
            round: assignment.round,
            status: assignment.status_at(now),
            writable: session.is_assignment_active(assignment),
            started_at: assignment.started_at,
            completed_at: assignment.completed_at,
            deadline: assignment.deadline,
        },
        progress: CounterProgress {
            total_items: items.len(),
            counted_items,
        },
        items,
    })
}

pub fn counter_item_view(
    session: &CountingSession,
    item_id: CountableItemId,
    counter: UserId,
) -> Result<CounterItemView, CountingError> {
    let assignment = counter_assignment(session, counter)?;
    let item = session
        .item(item_id)
        .filter(|item| session.covers(assignment, item))
        .ok_or(CountingError::ItemNotInScope(item_id))?;
    Ok(item_view(item, assignment.count_number))
}

/// One item as seen through the counter's entry for `count`, whichever phase
/// is open now.
pub fn counter_entry_view(
    session: &CountingSession,
    item_id: CountableItemId,
    count: CountNumber,
) -> Result<CounterItemView, CountingError> {
    let item = session
        .item(item_id)
        .ok_or(CountingError::ItemNotInScope(item_id))?;
    Ok(item_view(item, count))
}

/// Resolve a scanned code to an uncounted item of the counter's open assignment.
///
/// Codes of items outside that scope (or already counted) report `found: false`.
pub fn lookup_by_barcode(
    session: &CountingSession,
    counter: UserId,
    code: &str,
) -> Result<BarcodeLookup, CountingError> {
    let assignment = session
        .active_assignment_for(counter)
        .ok_or(CountingError::Unauthorized)?;
    let code = code.trim();
    let count = assignment.count_number;

    let hit = session.assignment_items(assignment).find(|item| {
        item.entry(count).is_none() && item.descriptor().barcode.as_deref() == Some(code)
    });

    Ok(match hit {
        Some(item) => BarcodeLookup {
            found: true,
            item: Some(item_view(item, count)),
        },
        None => BarcodeLookup {
            found: false,
            item: None,
        },
    })
}

// -------------------------
// Supervisor surface
// -------------------------

/// Item counts per resolution method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCounts {
    pub pending: usize,
    pub auto_all_match: usize,
    pub auto_counters_agree: usize,
    pub third_count_decisive: usize,
    pub manual_override: usize,
}

impl MethodCounts {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a CountableItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            let slot = match item.resolution_method() {
                ResolutionMethod::Pending => &mut counts.pending,
                ResolutionMethod::AutoAllMatch => &mut counts.auto_all_match,
                ResolutionMethod::AutoCountersAgree => &mut counts.auto_counters_agree,
                ResolutionMethod::ThirdCountDecisive => &mut counts.third_count_decisive,
                ResolutionMethod::ManualOverride => &mut counts.manual_override,
            };
            *slot += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub session: SessionSummary,
    pub total_items: usize,
    pub resolved_items: usize,
    pub pending_items: usize,
    pub flagged_items: usize,
    pub by_method: MethodCounts,
    pub third_count_candidates: Vec<CountableItemId>,
    pub third_count_rounds: u32,
    pub cancellation_reason: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentProgress {
    pub counter: UserId,
    pub count_number: CountNumber,
    pub round: u32,
    pub status: AssignmentStatus,
    pub total_items: usize,
    pub counted_items: usize,
    pub deadline: Option<DateTime<Utc>>,
}

/// Supervisor view of one item: theoretical quantity and every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub item_id: CountableItemId,
    pub product_id: ProductId,
    pub sku: String,
    pub product_name: String,
    pub variant_id: Option<VariantId>,
    pub variant_name: Option<String>,
    pub location_id: LocationId,
    pub location_name: String,
    pub warehouse_id: WarehouseId,
    pub warehouse_name: String,
    pub unit_of_measure: String,
    pub unexpected: bool,
    pub theoretical_qty: Quantity,
    pub count_1: Option<CountEntry>,
    pub count_2: Option<CountEntry>,
    pub count_3: Option<CountEntry>,
    pub third_count_round: Option<u32>,
    pub prior_third_counts: Vec<ArchivedThirdCount>,
    pub final_qty: Option<Quantity>,
    pub variance: Option<Quantity>,
    pub variance_percentage: Option<Quantity>,
    pub resolution_method: ResolutionMethod,
    pub resolution_notes: Option<String>,
    pub is_flagged: bool,
    pub flag_reason: Option<FlagReason>,
    pub resolution_history: Vec<ResolutionRecord>,
}

impl ReconciliationItem {
    pub fn of(item: &CountableItem) -> Self {
        let d = item.descriptor();
        Self {
            item_id: item.item_id(),
            product_id: item.product_id(),
            sku: d.sku.clone(),
            product_name: d.product_name.clone(),
            variant_id: item.variant_id(),
            variant_name: d.variant_name.clone(),
            location_id: item.location_id(),
            location_name: d.location_name.clone(),
            warehouse_id: item.warehouse_id(),
            warehouse_name: d.warehouse_name.clone(),
            unit_of_measure: d.unit_of_measure.clone(),
            unexpected: item.is_unexpected(),
            theoretical_qty: item.theoretical_qty(),
            count_1: item.entry(CountNumber::First).cloned(),
            count_2: item.entry(CountNumber::Second).cloned(),
            count_3: item.entry(CountNumber::Third).cloned(),
            third_count_round: item.third_count_round(),
            prior_third_counts: item.prior_third_counts().to_vec(),
            final_qty: item.final_qty(),
            variance: item.variance(),
            variance_percentage: item.variance_percentage(),
            resolution_method: item.resolution_method(),
            resolution_notes: item.resolution_notes().map(str::to_string),
            is_flagged: item.is_flagged(),
            flag_reason: item.flag_reason(),
            resolution_history: item.resolution_history().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationView {
    pub summary: ReconciliationSummary,
    pub assignments: Vec<AssignmentProgress>,
    pub items: Vec<ReconciliationItem>,
}

pub fn reconciliation_view(session: &CountingSession, now: DateTime<Utc>) -> ReconciliationView {
    let items = session.items();
    let by_method = MethodCounts::tally(items);
    let summary = ReconciliationSummary {
        session: SessionSummary::of(session),
        total_items: items.len(),
        resolved_items: items.len() - by_method.pending,
        pending_items: by_method.pending,
        flagged_items: items.iter().filter(|i| i.is_flagged()).count(),
        by_method,
        third_count_candidates: session.third_count_candidates(),
        third_count_rounds: session.third_count_rounds(),
        cancellation_reason: session.cancellation_reason().map(str::to_string),
        finalized_at: session.finalized_at(),
    };

    let assignments = session
        .assignments()
        .iter()
        .map(|a| {
            let (total_items, counted_items) = session.assignment_progress(a);
            AssignmentProgress {
                counter: a.counter,
                count_number: a.count_number,
                round: a.round,
                status: a.status_at(now),
                total_items,
                counted_items,
                deadline: a.deadline,
            }
        })
        .collect();

    ReconciliationView {
        summary,
        assignments,
        items: items.iter().map(ReconciliationItem::of).collect(),
    }
}
