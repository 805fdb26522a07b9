//! Blind inventory counting & reconciliation (event-sourced).
//!
//! A counting session measures physical stock with up to three independent,
//! blind counts per item and reconciles disagreeing measurements into an
//! audited final quantity. Everything here is deterministic domain logic:
//! no IO, no HTTP, no storage. Reads against the catalog and the stock
//! ledger go through the [`scope::CatalogReader`] and
//! [`scope::StockLedgerReader`] ports and happen before a command reaches
//! the aggregate.

pub mod assignment;
pub mod error;
pub mod ids;
pub mod item;
pub mod reconcile;
pub mod report;
pub mod scope;
pub mod session;
pub mod status;
pub mod views;

pub use assignment::{AssignmentStatus, CountingAssignment};
pub use error::CountingError;
pub use ids::{
    CategoryId, CountNumber, CountableItemId, LocationId, ProductId, SessionId, VariantId,
    WarehouseId,
};
pub use item::{
    ArchivedThirdCount, CountEntry, CountableItem, FlagReason, ItemDescriptor, NewCountableItem,
    ResolutionMethod, ResolutionRecord,
};
pub use reconcile::{Outcome, ReconciliationPolicy};
pub use report::{DiscrepancyReport, ReportError, ReportFormat};
pub use scope::{
    CatalogReader, CountingScope, LocationInfo, ProductInfo, ResolvedItem, ScopeFilters,
    ScopeType, StockLedgerReader, StockPosition, VariantInfo, resolve_scope,
};
pub use session::{
    ActivateSession, CancelSession, CountingCommand, CountingEvent, CountingSession,
    CreateSession, FinalizeSession, ManualOverride, RegisterUnexpectedItem, ScheduleSession,
    SubmitCount, SubmitForReview, TriggerThirdCount,
};
pub use status::{ExecutionMode, SessionStatus};

/// Aggregate type name used for event streams.
pub const AGGREGATE_TYPE: &str = "counting.session";

/// Counted quantities. Units of measure may be fractional (kg, m).
pub type Quantity = rust_decimal::Decimal;
