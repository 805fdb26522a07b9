//! Application service for counting sessions.
//!
//! Owns everything the aggregate must not do: reading the catalog and the
//! stock ledger, minting ids, reading the clock, and serializing commands
//! per session. Every write goes through the [`CommandDispatcher`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stocktake_core::{AggregateId, TenantId, UserId};
use stocktake_counting::views::{
    BarcodeLookup, CounterItemView, CounterSessionView, ReconciliationView,
    counter_entry_view, counter_item_view, counter_session_view, lookup_by_barcode,
    reconciliation_view,
};
use stocktake_counting::{
    AGGREGATE_TYPE, ActivateSession, CancelSession, CatalogReader, CountableItemId,
    CountingCommand, CountingError, CountingEvent, CountingScope, CountingSession, CreateSession,
    DiscrepancyReport, ExecutionMode, FinalizeSession, ItemDescriptor, LocationId,
    ManualOverride, NewCountableItem, ProductId, Quantity, ReconciliationPolicy,
    RegisterUnexpectedItem, ReportError, ReportFormat, ResolvedItem, ScheduleSession,
    ScopeFilters, ScopeType, SessionId, SessionStatus, StockLedgerReader, SubmitCount,
    SubmitForReview, TriggerThirdCount, VariantId, resolve_scope,
};
use stocktake_events::{EventBus, EventEnvelope};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
use crate::event_store::EventStore;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl From<CountingError> for ServiceError {
    fn from(value: CountingError) -> Self {
        ServiceError::Dispatch(DispatchError::Counting(value))
    }
}

impl ServiceError {
    /// The domain rejection behind this error, if it is one.
    pub fn counting(&self) -> Option<&CountingError> {
        match self {
            ServiceError::Dispatch(DispatchError::Counting(e)) => Some(e),
            _ => None,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Input for [`CountingService::create_session`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub scope_type: ScopeType,
    #[serde(default)]
    pub scope_filters: ScopeFilters,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub requires_count_2: bool,
    #[serde(default)]
    pub requires_count_3: bool,
    #[serde(default)]
    pub allow_unexpected_items: bool,
    pub count_1_user: Option<UserId>,
    #[serde(default)]
    pub count_2_user: Option<UserId>,
    #[serde(default)]
    pub count_3_user: Option<UserId>,
    #[serde(default)]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Input for [`CountingService::register_unexpected_item`].
#[derive(Debug, Clone, Deserialize)]
pub struct UnexpectedItemRequest {
    pub product_id: ProductId,
    #[serde(default)]
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub quantity: Quantity,
    #[serde(default)]
    pub notes: Option<String>,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Use-case facade over the counting aggregate.
///
/// Commands for one session run one at a time (a per-session mutex), so two
/// counters submitting together never surface a concurrency conflict; the
/// store's optimistic check stays as the backstop across processes.
pub struct CountingService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    catalog: Arc<dyn CatalogReader>,
    ledger: Arc<dyn StockLedgerReader>,
    policy: ReconciliationPolicy,
    clock: Clock,
    locks: Mutex<HashMap<(TenantId, SessionId), Arc<Mutex<()>>>>,
}

impl<S, B> CountingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: CommandDispatcher<S, B>,
        catalog: Arc<dyn CatalogReader>,
        ledger: Arc<dyn StockLedgerReader>,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            ledger,
            policy,
            clock: Arc::new(Utc::now),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn session_lock(&self, tenant_id: TenantId, session_id: SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry((tenant_id, session_id)).or_default().clone()
    }

    /// Terminal sessions accept no further commands; their lock can go.
    fn release_session_lock(&self, tenant_id: TenantId, session_id: SessionId) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&(tenant_id, session_id));
    }

    #[cfg(test)]
    pub(crate) fn tracked_session_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    fn run(&self, command: CountingCommand) -> ServiceResult<CountingSession> {
        self.run_dispatched(command).map(|done| done.aggregate)
    }

    fn run_dispatched(&self, command: CountingCommand) -> ServiceResult<Dispatched<CountingSession>> {
        let tenant_id = command.tenant_id();
        let session_id = command.session_id();
        let name = command.name();

        let lock = self.session_lock(tenant_id, session_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.dispatcher.execute(
            tenant_id,
            session_id.0,
            AGGREGATE_TYPE,
            command,
            |_, id| CountingSession::empty(SessionId(id)),
        ) {
            Ok(done) => {
                tracing::debug!(
                    %tenant_id,
                    %session_id,
                    command = name,
                    events = done.committed.len(),
                    "command committed"
                );
                if done.aggregate.status().is_terminal() {
                    self.release_session_lock(tenant_id, session_id);
                }
                Ok(done)
            }
            Err(err) => {
                if matches!(
                    err,
                    DispatchError::Counting(CountingError::SessionCancelled | CountingError::SessionFinalized)
                ) {
                    self.release_session_lock(tenant_id, session_id);
                }
                tracing::warn!(%tenant_id, %session_id, command = name, error = %err, "command rejected");
                Err(err.into())
            }
        }
    }

    /// Load a session that must exist in this tenant.
    pub fn session(&self, tenant_id: TenantId, session_id: SessionId) -> ServiceResult<CountingSession> {
        let session = self
            .dispatcher
            .load(tenant_id, session_id.0, |_, id| CountingSession::empty(SessionId(id)))?;
        if !session.is_created() {
            return Err(CountingError::NotFound.into());
        }
        Ok(session)
    }

    // -------------------------
    // Supervisor commands
    // -------------------------

    pub fn create_session(
        &self,
        tenant_id: TenantId,
        created_by: UserId,
        request: CreateSessionRequest,
    ) -> ServiceResult<CountingSession> {
        let scope = CountingScope::from_request(request.scope_type, &request.scope_filters)?;
        let session_id = SessionId::new(AggregateId::new());

        let session = self.run(CountingCommand::CreateSession(CreateSession {
            tenant_id,
            session_id,
            share_id: Uuid::new_v4(),
            scope,
            execution_mode: request.execution_mode,
            requires_count_2: request.requires_count_2,
            requires_count_3: request.requires_count_3,
            allow_unexpected_items: request.allow_unexpected_items,
            count_1_user: request.count_1_user,
            count_2_user: request.count_2_user,
            count_3_user: request.count_3_user,
            scheduled_start: request.scheduled_start,
            scheduled_end: request.scheduled_end,
            instructions: request.instructions,
            policy: self.policy,
            created_by,
            occurred_at: self.now(),
        }))?;

        tracing::info!(
            %tenant_id,
            %session_id,
            scope_type = ?request.scope_type,
            execution_mode = ?request.execution_mode,
            "counting session created"
        );
        Ok(session)
    }

    pub fn schedule_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        scheduled_start: DateTime<Utc>,
        scheduled_end: Option<DateTime<Utc>>,
    ) -> ServiceResult<CountingSession> {
        let session = self.run(CountingCommand::ScheduleSession(ScheduleSession {
            tenant_id,
            session_id,
            scheduled_start,
            scheduled_end,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, %scheduled_start, "counting session scheduled");
        Ok(session)
    }

    /// Resolve the scope against the current catalog and ledger, freeze the
    /// snapshot into the session, and open count 1 (and count 2 in parallel mode).
    pub fn activate_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        activated_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let current = self.session(tenant_id, session_id)?;
        match current.status() {
            SessionStatus::Cancelled => return Err(CountingError::SessionCancelled.into()),
            SessionStatus::Finalized => return Err(CountingError::SessionFinalized.into()),
            status => status.ensure_transition(SessionStatus::Count1InProgress)?,
        }

        let resolved = resolve_scope(tenant_id, current.scope(), &*self.catalog, &*self.ledger)?;
        let items: Vec<NewCountableItem> = resolved
            .into_iter()
            .map(|resolved| NewCountableItem {
                item_id: CountableItemId::new(),
                resolved,
            })
            .collect();
        let item_count = items.len();

        let session = self.run(CountingCommand::ActivateSession(ActivateSession {
            tenant_id,
            session_id,
            items,
            activated_by,
            occurred_at: self.now(),
        }))?;

        tracing::info!(%tenant_id, %session_id, items = item_count, status = %session.status(), "counting session activated");
        Ok(session)
    }

    pub fn trigger_third_count(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        item_ids: Vec<CountableItemId>,
        deadline: Option<DateTime<Utc>>,
        triggered_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let requested = item_ids.len();
        let session = self.run(CountingCommand::TriggerThirdCount(TriggerThirdCount {
            tenant_id,
            session_id,
            item_ids,
            deadline,
            triggered_by,
            occurred_at: self.now(),
        }))?;
        tracing::info!(
            %tenant_id,
            %session_id,
            items = requested,
            round = session.third_count_rounds(),
            "third count triggered"
        );
        Ok(session)
    }

    pub fn submit_for_review(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        submitted_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let session = self.run(CountingCommand::SubmitForReview(SubmitForReview {
            tenant_id,
            session_id,
            submitted_by,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, "counting session submitted for review");
        Ok(session)
    }

    pub fn manual_override(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        item_id: CountableItemId,
        quantity: Quantity,
        notes: String,
        decided_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let session = self.run(CountingCommand::ManualOverride(ManualOverride {
            tenant_id,
            session_id,
            item_id,
            quantity,
            notes,
            decided_by,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, %item_id, %decided_by, "item resolved by manual override");
        Ok(session)
    }

    pub fn cancel_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        reason: String,
        cancelled_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let session = self.run(CountingCommand::CancelSession(CancelSession {
            tenant_id,
            session_id,
            reason,
            cancelled_by,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, "counting session cancelled");
        Ok(session)
    }

    pub fn finalize_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        finalized_by: UserId,
    ) -> ServiceResult<CountingSession> {
        let session = self.run(CountingCommand::FinalizeSession(FinalizeSession {
            tenant_id,
            session_id,
            finalized_by,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, items = session.items().len(), "counting session finalized");
        Ok(session)
    }

    // -------------------------
    // Counter commands
    // -------------------------

    /// Record a blind count. Returns the counter's own view of the item.
    pub fn submit_count(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        counter: UserId,
        item_id: CountableItemId,
        quantity: Quantity,
        notes: Option<String>,
    ) -> ServiceResult<CounterItemView> {
        let done = self.run_dispatched(CountingCommand::SubmitCount(SubmitCount {
            tenant_id,
            session_id,
            item_id,
            counter,
            quantity,
            notes,
            occurred_at: self.now(),
        }))?;
        tracing::debug!(%tenant_id, %session_id, %item_id, %counter, "count submitted");
        self.counter_view_after_write(&done, item_id, counter)
    }

    /// Add an item found on the shelf but absent from the frozen scope.
    pub fn register_unexpected_item(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        counter: UserId,
        request: UnexpectedItemRequest,
    ) -> ServiceResult<CounterItemView> {
        let product = self
            .catalog
            .product(tenant_id, request.product_id)
            .ok_or_else(|| CountingError::validation(format!("unknown product {}", request.product_id)))?;
        if let Some(variant_id) = request.variant_id {
            if !product.variants.iter().any(|v| v.id == variant_id) {
                return Err(CountingError::validation(format!(
                    "variant {variant_id} does not belong to product {}",
                    product.id
                ))
                .into());
            }
        }
        let location = self
            .catalog
            .location(tenant_id, request.location_id)
            .ok_or_else(|| CountingError::validation(format!("unknown location {}", request.location_id)))?;

        let item_id = CountableItemId::new();
        let item = NewCountableItem {
            item_id,
            resolved: ResolvedItem {
                product_id: product.id,
                variant_id: request.variant_id,
                location_id: location.id,
                warehouse_id: location.warehouse_id,
                theoretical_qty: Quantity::ZERO,
                descriptor: ItemDescriptor::from_catalog(&product, request.variant_id, &location),
            },
        };

        let done = self.run_dispatched(CountingCommand::RegisterUnexpectedItem(RegisterUnexpectedItem {
            tenant_id,
            session_id,
            counter,
            item,
            quantity: request.quantity,
            notes: request.notes,
            occurred_at: self.now(),
        }))?;
        tracing::info!(%tenant_id, %session_id, %item_id, %counter, "unexpected item registered");
        self.counter_view_after_write(&done, item_id, counter)
    }

    /// The write may complete the counter's assignment and open their next
    /// count in the same batch, so the view follows the entry that was written.
    fn counter_view_after_write(
        &self,
        done: &Dispatched<CountingSession>,
        item_id: CountableItemId,
        counter: UserId,
    ) -> ServiceResult<CounterItemView> {
        let written = done
            .committed
            .iter()
            .filter_map(|stored| serde_json::from_value::<CountingEvent>(stored.payload.clone()).ok())
            .find_map(|event| match event {
                CountingEvent::CountSubmitted(e) if e.item_id == item_id && e.counter == counter => {
                    Some(e.count_number)
                }
                _ => None,
            });
        Ok(match written {
            Some(count) => counter_entry_view(&done.aggregate, item_id, count)?,
            // Idempotent retry: nothing committed, the open assignment still holds the entry.
            None => counter_item_view(&done.aggregate, item_id, counter)?,
        })
    }

    // -------------------------
    // Reads
    // -------------------------

    pub fn counter_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        counter: UserId,
    ) -> ServiceResult<CounterSessionView> {
        let session = self.session(tenant_id, session_id)?;
        Ok(counter_session_view(&session, counter, self.now())?)
    }

    pub fn counter_item(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        item_id: CountableItemId,
        counter: UserId,
    ) -> ServiceResult<CounterItemView> {
        let session = self.session(tenant_id, session_id)?;
        Ok(counter_item_view(&session, item_id, counter)?)
    }

    pub fn lookup_barcode(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        counter: UserId,
        code: &str,
    ) -> ServiceResult<BarcodeLookup> {
        let session = self.session(tenant_id, session_id)?;
        Ok(lookup_by_barcode(&session, counter, code)?)
    }

    pub fn reconciliation(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> ServiceResult<ReconciliationView> {
        let session = self.session(tenant_id, session_id)?;
        Ok(reconciliation_view(&session, self.now()))
    }

    pub fn discrepancy_report(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> ServiceResult<DiscrepancyReport> {
        let session = self.session(tenant_id, session_id)?;
        Ok(DiscrepancyReport::build(&session, self.now()))
    }

    pub fn export_report(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        format: ReportFormat,
    ) -> ServiceResult<Vec<u8>> {
        let report = self.discrepancy_report(tenant_id, session_id)?;
        let bytes = report.export(format)?;
        tracing::info!(%tenant_id, %session_id, ?format, bytes = bytes.len(), "discrepancy report exported");
        Ok(bytes)
    }
}
