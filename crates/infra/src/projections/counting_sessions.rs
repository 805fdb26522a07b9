use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stocktake_core::{AggregateId, TenantId, UserId};
use stocktake_counting::{
    CountableItemId, CountingEvent, ExecutionMode, ScopeType, SessionId, SessionStatus,
};
use stocktake_events::EventEnvelope;

use crate::read_model::TenantStore;

/// One row of the supervisor's session list.
///
/// Carries progress counts only; no quantities of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionListEntry {
    pub session_id: SessionId,
    pub share_id: Uuid,
    pub status: SessionStatus,
    pub scope_type: ScopeType,
    pub execution_mode: ExecutionMode,
    pub requires_count_2: bool,
    pub requires_count_3: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_items: usize,
    pub unexpected_items: usize,
    pub resolved_items: usize,
    pub flagged_items: usize,
    pub third_count_rounds: u32,
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    resolved: BTreeSet<CountableItemId>,
    #[serde(skip)]
    flagged: BTreeSet<CountableItemId>,
}

impl SessionListEntry {
    fn mark_resolved(&mut self, item_id: CountableItemId, flagged: bool) {
        self.resolved.insert(item_id);
        self.set_flag(item_id, flagged);
    }

    fn set_flag(&mut self, item_id: CountableItemId, flagged: bool) {
        if flagged {
            self.flagged.insert(item_id);
        } else {
            self.flagged.remove(&item_id);
        }
        self.resolved_items = self.resolved.len();
        self.flagged_items = self.flagged.len();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum SessionsProjectionError {
    #[error("failed to deserialize counting event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("event for unknown session {0}")]
    UnknownSession(SessionId),
}

/// Tenant-scoped list of counting sessions with status and progress.
#[derive(Debug)]
pub struct CountingSessionsProjection<S>
where
    S: TenantStore<SessionId, SessionListEntry>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> CountingSessionsProjection<S>
where
    S: TenantStore<SessionId, SessionListEntry>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId, session_id: &SessionId) -> Option<SessionListEntry> {
        self.store.get(tenant_id, session_id)
    }

    /// Sessions of a tenant, newest first.
    pub fn list(&self, tenant_id: TenantId) -> Vec<SessionListEntry> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        rows
    }

    /// Apply one published envelope.
    ///
    /// Envelopes at or below the stream cursor are duplicates and ignored.
    /// A gap in the sequence is an error, so the caller can rebuild.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), SessionsProjectionError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = self.cursors.write().map_err(|_| {
            SessionsProjectionError::Deserialize("cursor lock poisoned".to_string())
        })?;
        let key = CursorKey {
            tenant_id,
            aggregate_id,
        };
        let last = cursors.get(&key).copied().unwrap_or(0);

        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(SessionsProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: CountingEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| SessionsProjectionError::Deserialize(e.to_string()))?;

        if event.tenant_id() != tenant_id {
            return Err(SessionsProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if event.session_id().0 != aggregate_id {
            return Err(SessionsProjectionError::TenantIsolation(
                "event session_id does not match envelope aggregate_id".to_string(),
            ));
        }

        self.project(tenant_id, event)?;
        cursors.insert(key, seq);
        Ok(())
    }

    fn project(
        &self,
        tenant_id: TenantId,
        event: CountingEvent,
    ) -> Result<(), SessionsProjectionError> {
        if let CountingEvent::SessionCreated(e) = &event {
            self.store.upsert(
                tenant_id,
                e.session_id,
                SessionListEntry {
                    session_id: e.session_id,
                    share_id: e.share_id,
                    status: SessionStatus::Draft,
                    scope_type: e.scope.scope_type(),
                    execution_mode: e.execution_mode,
                    requires_count_2: e.requires_count_2,
                    requires_count_3: e.requires_count_3,
                    created_by: e.created_by,
                    created_at: e.occurred_at,
                    scheduled_start: e.scheduled_start,
                    scheduled_end: e.scheduled_end,
                    activated_at: None,
                    closed_at: None,
                    total_items: 0,
                    unexpected_items: 0,
                    resolved_items: 0,
                    flagged_items: 0,
                    third_count_rounds: 0,
                    updated_at: e.occurred_at,
                    resolved: BTreeSet::new(),
                    flagged: BTreeSet::new(),
                },
            );
            return Ok(());
        }

        let session_id = event.session_id();
        let mut row = self
            .store
            .get(tenant_id, &session_id)
            .ok_or(SessionsProjectionError::UnknownSession(session_id))?;

        match &event {
            CountingEvent::SessionCreated(_) => {}
            CountingEvent::SessionScheduled(e) => {
                row.status = SessionStatus::Scheduled;
                row.scheduled_start = Some(e.scheduled_start);
                if e.scheduled_end.is_some() {
                    row.scheduled_end = e.scheduled_end;
                }
            }
            CountingEvent::SessionActivated(e) => {
                row.status = SessionStatus::Count1InProgress;
                row.activated_at = Some(e.occurred_at);
                row.total_items = e.items.len();
            }
            CountingEvent::UnexpectedItemRegistered(_) => {
                row.total_items += 1;
                row.unexpected_items += 1;
            }
            CountingEvent::StatusChanged(e) => row.status = e.to,
            CountingEvent::ItemFlagged(e) => row.set_flag(e.item_id, true),
            CountingEvent::ItemResolved(e) => row.mark_resolved(e.item_id, e.flag.is_some()),
            CountingEvent::ThirdCountTriggered(e) => row.third_count_rounds = e.round,
            CountingEvent::SessionCancelled(e) => {
                row.status = SessionStatus::Cancelled;
                row.closed_at = Some(e.occurred_at);
            }
            CountingEvent::SessionFinalized(e) => {
                row.status = SessionStatus::Finalized;
                row.closed_at = Some(e.occurred_at);
            }
            CountingEvent::AssignmentOpened(_)
            | CountingEvent::CountSubmitted(_)
            | CountingEvent::AssignmentCompleted(_) => {}
        }

        row.updated_at = stocktake_events::Event::occurred_at(&event);
        self.store.upsert(tenant_id, session_id, row);
        Ok(())
    }

    /// Rebuild from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), SessionsProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();

        let mut tenants: Vec<TenantId> = envs.iter().map(|e| e.tenant_id()).collect();
        tenants.sort();
        tenants.dedup();
        for t in tenants {
            self.store.clear_tenant(t);
        }

        envs.sort_by_key(|e| (e.tenant_id(), e.aggregate_id(), e.sequence_number()));
        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
