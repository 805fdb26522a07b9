use std::sync::Arc;

use stocktake_core::TenantId;
use stocktake_counting::{AGGREGATE_TYPE, ReconciliationPolicy, SessionId};
use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus};
use stocktake_infra::{
    command_dispatcher::CommandDispatcher,
    counting_service::CountingService,
    event_store::{EventStoreError, InMemoryEventStore},
    projections::{CountingSessionsProjection, SessionListEntry, SessionsProjectionError},
    read_model::InMemoryTenantStore,
    reference_data::{InMemoryCatalog, InMemoryStockLedger},
};
use thiserror::Error;

type Bus = InMemoryEventBus<EventEnvelope<serde_json::Value>>;

pub type AppCountingService = CountingService<Arc<InMemoryEventStore>, Arc<Bus>>;

pub type SessionsProjection =
    CountingSessionsProjection<Arc<InMemoryTenantStore<SessionId, SessionListEntry>>>;

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Projection(#[from] SessionsProjectionError),
}

/// Everything the handlers reach through `Extension<Arc<AppServices>>`.
pub struct AppServices {
    counting: AppCountingService,
    event_store: Arc<InMemoryEventStore>,
    sessions_projection: Arc<SessionsProjection>,
    catalog: Arc<InMemoryCatalog>,
    ledger: Arc<InMemoryStockLedger>,
}

impl AppServices {
    pub fn counting(&self) -> &AppCountingService {
        &self.counting
    }

    pub fn sessions(&self) -> &SessionsProjection {
        &self.sessions_projection
    }

    /// Reference catalog (seeded by the host system; tests write to it directly).
    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &InMemoryStockLedger {
        &self.ledger
    }

    /// Replay one tenant's counting streams into the session list.
    pub fn rebuild_sessions_projection(&self, tenant_id: TenantId) -> Result<usize, RebuildError> {
        let envelopes: Vec<_> = self
            .event_store
            .tenant_events(tenant_id)?
            .iter()
            .filter(|e| e.aggregate_type == AGGREGATE_TYPE)
            .map(|e| e.to_envelope())
            .collect();
        let replayed = envelopes.len();
        self.sessions_projection.rebuild_from_scratch(envelopes)?;
        tracing::info!(%tenant_id, events = replayed, "session list rebuilt");
        Ok(replayed)
    }
}

/// In-memory wiring (dev/test): store + bus + service + session list.
///
/// Must be called inside a Tokio runtime; the projection subscriber runs on
/// the blocking pool.
pub fn build_in_memory_services(policy: ReconciliationPolicy) -> AppServices {
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    let ledger = Arc::new(InMemoryStockLedger::new());

    let sessions_projection = Arc::new(CountingSessionsProjection::new(Arc::new(
        InMemoryTenantStore::new(),
    )));

    // Subscribe before the dispatcher can publish anything.
    {
        let sub = bus.subscribe();
        let sessions_projection = sessions_projection.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(env) = sub.recv() {
                if env.aggregate_type() != AGGREGATE_TYPE {
                    continue;
                }
                if let Err(e) = sessions_projection.apply_envelope(&env) {
                    tracing::warn!(
                        tenant_id = %env.tenant_id(),
                        aggregate_id = %env.aggregate_id(),
                        event_type = env.event_type(),
                        error = %e,
                        "session list projection failed"
                    );
                }
            }
        });
    }

    let dispatcher = CommandDispatcher::new(store.clone(), bus);
    let counting = CountingService::new(dispatcher, catalog.clone(), ledger.clone(), policy);

    AppServices {
        counting,
        event_store: store,
        sessions_projection,
        catalog,
        ledger,
    }
}
