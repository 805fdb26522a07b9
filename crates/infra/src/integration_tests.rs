//! Integration tests for the counting pipeline.
//!
//! Tests: Service → Dispatcher → EventStore → EventBus → Projection
//!
//! Verifies:
//! - The reconciliation scenarios end to end
//! - Counters never see theoretical or foreign quantities
//! - Tenant isolation is preserved
//! - The session list projection follows the event stream

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use stocktake_core::{TenantId, UserId};
    use stocktake_counting::{
        CountableItemId, CountingError, CountingEvent, ExecutionMode, FlagReason, LocationId, LocationInfo,
        CountNumber, ProductId, ProductInfo, ReportFormat, ResolutionMethod, ScopeFilters,
        ScopeType, SessionId, SessionStatus, WarehouseId,
    };
    use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus};

    use crate::command_dispatcher::CommandDispatcher;
    use crate::counting_service::{CountingService, CreateSessionRequest, UnexpectedItemRequest};
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{CountingSessionsProjection, SessionListEntry};
    use crate::read_model::InMemoryTenantStore;
    use crate::reference_data::{InMemoryCatalog, InMemoryStockLedger};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Service = CountingService<InMemoryEventStore, Bus>;
    type Projection =
        CountingSessionsProjection<Arc<InMemoryTenantStore<SessionId, SessionListEntry>>>;

    struct Fixture {
        service: Service,
        projection: Arc<Projection>,
        ledger: Arc<InMemoryStockLedger>,
        tenant_id: TenantId,
        product_id: ProductId,
        extra_product_id: ProductId,
        location_id: LocationId,
        supervisor: UserId,
        alice: UserId,
        bob: UserId,
        carol: UserId,
    }

    fn product(id: ProductId, sku: &str, barcode: &str) -> ProductInfo {
        ProductInfo {
            id,
            sku: sku.to_string(),
            name: format!("Product {sku}"),
            barcode: Some(barcode.to_string()),
            category_id: None,
            unit_of_measure: "pcs".to_string(),
            variants: Vec::new(),
        }
    }

    fn setup() -> Fixture {
        let tenant_id = TenantId::new();
        let product_id = ProductId::new();
        let extra_product_id = ProductId::new();
        let location_id = LocationId::new();

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.upsert_product(tenant_id, product(product_id, "SKU-1", "4006381333931"));
        catalog.upsert_product(tenant_id, product(extra_product_id, "SKU-2", "4006381333948"));
        catalog.upsert_location(
            tenant_id,
            LocationInfo {
                id: location_id,
                name: "Aisle 1".to_string(),
                warehouse_id: WarehouseId::new(),
                warehouse_name: "Main".to_string(),
            },
        );

        let ledger = Arc::new(InMemoryStockLedger::new());
        ledger.set_balance(tenant_id, product_id, None, location_id, dec!(50));

        let store = InMemoryEventStore::new();
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = CommandDispatcher::new(store, bus.clone());
        let service = CountingService::new(
            dispatcher,
            catalog,
            ledger.clone(),
            Default::default(),
        );

        let projection = Arc::new(CountingSessionsProjection::new(Arc::new(
            InMemoryTenantStore::new(),
        )));

        // Subscribe before anything is published.
        let projection_clone = projection.clone();
        let bus_clone = bus.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        std::thread::spawn(move || {
            let sub = bus_clone.subscribe();
            let _ = ready_tx.send(());
            while let Ok(env) = sub.recv() {
                if let Err(e) = projection_clone.apply_envelope(&env) {
                    eprintln!("Failed to apply envelope: {e:?}");
                }
            }
        });
        let _ = ready_rx.recv_timeout(std::time::Duration::from_secs(1));

        Fixture {
            service,
            projection,
            ledger,
            tenant_id,
            product_id,
            extra_product_id,
            location_id,
            supervisor: UserId::new(),
            alice: UserId::new(),
            bob: UserId::new(),
            carol: UserId::new(),
        }
    }

    fn wait_for_processing() {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    impl Fixture {
        fn request(&self, requires_count_2: bool, requires_count_3: bool) -> CreateSessionRequest {
            CreateSessionRequest {
                scope_type: ScopeType::ProductLocation,
                scope_filters: ScopeFilters {
                    product_ids: vec![self.product_id],
                    location_id: Some(self.location_id),
                    ..Default::default()
                },
                execution_mode: ExecutionMode::Parallel,
                requires_count_2,
                requires_count_3,
                allow_unexpected_items: false,
                count_1_user: Some(self.alice),
                count_2_user: requires_count_2.then_some(self.bob),
                count_3_user: requires_count_3.then_some(self.carol),
                scheduled_start: None,
                scheduled_end: None,
                instructions: None,
            }
        }

        /// Create and activate; returns the session and its single item.
        fn start(&self, request: CreateSessionRequest) -> (SessionId, CountableItemId) {
            let session = self
                .service
                .create_session(self.tenant_id, self.supervisor, request)
                .unwrap();
            let session_id = session.id_typed();
            let session = self
                .service
                .activate_session(self.tenant_id, session_id, self.supervisor)
                .unwrap();
            let item_id = session.items()[0].item_id();
            (session_id, item_id)
        }

        fn count(&self, session_id: SessionId, counter: UserId, item_id: CountableItemId, qty: rust_decimal::Decimal) {
            self.service
                .submit_count(self.tenant_id, session_id, counter, item_id, qty, None)
                .unwrap();
        }
    }

    #[test]
    fn single_count_matching_theoretical_auto_resolves() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));

        fx.count(session_id, fx.alice, item_id, dec!(50));

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        assert_eq!(session.status(), SessionStatus::PendingReview);
        let item = session.item(item_id).unwrap();
        assert_eq!(item.resolution_method(), ResolutionMethod::AutoAllMatch);
        assert_eq!(item.final_qty(), Some(dec!(50)));
        assert_eq!(item.variance(), Some(dec!(0)));
        assert!(!item.is_flagged());

        let session = fx
            .service
            .finalize_session(fx.tenant_id, session_id, fx.supervisor)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Finalized);
    }

    #[test]
    fn agreeing_counters_override_theoretical() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(true, false));

        fx.count(session_id, fx.alice, item_id, dec!(48));
        fx.count(session_id, fx.bob, item_id, dec!(48));

        let view = fx.service.reconciliation(fx.tenant_id, session_id).unwrap();
        let item = &view.items[0];
        assert_eq!(item.resolution_method, ResolutionMethod::AutoCountersAgree);
        assert_eq!(item.final_qty, Some(dec!(48)));
        assert_eq!(item.variance, Some(dec!(-2)));
        assert_eq!(item.theoretical_qty, dec!(50));
        assert_eq!(view.summary.session.status, SessionStatus::PendingReview);
    }

    #[test]
    fn third_count_breaks_a_disagreement() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(true, true));

        fx.count(session_id, fx.alice, item_id, dec!(48));
        fx.count(session_id, fx.bob, item_id, dec!(52));

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        assert_eq!(session.status(), SessionStatus::Count2Completed);
        let item = session.item(item_id).unwrap();
        assert_eq!(item.resolution_method(), ResolutionMethod::Pending);
        assert!(item.is_flagged());
        assert_eq!(session.third_count_candidates(), vec![item_id]);

        // Carol has nothing to count until the supervisor triggers the round.
        let err = fx
            .service
            .submit_count(fx.tenant_id, session_id, fx.carol, item_id, dec!(48), None)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::Unauthorized)));

        fx.service
            .trigger_third_count(fx.tenant_id, session_id, vec![item_id], None, fx.supervisor)
            .unwrap();
        fx.count(session_id, fx.carol, item_id, dec!(48));

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        assert_eq!(session.status(), SessionStatus::PendingReview);
        let item = session.item(item_id).unwrap();
        assert_eq!(item.resolution_method(), ResolutionMethod::ThirdCountDecisive);
        assert_eq!(item.final_qty(), Some(dec!(48)));
    }

    #[test]
    fn three_distinct_counts_need_manual_override_before_finalize() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(true, true));

        fx.count(session_id, fx.alice, item_id, dec!(48));
        fx.count(session_id, fx.bob, item_id, dec!(52));
        fx.service
            .trigger_third_count(fx.tenant_id, session_id, vec![item_id], None, fx.supervisor)
            .unwrap();
        fx.count(session_id, fx.carol, item_id, dec!(55));

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        let item = session.item(item_id).unwrap();
        assert_eq!(item.resolution_method(), ResolutionMethod::Pending);
        assert_eq!(item.flag_reason(), Some(FlagReason::ManualOverrideRequired));

        let err = fx
            .service
            .finalize_session(fx.tenant_id, session_id, fx.supervisor)
            .unwrap_err();
        match err.counting() {
            Some(CountingError::UnresolvedItems(ids)) => assert_eq!(ids, &vec![item_id]),
            other => panic!("expected UnresolvedItems, got {other:?}"),
        }

        let err = fx
            .service
            .manual_override(fx.tenant_id, session_id, item_id, dec!(50), "ok".into(), fx.supervisor)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::ManualOverrideRequiresNotes)));

        let session = fx
            .service
            .manual_override(
                fx.tenant_id,
                session_id,
                item_id,
                dec!(50),
                "Recount confirmed by supervisor on shelf".into(),
                fx.supervisor,
            )
            .unwrap();
        let item = session.item(item_id).unwrap();
        assert_eq!(item.resolution_method(), ResolutionMethod::ManualOverride);
        assert_eq!(item.final_qty(), Some(dec!(50)));
        assert_eq!(item.resolution_history().len(), 1);

        let session = fx
            .service
            .finalize_session(fx.tenant_id, session_id, fx.supervisor)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Finalized);
    }

    #[test]
    fn submit_response_shows_the_entry_just_written() {
        let fx = setup();
        let mut request = fx.request(true, false);
        request.execution_mode = ExecutionMode::Sequential;
        request.count_2_user = Some(fx.alice);
        let (session_id, item_id) = fx.start(request);

        // The only item: count 1 completes and alice's count 2 opens in the same write.
        let view = fx
            .service
            .submit_count(fx.tenant_id, session_id, fx.alice, item_id, dec!(48), None)
            .unwrap();
        assert!(view.is_counted);
        assert_eq!(view.my_count, Some(dec!(48)));

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        assert_eq!(session.status(), SessionStatus::Count2InProgress);
        let open = fx
            .service
            .counter_item(fx.tenant_id, session_id, item_id, fx.alice)
            .unwrap();
        assert!(!open.is_counted);

        let view = fx
            .service
            .submit_count(fx.tenant_id, session_id, fx.alice, item_id, dec!(47), None)
            .unwrap();
        assert_eq!(view.my_count, Some(dec!(47)));
        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        let item = session.item(item_id).unwrap();
        assert_eq!(item.entry(CountNumber::Second).map(|e| e.quantity), Some(dec!(47)));
    }

    #[test]
    fn simultaneous_last_submissions_complete_the_phase_once() {
        let fx = setup();
        let mut request = fx.request(true, false);
        request.scope_filters.product_ids = vec![fx.product_id, fx.extra_product_id];
        let session = fx
            .service
            .create_session(fx.tenant_id, fx.supervisor, request)
            .unwrap();
        let session_id = session.id_typed();
        let session = fx
            .service
            .activate_session(fx.tenant_id, session_id, fx.supervisor)
            .unwrap();
        let items: Vec<CountableItemId> = session.items().iter().map(|i| i.item_id()).collect();
        assert_eq!(items.len(), 2);

        fx.count(session_id, fx.alice, items[0], dec!(5));
        fx.count(session_id, fx.bob, items[1], dec!(5));

        let barrier = std::sync::Barrier::new(2);
        let (alice_result, bob_result) = std::thread::scope(|scope| {
            let alice = scope.spawn(|| {
                barrier.wait();
                fx.service
                    .submit_count(fx.tenant_id, session_id, fx.alice, items[1], dec!(5), None)
            });
            let bob = scope.spawn(|| {
                barrier.wait();
                fx.service
                    .submit_count(fx.tenant_id, session_id, fx.bob, items[0], dec!(5), None)
            });
            (alice.join().unwrap(), bob.join().unwrap())
        });
        assert!(alice_result.is_ok(), "alice: {alice_result:?}");
        assert!(bob_result.is_ok(), "bob: {bob_result:?}");

        let completions = fx
            .service
            .dispatcher()
            .store()
            .tenant_events(fx.tenant_id)
            .unwrap()
            .iter()
            .filter_map(|e| serde_json::from_value::<CountingEvent>(e.payload.clone()).ok())
            .filter(|e| {
                matches!(e, CountingEvent::StatusChanged(c) if c.to == SessionStatus::Count1Completed)
            })
            .count();
        assert_eq!(completions, 1);

        let session = fx.service.session(fx.tenant_id, session_id).unwrap();
        assert_eq!(session.status(), SessionStatus::PendingReview);
    }

    #[test]
    fn parallel_mode_rejects_a_shared_counter() {
        let fx = setup();
        let mut request = fx.request(true, false);
        request.count_2_user = Some(fx.alice);

        let err = fx
            .service
            .create_session(fx.tenant_id, fx.supervisor, request)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::SequentialModeRequired)));
    }

    #[test]
    fn counter_views_never_carry_theoretical_or_other_counts() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(true, false));

        fx.count(session_id, fx.alice, item_id, dec!(48));
        let mine = fx
            .service
            .submit_count(fx.tenant_id, session_id, fx.bob, item_id, dec!(47), None)
            .unwrap();
        assert_eq!(mine.my_count, Some(dec!(47)));

        let json = serde_json::to_string(&mine).unwrap();
        assert!(!json.contains("theoretical"));
        assert!(!json.contains("variance"));
        assert!(!json.contains("final_qty"));
        assert!(!json.contains("count_1"));

        let session_view = fx
            .service
            .counter_session(fx.tenant_id, session_id, fx.alice)
            .unwrap();
        let json = serde_json::to_string(&session_view).unwrap();
        assert!(!json.contains("theoretical"));
        assert!(!json.contains("variance"));
    }

    #[test]
    fn snapshot_ignores_ledger_movements_after_activation() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));

        fx.ledger
            .record_movement(fx.tenant_id, fx.product_id, None, fx.location_id, dec!(10));
        fx.count(session_id, fx.alice, item_id, dec!(50));

        let view = fx.service.reconciliation(fx.tenant_id, session_id).unwrap();
        assert_eq!(view.items[0].theoretical_qty, dec!(50));
        assert_eq!(view.items[0].resolution_method, ResolutionMethod::AutoAllMatch);
    }

    #[test]
    fn barcode_lookup_finds_items_in_scope_only() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));

        let hit = fx
            .service
            .lookup_barcode(fx.tenant_id, session_id, fx.alice, "4006381333931")
            .unwrap();
        assert!(hit.found);
        assert_eq!(hit.item.map(|i| i.item_id), Some(item_id));

        let miss = fx
            .service
            .lookup_barcode(fx.tenant_id, session_id, fx.alice, "4006381333948")
            .unwrap();
        assert!(!miss.found);
    }

    #[test]
    fn unexpected_items_join_full_inventory_sessions() {
        let fx = setup();
        let mut request = fx.request(false, false);
        request.scope_type = ScopeType::FullInventory;
        request.scope_filters = ScopeFilters::default();
        request.allow_unexpected_items = true;
        let (session_id, item_id) = fx.start(request);

        let found = fx
            .service
            .register_unexpected_item(
                fx.tenant_id,
                session_id,
                fx.alice,
                UnexpectedItemRequest {
                    product_id: fx.extra_product_id,
                    variant_id: None,
                    location_id: fx.location_id,
                    quantity: dec!(3),
                    notes: Some("behind the pallet".into()),
                },
            )
            .unwrap();
        assert_eq!(found.my_count, Some(dec!(3)));

        fx.count(session_id, fx.alice, item_id, dec!(50));

        let view = fx.service.reconciliation(fx.tenant_id, session_id).unwrap();
        assert_eq!(view.summary.total_items, 2);
        let extra = view
            .items
            .iter()
            .find(|i| i.item_id == found.item_id)
            .unwrap();
        assert!(extra.unexpected);
        assert_eq!(extra.theoretical_qty, dec!(0));
        assert_eq!(extra.flag_reason, Some(FlagReason::CountMismatch));
    }

    #[test]
    fn cancelled_session_rejects_counts() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));

        fx.service
            .cancel_session(fx.tenant_id, session_id, "power outage".into(), fx.supervisor)
            .unwrap();
        let err = fx
            .service
            .submit_count(fx.tenant_id, session_id, fx.alice, item_id, dec!(50), None)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::SessionCancelled)));

        let view = fx.service.reconciliation(fx.tenant_id, session_id).unwrap();
        assert_eq!(view.summary.cancellation_reason.as_deref(), Some("power outage"));
    }

    #[test]
    fn terminal_sessions_release_their_command_lock() {
        let fx = setup();
        let (finalized, item_id) = fx.start(fx.request(false, false));
        let (cancelled, _) = fx.start(fx.request(false, false));
        assert_eq!(fx.service.tracked_session_locks(), 2);

        fx.count(finalized, fx.alice, item_id, dec!(50));
        fx.service
            .finalize_session(fx.tenant_id, finalized, fx.supervisor)
            .unwrap();
        assert_eq!(fx.service.tracked_session_locks(), 1);

        fx.service
            .cancel_session(fx.tenant_id, cancelled, "wrong warehouse".into(), fx.supervisor)
            .unwrap();
        assert_eq!(fx.service.tracked_session_locks(), 0);

        // Late writes are rejected without leaving a lock behind.
        let err = fx
            .service
            .submit_count(fx.tenant_id, finalized, fx.alice, item_id, dec!(51), None)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::SessionFinalized)));
        assert_eq!(fx.service.tracked_session_locks(), 0);
    }

    #[test]
    fn sessions_are_invisible_to_other_tenants() {
        let fx = setup();
        let (session_id, _) = fx.start(fx.request(false, false));

        let err = fx.service.session(TenantId::new(), session_id).unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::NotFound)));
        let err = fx
            .service
            .reconciliation(TenantId::new(), session_id)
            .unwrap_err();
        assert!(matches!(err.counting(), Some(CountingError::NotFound)));
    }

    #[test]
    fn projection_tracks_status_and_progress() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));
        wait_for_processing();

        let row = fx.projection.get(fx.tenant_id, &session_id).unwrap();
        assert_eq!(row.status, SessionStatus::Count1InProgress);
        assert_eq!(row.total_items, 1);
        assert_eq!(row.resolved_items, 0);

        fx.count(session_id, fx.alice, item_id, dec!(50));
        wait_for_processing();

        let row = fx.projection.get(fx.tenant_id, &session_id).unwrap();
        assert_eq!(row.status, SessionStatus::PendingReview);
        assert_eq!(row.resolved_items, 1);
        assert_eq!(fx.projection.list(fx.tenant_id).len(), 1);
        assert!(fx.projection.list(TenantId::new()).is_empty());
    }

    #[test]
    fn csv_export_lists_the_item() {
        let fx = setup();
        let (session_id, item_id) = fx.start(fx.request(false, false));
        fx.count(session_id, fx.alice, item_id, dec!(47));

        let bytes = fx
            .service
            .export_report(fx.tenant_id, session_id, ReportFormat::Csv)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("section,metric,value"));
        assert!(text.contains("SKU-1"));
    }
}
