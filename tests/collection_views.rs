use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kasirpro::application::collection::Phase;
use kasirpro::application::error::MutationError;
use kasirpro::application::hub::CollectionHub;
use kasirpro::application::repos::BackendPorts;
use kasirpro::cache::{CacheConfig, ManualClock};
use kasirpro::domain::entities::{CustomerPatch, CustomerRecord, NewCustomer, NewProduct};
use kasirpro::domain::types::BusinessType;
use kasirpro::infra::memory::InMemoryBackend;
use serde_json::{Value, json};
use uuid::Uuid;

const EPOCH: &str = "1970-01-01T00:00:00Z";

fn owner() -> Uuid {
    Uuid::from_u128(0xA11CE)
}

fn customer_row(id: u128, business_type: &str, name: &str) -> Value {
    json!({
        "id": Uuid::from_u128(id).to_string(),
        "user_id": owner().to_string(),
        "business_type": business_type,
        "name": name,
        "created_at": EPOCH,
    })
}

struct Fixture {
    backend: Arc<InMemoryBackend>,
    clock: Arc<ManualClock>,
    hub: CollectionHub,
}

fn fixture_with(config: CacheConfig) -> Fixture {
    let clock = Arc::new(ManualClock::at_epoch());
    let backend = Arc::new(InMemoryBackend::new(clock.clone()));
    backend.seed(
        "customers",
        [
            customer_row(1, "laundry", "Sari"),
            customer_row(2, "laundry", "Andi"),
            customer_row(3, "warung", "Budi"),
        ],
    );
    let hub = CollectionHub::with_clock(
        BackendPorts::from_backend(backend.clone()),
        config,
        clock.clone(),
    );
    Fixture {
        backend,
        clock,
        hub,
    }
}

fn fixture() -> Fixture {
    fixture_with(CacheConfig {
        reconnect_interval_ms: 20,
        ..Default::default()
    })
}

fn names(rows: &[CustomerRecord]) -> Vec<&str> {
    rows.iter().map(|row| row.name.as_str()).collect()
}

#[tokio::test]
async fn mount_loads_scoped_collection_and_subscribes() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    assert_eq!(view.phase(), Phase::Empty);

    let rows = view.mount().await.unwrap();

    assert_eq!(names(&rows), vec!["Andi", "Sari"]);
    assert_eq!(view.phase(), Phase::Ready);
    assert!(!view.loading());
    assert!(view.error().is_none());
    assert!(view.is_subscribed());
    assert_eq!(view.key().as_str(), format!("customers_laundry:{}", owner()));
}

#[tokio::test]
async fn concurrent_mounts_share_one_fetch() {
    let fx = fixture();
    fx.backend.set_read_latency(Duration::from_millis(20));
    let first = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    let second = fx.hub.customers(owner(), Some(BusinessType::Laundry));

    let (a, b) = tokio::join!(first.mount(), second.mount());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b), "both callers get the same snapshot");
    assert_eq!(fx.backend.select_calls("customers"), 1);
}

#[tokio::test]
async fn concurrent_mounts_share_one_failure() {
    let fx = fixture();
    fx.backend.set_read_latency(Duration::from_millis(20));
    fx.backend.fail_reads("customers", true);
    let first = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    let second = fx.hub.customers(owner(), Some(BusinessType::Laundry));

    let (a, b) = tokio::join!(first.mount(), second.mount());

    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a, b);
    assert_eq!(fx.backend.select_calls("customers"), 1);
    assert_eq!(first.phase(), Phase::Error);
    assert_eq!(first.error(), Some(a));
    assert_eq!(fx.hub.coordinator().in_flight_count(), 0);
}

#[tokio::test]
async fn rapid_invalidations_collapse_into_one_fetch_at_a_time() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();
    let before = fx.backend.select_calls("customers");

    fx.backend.set_read_latency(Duration::from_millis(20));
    fx.backend.seed("customers", [customer_row(4, "laundry", "Citra")]);

    let results = join_all((0..5).map(|_| view.invalidate_and_refresh())).await;

    // One fetch that every call joined, then one more started after the
    // last invalidation.
    assert_eq!(fx.backend.select_calls("customers") - before, 2);
    for result in &results {
        assert_eq!(names(result.as_ref().unwrap()), vec!["Andi", "Citra", "Sari"]);
    }
    let cached = fx
        .hub
        .store()
        .get::<Vec<CustomerRecord>>(&view.key())
        .unwrap();
    assert_eq!(names(&cached), vec!["Andi", "Citra", "Sari"]);
    assert_eq!(view.phase(), Phase::Ready);
    assert_eq!(fx.hub.coordinator().in_flight_count(), 0);
}

#[tokio::test]
async fn failed_update_leaves_cache_untouched() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();
    let entry_before = fx.hub.store().entry(&view.key()).unwrap();
    let data_before = view.data();
    let selects_before = fx.backend.select_calls("customers");

    fx.backend.fail_mutations("customers", true);
    let err = view
        .update(
            Uuid::from_u128(1),
            CustomerPatch {
                name: Some("Renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Backend { operation: "update", .. }));
    let entry_after = fx.hub.store().entry(&view.key()).unwrap();
    assert!(entry_after.same_snapshot(&entry_before));
    assert_eq!(entry_after.stored_at, entry_before.stored_at);
    assert!(Arc::ptr_eq(&view.data(), &data_before));
    assert_eq!(fx.backend.select_calls("customers"), selects_before);
}

#[tokio::test]
async fn failed_delete_keeps_row_visible() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();

    fx.backend.fail_mutations("customers", true);
    assert!(view.delete(Uuid::from_u128(1)).await.is_err());
    assert_eq!(names(&view.data()), vec!["Andi", "Sari"]);

    fx.backend.fail_mutations("customers", false);
    view.delete(Uuid::from_u128(1)).await.unwrap();
    assert_eq!(names(&view.data()), vec!["Andi"]);
}

#[tokio::test]
async fn create_refreshes_with_backend_assigned_id() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();

    let created = view
        .create(NewCustomer {
            name: "X".into(),
            phone: None,
            address: None,
        })
        .await
        .unwrap();

    assert_eq!(created.business_type, BusinessType::Laundry);
    assert_eq!(created.user_id, owner());
    let cached = fx
        .hub
        .store()
        .get::<Vec<CustomerRecord>>(&view.key())
        .unwrap();
    assert!(cached.iter().any(|row| row.id == created.id && row.name == "X"));
    assert!(view.data().iter().any(|row| row.id == created.id));
    assert_eq!(fx.backend.select_calls("customers"), 2);
}

#[tokio::test]
async fn invalid_draft_never_reaches_backend() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();

    let err = view
        .create(NewCustomer {
            name: "   ".into(),
            phone: None,
            address: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Domain(_)));
    assert_eq!(fx.backend.mutation_calls("customers"), 0);
}

#[tokio::test]
async fn unmount_during_load_drops_the_result() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    fx.backend.pause_reads();

    let pending = view.mount();
    tokio::pin!(pending);
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err(),
        "load should still be waiting on the backend"
    );
    assert_eq!(view.phase(), Phase::Loading);

    view.unmount();
    assert!(!view.is_subscribed());
    fx.backend.resume_reads();

    let outcome = pending.await;
    assert!(outcome.is_ok(), "late results are not errors");
    assert!(view.data().is_empty());
    assert_ne!(view.phase(), Phase::Ready);
    // The shared fetch still completed for other readers of the key.
    assert!(fx.hub.store().entry(&view.key()).is_some());
}

#[tokio::test]
async fn dropping_a_view_mid_load_does_not_cancel_the_fetch() {
    let fx = fixture();
    fx.backend.set_read_latency(Duration::from_millis(20));
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    let key = view.key();

    let _ = tokio::time::timeout(Duration::from_millis(5), view.mount()).await;
    drop(view);

    let coordinator = fx.hub.coordinator().clone();
    for _ in 0..100 {
        if coordinator.in_flight_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(coordinator.in_flight_count(), 0);
    assert!(fx.hub.store().entry(&key).is_some());
}

#[tokio::test]
async fn fresh_snapshot_is_served_and_older_one_refreshed_silently() {
    let fx = fixture();
    let first = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    first.mount().await.unwrap();
    first.unmount();

    fx.clock.advance(Duration::from_secs(5));
    let second = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    second.mount().await.unwrap();
    assert_eq!(fx.backend.select_calls("customers"), 1, "fresh snapshot reused");
    second.unmount();

    fx.clock.advance(Duration::from_secs(10));
    let third = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    let mut states = third.subscribe();
    let rows = third.mount().await.unwrap();

    assert_eq!(fx.backend.select_calls("customers"), 2, "stale snapshot refreshed");
    assert_eq!(names(&rows), vec!["Andi", "Sari"]);
    assert_eq!(third.phase(), Phase::Ready);
    assert!(!third.loading());
    // The silent refresh never raised the loading flag.
    assert!(!states.borrow_and_update().loading);
}

#[tokio::test]
async fn expired_snapshot_is_loaded_again() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();
    view.unmount();

    fx.clock.advance(Duration::from_secs(61));
    let again = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    again.mount().await.unwrap();
    assert_eq!(fx.backend.select_calls("customers"), 2);
}

#[tokio::test]
async fn set_scope_switches_partition() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();

    let rows = view
        .set_scope(owner(), Some(BusinessType::Warung))
        .await
        .unwrap();

    assert_eq!(names(&rows), vec!["Budi"]);
    assert_eq!(view.scope().partition, Some(BusinessType::Warung));
    assert_eq!(view.key().as_str(), format!("customers_warung:{}", owner()));
    assert!(view.is_subscribed());
    assert_eq!(fx.backend.subscribe_calls(), 2);
}

#[tokio::test]
async fn unpartitioned_view_sees_every_partition() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), None);
    let rows = view.mount().await.unwrap();
    assert_eq!(names(&rows), vec!["Andi", "Budi", "Sari"]);
    assert_eq!(view.key().as_str(), format!("customers:{}", owner()));
}

#[tokio::test]
async fn products_ignore_partition() {
    let fx = fixture();
    let products = fx.hub.products(owner());
    products.mount().await.unwrap();

    let created = products
        .create(NewProduct {
            name: "Sabun".into(),
            sku: Some("SB-01".into()),
            price: 4_500,
            stock: 12,
        })
        .await
        .unwrap();

    assert_eq!(products.key().as_str(), format!("products:{}", owner()));
    assert_eq!(products.data().len(), 1);
    assert_eq!(products.data()[0].id, created.id);
    let stored = fx.backend.rows("products");
    assert!(stored[0].get("business_type").is_none());
}

#[tokio::test]
async fn disabled_cache_always_reads_backend() {
    let fx = fixture_with(CacheConfig {
        enabled: false,
        ..Default::default()
    });
    for _ in 0..3 {
        let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
        view.mount().await.unwrap();
    }
    assert_eq!(fx.backend.select_calls("customers"), 3);
}

#[tokio::test]
async fn refresh_signals_loading_and_recovers_from_error() {
    let fx = fixture();
    let view = fx.hub.customers(owner(), Some(BusinessType::Laundry));
    view.mount().await.unwrap();

    fx.backend.fail_reads("customers", true);
    assert!(view.refresh().await.is_err());
    assert_eq!(view.phase(), Phase::Error);
    assert_eq!(names(&view.data()), vec!["Andi", "Sari"], "last data kept on error");

    fx.backend.fail_reads("customers", false);
    view.refresh().await.unwrap();
    assert_eq!(view.phase(), Phase::Ready);
    assert!(view.error().is_none());
}
