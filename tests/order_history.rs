use std::sync::Arc;
use std::time::Duration;

use kasirpro::application::history::{HistoryFilters, HistoryQuery, OrderHistory};
use kasirpro::application::hub::CollectionHub;
use kasirpro::application::pagination::PageRequest;
use kasirpro::application::repos::BackendPorts;
use kasirpro::cache::{CacheConfig, ManualClock, RawChange};
use kasirpro::domain::types::{BusinessType, OrderStatus};
use kasirpro::infra::memory::InMemoryBackend;
use serde_json::{Value, json};
use uuid::Uuid;

fn owner() -> Uuid {
    Uuid::from_u128(0xA11CE)
}

fn order_row(id: u128, customer: &str, status: &str, minute: u32) -> Value {
    let stamp = format!("2026-03-01T08:{minute:02}:00Z");
    json!({
        "id": Uuid::from_u128(id).to_string(),
        "user_id": owner().to_string(),
        "business_type": "laundry",
        "order_number": format!("LDR-{id:05}"),
        "customer_name": customer,
        "status": status,
        "payment_status": "unpaid",
        "total_amount": 10_000,
        "created_at": stamp,
        "updated_at": stamp,
    })
}

fn setup() -> (Arc<InMemoryBackend>, CollectionHub) {
    let (backend, hub, _clock) = setup_with_clock();
    (backend, hub)
}

fn setup_with_clock() -> (Arc<InMemoryBackend>, CollectionHub, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let backend = Arc::new(InMemoryBackend::new(clock.clone()));
    backend.seed(
        "orders",
        [
            order_row(1, "Sari", "pending", 1),
            order_row(2, "Budi", "ready", 2),
            order_row(3, "Sarah", "pending", 3),
            order_row(4, "Andi", "completed", 4),
            order_row(5, "Citra", "pending", 5),
        ],
    );
    let config = CacheConfig {
        reconnect_interval_ms: 20,
        ..Default::default()
    };
    let hub = CollectionHub::with_clock(
        BackendPorts::from_backend(backend.clone()),
        config,
        clock.clone(),
    );
    (backend, hub, clock)
}

fn history(hub: &CollectionHub, query: HistoryQuery) -> OrderHistory {
    hub.order_history(owner(), Some(BusinessType::Laundry), query)
}

fn paged(page: u32, size: u32) -> HistoryQuery {
    HistoryQuery::default().with_page(PageRequest::new(page, size).unwrap())
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pages_report_total_and_has_more() {
    let (_backend, hub) = setup();
    let history = history(&hub, paged(1, 2));

    let first = history.mount().await.unwrap();
    assert_eq!(first.total_count, 5);
    assert!(first.has_more);
    let names: Vec<_> = first.rows.iter().map(|row| row.customer_name.as_str()).collect();
    assert_eq!(names, ["Citra", "Andi"], "newest first");

    let last = history.go_to_page(3).await.unwrap();
    assert_eq!(last.rows.len(), 1);
    assert_eq!(last.rows[0].customer_name, "Sari");
    assert!(!last.has_more);
    assert_eq!(history.current_query().page.page(), 3);
    assert_eq!(history.window().unwrap().page.page(), 3);

    assert!(history.go_to_page(0).await.is_err());
}

#[tokio::test]
async fn each_page_is_cached_under_its_own_key() {
    let (backend, hub) = setup();
    let history = history(&hub, paged(1, 2));

    history.mount().await.unwrap();
    history.go_to_page(2).await.unwrap();
    assert_eq!(backend.select_calls("orders"), 2);
    assert_eq!(hub.store().len(), 2);

    let back = history.go_to_page(1).await.unwrap();
    assert_eq!(back.rows[0].customer_name, "Citra");
    assert_eq!(backend.select_calls("orders"), 2, "page one served from cache");

    history.refresh().await.unwrap();
    assert_eq!(backend.select_calls("orders"), 3);
    assert_eq!(backend.count_calls("orders"), 3);
}

#[tokio::test]
async fn status_and_search_filters_narrow_the_count() {
    let (_backend, hub) = setup();
    let history = history(&hub, paged(1, 10));
    history.mount().await.unwrap();

    let pending = history
        .query(HistoryQuery {
            filters: HistoryFilters {
                status: Some(OrderStatus::Pending),
                search: None,
            },
            ..paged(1, 10)
        })
        .await
        .unwrap();
    assert_eq!(pending.total_count, 3);
    assert!(pending.rows.iter().all(|row| row.status == OrderStatus::Pending));

    let searched = history
        .query(HistoryQuery {
            filters: HistoryFilters {
                status: Some(OrderStatus::Pending),
                search: Some(" sar ".into()),
            },
            ..paged(1, 10)
        })
        .await
        .unwrap();
    let names: Vec<_> = searched.rows.iter().map(|row| row.customer_name.as_str()).collect();
    assert_eq!(names, ["Sarah", "Sari"]);
    assert_eq!(searched.total_count, 2);
    assert!(!searched.has_more);
}

#[tokio::test]
async fn status_update_drops_every_window_and_reruns_the_page() {
    let (backend, hub) = setup();
    let history = history(
        &hub,
        HistoryQuery {
            filters: HistoryFilters {
                status: Some(OrderStatus::Pending),
                search: None,
            },
            ..paged(1, 2)
        },
    );
    history.mount().await.unwrap();
    history.go_to_page(2).await.unwrap();
    history.go_to_page(1).await.unwrap();
    let selects = backend.select_calls("orders");

    let updated = history
        .update_status(Uuid::from_u128(5), OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(updated.status, OrderStatus::Completed);
    assert!(backend.select_calls("orders") > selects);

    let window = history.window().unwrap();
    assert_eq!(window.total_count, 2);
    assert!(window.rows.iter().all(|row| row.customer_name != "Citra"));
    eventually("only the re-run page cached", || hub.store().len() == 1).await;
}

#[tokio::test]
async fn failed_status_update_keeps_the_window() {
    let (backend, hub) = setup();
    let history = history(&hub, paged(1, 2));
    let before = history.mount().await.unwrap();

    backend.fail_mutations("orders", true);
    let result = history
        .update_status(Uuid::from_u128(5), OrderStatus::Completed)
        .await;

    assert!(result.is_err());
    assert!(Arc::ptr_eq(&history.window().unwrap(), &before));
    assert_eq!(backend.select_calls("orders"), 1);
}

#[tokio::test]
async fn order_changes_rerun_the_current_page() {
    let (backend, hub) = setup();
    let history = history(&hub, paged(1, 2));
    history.mount().await.unwrap();
    eventually("subscription", || backend.subscribe_calls() == 1).await;

    let fresh = order_row(6, "Dewi", "pending", 6);
    backend.seed("orders", [fresh.clone()]);
    backend.emit("orders", RawChange::insert(fresh));

    eventually("page re-run", || {
        history
            .window()
            .is_some_and(|window| window.total_count == 6)
    })
    .await;
    assert_eq!(history.window().unwrap().rows[0].customer_name, "Dewi");
}

#[tokio::test]
async fn expired_window_is_rerun_while_feed_is_down() {
    let (backend, hub, clock) = setup_with_clock();
    backend.fail_subscriptions(true);
    let history = history(&hub, paged(1, 2));
    history.mount().await.unwrap();
    eventually("retries", || backend.subscribe_calls() >= 3).await;
    assert_eq!(backend.select_calls("orders"), 1);

    backend.seed("orders", [order_row(6, "Dewi", "pending", 6)]);
    clock.advance(Duration::from_secs(6));
    eventually("window re-run", || {
        history
            .window()
            .is_some_and(|window| window.total_count == 6)
    })
    .await;
    assert_eq!(history.window().unwrap().rows[0].customer_name, "Dewi");
}

#[tokio::test]
async fn unmount_during_load_publishes_nothing() {
    let (backend, hub) = setup();
    let history = history(&hub, paged(1, 2));
    backend.pause_reads();

    let (result, ()) = tokio::join!(history.mount(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        history.unmount();
        backend.resume_reads();
    });

    assert!(result.is_ok(), "the load itself completes");
    assert!(history.window().is_none());
    assert!(!history.state().loading);
}
