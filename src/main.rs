use std::{process, sync::Arc, time::Duration};

use kasirpro::{
    application::{
        collection::{CollectionState, CollectionView},
        error::AppError,
        history::{HistoryFilters, HistoryQuery, PageWindow},
        hub::CollectionHub,
        pagination::PageRequest,
        repos::BackendPorts,
    },
    cache::{CacheConfig, CollectionScope, RawChange},
    config::{self, BackendKind, BackendSettings},
    domain::{
        entities::{
            CustomerRecord, NewCustomer, NewOrder, OrderRecord, ProductRecord, Record,
            ServiceRecord,
        },
        types::{BusinessType, EntityType, OrderStatus},
    },
    infra::{error::InfraError, memory::InMemoryBackend, rest::RestBackend, telemetry},
};
use serde::Serialize;
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(config::DemoArgs {
            orders: 3,
            daily_limit: None,
        }));

    telemetry::init(&settings.logging).map_err(AppError::from)?;
    let cache = CacheConfig::from(&settings.cache);

    match command {
        config::Command::List(args) => {
            let hub = CollectionHub::new(connect(&settings.backend)?, cache);
            run_list(&hub, args).await
        }
        config::Command::Watch(args) => {
            let hub = CollectionHub::new(connect(&settings.backend)?, cache);
            run_watch(&hub, args).await
        }
        config::Command::History(args) => {
            let hub = CollectionHub::new(connect(&settings.backend)?, cache);
            run_history(&hub, args).await
        }
        config::Command::Demo(args) => run_demo(cache, args).await,
    }
}

fn connect(backend: &BackendSettings) -> Result<BackendPorts, AppError> {
    match backend.kind {
        BackendKind::Memory => {
            info!("Using the in-memory backend");
            Ok(BackendPorts::from_backend(Arc::new(InMemoryBackend::default())))
        }
        BackendKind::Rest => {
            let url = backend
                .url
                .as_deref()
                .ok_or_else(|| InfraError::configuration("backend.url is not set"))?;
            let api_key = backend
                .api_key
                .as_deref()
                .ok_or_else(|| InfraError::configuration("backend.api_key is not set"))?;
            let rest = RestBackend::new(
                url,
                api_key,
                backend.access_token.as_deref(),
                backend.timeout,
            )?;
            info!(url, "Using the REST backend");
            Ok(BackendPorts::from_backend(Arc::new(rest)))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{text}");
    Ok(())
}

fn scope_of(args: &config::ScopeArgs) -> CollectionScope {
    CollectionScope::new(args.owner, args.business_type)
}

async fn run_list(hub: &CollectionHub, args: config::ListArgs) -> Result<(), AppError> {
    let scope = scope_of(&args.scope);
    match args.entity {
        EntityType::Orders => list_one(hub.view::<OrderRecord>(scope), args.force).await,
        EntityType::Customers => list_one(hub.view::<CustomerRecord>(scope), args.force).await,
        EntityType::Services => list_one(hub.view::<ServiceRecord>(scope), args.force).await,
        EntityType::Products => list_one(hub.view::<ProductRecord>(scope), args.force).await,
    }
}

async fn list_one<R: Record>(view: CollectionView<R>, force: bool) -> Result<(), AppError> {
    let mut rows = view.mount().await?;
    if force {
        rows = view.refresh().await?;
    }
    print_json(rows.as_slice())?;
    view.unmount();
    Ok(())
}

async fn run_watch(hub: &CollectionHub, args: config::WatchArgs) -> Result<(), AppError> {
    let scope = scope_of(&args.scope);
    let limit = args.for_seconds.map(Duration::from_secs);
    match args.entity {
        EntityType::Orders => watch_one(hub.view::<OrderRecord>(scope), limit).await,
        EntityType::Customers => watch_one(hub.view::<CustomerRecord>(scope), limit).await,
        EntityType::Services => watch_one(hub.view::<ServiceRecord>(scope), limit).await,
        EntityType::Products => watch_one(hub.view::<ProductRecord>(scope), limit).await,
    }
}

async fn watch_one<R: Record>(view: CollectionView<R>, limit: Option<Duration>) -> Result<(), AppError> {
    let mut states = view.subscribe();
    view.mount().await?;
    report_state(&view.state());

    let follow = async {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            report_state(&state);
        }
    };

    match limit {
        Some(limit) => {
            tokio::select! {
                _ = follow => {}
                _ = tokio::time::sleep(limit) => {}
            }
        }
        None => {
            tokio::select! {
                _ = follow => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(InfraError::from)?;
                }
            }
        }
    }

    view.unmount();
    Ok(())
}

fn report_state<R: Record>(state: &CollectionState<R>) {
    match &state.error {
        Some(error) => info!(
            phase = ?state.phase,
            rows = state.data.len(),
            error = %error,
            "Collection state"
        ),
        None => info!(
            phase = ?state.phase,
            rows = state.data.len(),
            loading = state.loading,
            "Collection state"
        ),
    }
}

async fn run_history(hub: &CollectionHub, args: config::HistoryArgs) -> Result<(), AppError> {
    let page = PageRequest::new(args.page, args.page_size)
        .map_err(|err| AppError::validation(err.to_string()))?;
    let query = HistoryQuery {
        filters: HistoryFilters {
            status: args.status,
            search: args.search,
        },
        ..HistoryQuery::default()
    }
    .with_page(page);

    let history = hub.order_history(args.scope.owner, args.scope.business_type, query);
    let window = history.mount().await?;
    print_window(&window)?;
    history.unmount();
    Ok(())
}

fn print_window(window: &PageWindow<OrderRecord>) -> Result<(), AppError> {
    print_json(&json!({
        "page": window.page.page(),
        "page_size": window.page.page_size(),
        "total_count": window.total_count,
        "has_more": window.has_more,
        "rows": window.rows,
    }))
}

/// Scripted session: mount views, create orders, push an outside change and
/// page through history, all against process-local tables.
async fn run_demo(cache: CacheConfig, args: config::DemoArgs) -> Result<(), AppError> {
    let backend = Arc::new(InMemoryBackend::default());
    backend.set_daily_limit(args.daily_limit);
    let hub = CollectionHub::new(BackendPorts::from_backend(Arc::clone(&backend)), cache);
    let owner = Uuid::new_v4();
    info!(%owner, "Demo session started");

    let customers = hub.customers(owner, Some(BusinessType::Laundry));
    customers.mount().await?;
    let customer = customers
        .create(NewCustomer {
            name: "Sari".to_string(),
            phone: Some("0812-0000-0001".to_string()),
            address: None,
        })
        .await?;
    info!(customers = customers.data().len(), "Customer added");

    let orders = hub.orders(owner, BusinessType::Laundry);
    orders.view().mount().await?;
    for index in 0..args.orders {
        let draft = NewOrder {
            customer_id: Some(customer.id),
            ..NewOrder::new(customer.name.clone(), 25_000 + i64::from(index) * 5_000, 0)
        };
        match orders.create(draft).await {
            Ok(order) => info!(order_number = %order.order_number, "Order created"),
            Err(err) => {
                info!(error = %err, "Order refused");
                break;
            }
        }
    }
    info!(orders = orders.view().data().len(), "Orders after creation");

    // A change made by another session arrives through the change feed.
    if let Some(first) = orders.view().data().first() {
        let mut changed = serde_json::to_value(first)
            .map_err(|err| AppError::unexpected(err.to_string()))?;
        changed["status"] = json!(OrderStatus::Processing);
        backend.emit("orders", RawChange::update(json!({ "id": first.id }), changed));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let history = hub.order_history(
        owner,
        Some(BusinessType::Laundry),
        HistoryQuery::default().with_page(
            PageRequest::new(1, 2).map_err(|err| AppError::validation(err.to_string()))?,
        ),
    );
    let window = history.mount().await?;
    print_window(&window)?;

    if let Some(order) = window.rows.first() {
        history.update_status(order.id, OrderStatus::Completed).await?;
        if let Some(window) = history.window() {
            print_window(&window)?;
        }
    }

    history.unmount();
    orders.view().unmount();
    customers.unmount();
    info!(
        cached = hub.store().len(),
        selects = backend.select_calls("orders"),
        "Demo session finished"
    );
    Ok(())
}
