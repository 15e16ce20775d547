//! In-process backend holding JSON rows per table.
//!
//! Implements every port with the same owner scoping the hosted backend
//! enforces, pushes change events over a broadcast channel, and runs the two
//! order procedures. Reads can be delayed, paused or made to fail so cache
//! behaviour can be exercised deterministically.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::orders::{DAILY_LIMIT_RPC, ORDER_NUMBER_RPC};
use crate::application::repos::{
    ChangeFeed, ChangeStream, FilterOp, MutationRepo, OWNER_COLUMN, PARTITION_COLUMN, QueryRepo,
    RepoError, RpcClient, SelectQuery,
};
use crate::cache::lock::mutex_lock;
use crate::cache::{ChangeEvent, ChangeFilter, Clock, RawChange, SubscriptionError, SystemClock};
use crate::domain::types::BusinessType;

const SOURCE: &str = "infra::memory";
const FEED_CAPACITY: usize = 256;

type Row = Map<String, Value>;

#[derive(Debug, Clone)]
struct TableChange {
    table: String,
    change: RawChange,
}

#[derive(Default)]
struct Failures {
    reads: HashSet<String>,
    mutations: HashSet<String>,
    rpcs: HashSet<String>,
    subscriptions: bool,
}

pub struct InMemoryBackend {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    changes: broadcast::Sender<TableChange>,
    feed_generation: watch::Sender<u64>,
    read_gate: watch::Sender<bool>,
    read_latency: Mutex<Duration>,
    failures: Mutex<Failures>,
    calls: DashMap<String, usize>,
    daily_limit: Mutex<Option<usize>>,
    order_sequence: Mutex<HashMap<BusinessType, u64>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let (feed_generation, _) = watch::channel(0);
        let (read_gate, _) = watch::channel(true);
        Self {
            tables: Mutex::new(HashMap::new()),
            changes,
            feed_generation,
            read_gate,
            read_latency: Mutex::new(Duration::ZERO),
            failures: Mutex::new(Failures::default()),
            calls: DashMap::new(),
            daily_limit: Mutex::new(None),
            order_sequence: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Insert rows as they are, without change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut tables = mutex_lock(&self.tables, SOURCE, "seed");
        let stored = tables.entry(table.to_string()).or_default();
        stored.extend(rows.into_iter().filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        }));
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        mutex_lock(&self.tables, SOURCE, "rows")
            .get(table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Push a change notification for `table` to every subscriber.
    pub fn emit(&self, table: &str, change: RawChange) {
        let receivers = self
            .changes
            .send(TableChange {
                table: table.to_string(),
                change,
            })
            .unwrap_or(0);
        debug!(table, receivers, "Change emitted");
    }

    /// End every open change stream, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        self.feed_generation.send_modify(|generation| *generation += 1);
        info!("Change streams dropped");
    }

    pub fn set_read_latency(&self, latency: Duration) {
        *mutex_lock(&self.read_latency, SOURCE, "set_read_latency") = latency;
    }

    /// Hold every read until `resume_reads`.
    pub fn pause_reads(&self) {
        self.read_gate.send_replace(false);
    }

    pub fn resume_reads(&self) {
        self.read_gate.send_replace(true);
    }

    pub fn fail_reads(&self, table: &str, fail: bool) {
        toggle(&mut mutex_lock(&self.failures, SOURCE, "fail_reads").reads, table, fail);
    }

    pub fn fail_mutations(&self, table: &str, fail: bool) {
        toggle(
            &mut mutex_lock(&self.failures, SOURCE, "fail_mutations").mutations,
            table,
            fail,
        );
    }

    pub fn fail_rpc(&self, name: &str, fail: bool) {
        toggle(&mut mutex_lock(&self.failures, SOURCE, "fail_rpc").rpcs, name, fail);
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        mutex_lock(&self.failures, SOURCE, "fail_subscriptions").subscriptions = fail;
    }

    /// Orders allowed per owner, business type and UTC day. `None` is unlimited.
    pub fn set_daily_limit(&self, limit: Option<usize>) {
        *mutex_lock(&self.daily_limit, SOURCE, "set_daily_limit") = limit;
    }

    pub fn select_calls(&self, table: &str) -> usize {
        self.calls_for(&format!("select:{table}"))
    }

    pub fn count_calls(&self, table: &str) -> usize {
        self.calls_for(&format!("count:{table}"))
    }

    pub fn mutation_calls(&self, table: &str) -> usize {
        self.calls_for(&format!("mutate:{table}"))
    }

    pub fn rpc_calls(&self, name: &str) -> usize {
        self.calls_for(&format!("rpc:{name}"))
    }

    pub fn subscribe_calls(&self) -> usize {
        self.calls_for("subscribe")
    }

    fn calls_for(&self, key: &str) -> usize {
        self.calls.get(key).map(|count| *count).unwrap_or(0)
    }

    fn record_call(&self, key: String) {
        *self.calls.entry(key).or_insert(0) += 1;
    }

    async fn before_read(&self, table: &str) -> Result<(), RepoError> {
        let latency = *mutex_lock(&self.read_latency, SOURCE, "before_read");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut gate = self.read_gate.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = gate.wait_for(|open| *open).await;

        if mutex_lock(&self.failures, SOURCE, "before_read").reads.contains(table) {
            return Err(RepoError::from_persistence(format!("read of `{table}` refused")));
        }
        Ok(())
    }

    fn check_mutation(&self, table: &str) -> Result<(), RepoError> {
        self.record_call(format!("mutate:{table}"));
        if mutex_lock(&self.failures, SOURCE, "check_mutation")
            .mutations
            .contains(table)
        {
            return Err(RepoError::from_persistence(format!("write to `{table}` refused")));
        }
        Ok(())
    }

    fn matching_rows(&self, query: &SelectQuery) -> Vec<Row> {
        let tables = mutex_lock(&self.tables, SOURCE, "matching_rows");
        let Some(rows) = tables.get(query.table) else {
            return Vec::new();
        };
        rows.iter()
            .filter(|row| owned_by(row, query.owner))
            .filter(|row| {
                query.filters.iter().all(|filter| {
                    let actual = row.get(filter.column.as_ref()).map(value_text);
                    match (filter.op, actual) {
                        (_, None) => false,
                        (FilterOp::Eq, Some(actual)) => actual == filter.value,
                        (FilterOp::ILike, Some(actual)) => ilike(&actual, &filter.value),
                    }
                })
            })
            .cloned()
            .collect()
    }

    fn now_text(&self) -> Result<String, RepoError> {
        self.clock
            .now()
            .format(&Rfc3339)
            .map_err(RepoError::from_persistence)
    }

    fn check_daily_limit(&self, args: &Value) -> Result<Value, RepoError> {
        let owner = uuid_arg(args, "p_user_id")?;
        let business = business_arg(args)?;
        let limit = *mutex_lock(&self.daily_limit, SOURCE, "check_daily_limit");
        let today = self.clock.now().date();

        let used = {
            let tables = mutex_lock(&self.tables, SOURCE, "check_daily_limit");
            tables
                .get("orders")
                .map(|rows| {
                    rows.iter()
                        .filter(|row| owned_by(row, owner))
                        .filter(|row| {
                            row.get(PARTITION_COLUMN).and_then(Value::as_str)
                                == Some(business.as_str())
                        })
                        .filter(|row| {
                            row.get("created_at")
                                .and_then(Value::as_str)
                                .and_then(|text| OffsetDateTime::parse(text, &Rfc3339).ok())
                                .is_some_and(|created| created.date() == today)
                        })
                        .count()
                })
                .unwrap_or(0)
        };

        Ok(match limit {
            Some(limit) => json!({
                "allowed": used < limit,
                "remaining": limit.saturating_sub(used),
            }),
            None => json!({ "allowed": true }),
        })
    }

    fn generate_order_number(&self, args: &Value) -> Result<Value, RepoError> {
        let business = business_arg(args)?;
        let mut sequence = mutex_lock(&self.order_sequence, SOURCE, "generate_order_number");
        let next = sequence.entry(business).or_insert(0);
        *next += 1;
        let prefix = match business {
            BusinessType::Laundry => "LDR",
            BusinessType::Warung => "WRG",
            BusinessType::CuciMotor => "CCM",
        };
        Ok(Value::String(format!("{prefix}-{:05}", *next)))
    }
}

fn toggle(set: &mut HashSet<String>, name: &str, on: bool) {
    if on {
        set.insert(name.to_string());
    } else {
        set.remove(name);
    }
}

fn owned_by(row: &Row, owner: Uuid) -> bool {
    row.get(OWNER_COLUMN).and_then(Value::as_str) == Some(owner.to_string().as_str())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Case-insensitive match where `*` and `%` stand for any run of characters.
fn ilike(actual: &str, pattern: &str) -> bool {
    let actual = actual.to_lowercase();
    let pattern = pattern.to_lowercase().replace('%', "*");
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return actual == pattern;
    }

    let mut rest = actual.as_str();
    let last = parts.len() - 1;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
    }
    true
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> CmpOrdering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(a), Some(b)) => value_text(a).cmp(&value_text(b)),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

fn uuid_arg(args: &Value, name: &str) -> Result<Uuid, RepoError> {
    args.get(name)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| RepoError::invalid_input(format!("`{name}` must be a uuid")))
}

fn business_arg(args: &Value) -> Result<BusinessType, RepoError> {
    args.get("p_business_type")
        .and_then(Value::as_str)
        .ok_or_else(|| RepoError::invalid_input("`p_business_type` is required"))?
        .parse()
        .map_err(|err: crate::domain::error::DomainError| RepoError::invalid_input(err.to_string()))
}

fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[async_trait]
impl QueryRepo for InMemoryBackend {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, RepoError> {
        self.record_call(format!("select:{}", query.table));
        self.before_read(query.table).await?;

        let mut rows = self.matching_rows(query);
        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(order.column.as_ref()), b.get(order.column.as_ref()));
                if order.ascending { ordering } else { ordering.reverse() }
            });
        }
        let rows = match query.range {
            Some(range) => rows
                .into_iter()
                .skip(range.offset as usize)
                .take(range.limit as usize)
                .collect(),
            None => rows,
        };
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    async fn count(&self, query: &SelectQuery) -> Result<u64, RepoError> {
        self.record_call(format!("count:{}", query.table));
        self.before_read(query.table).await?;
        Ok(self.matching_rows(query).len() as u64)
    }
}

#[async_trait]
impl MutationRepo for InMemoryBackend {
    async fn insert(&self, table: &'static str, record: Value) -> Result<Value, RepoError> {
        self.check_mutation(table)?;
        let Value::Object(mut row) = record else {
            return Err(RepoError::invalid_input("inserted record must be an object"));
        };
        if row.get(OWNER_COLUMN).and_then(Value::as_str).is_none() {
            return Err(RepoError::Unauthorized {
                message: format!("`{OWNER_COLUMN}` is required"),
            });
        }

        let now = self.now_text()?;
        row.entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        row.entry("created_at")
            .or_insert_with(|| Value::String(now.clone()));
        if table == "orders" {
            row.entry("updated_at").or_insert_with(|| Value::String(now));
        }

        mutex_lock(&self.tables, SOURCE, "insert")
            .entry(table.to_string())
            .or_default()
            .push(row.clone());

        let stored = Value::Object(row);
        self.emit(table, RawChange::insert(stored.clone()));
        Ok(stored)
    }

    async fn update(
        &self,
        table: &'static str,
        owner: Uuid,
        id: Uuid,
        patch: Value,
    ) -> Result<Value, RepoError> {
        self.check_mutation(table)?;
        let Value::Object(patch) = patch else {
            return Err(RepoError::invalid_input("patch must be an object"));
        };
        let now = self.now_text()?;

        let (old, new) = {
            let mut tables = mutex_lock(&self.tables, SOURCE, "update");
            let row = tables
                .get_mut(table)
                .and_then(|rows| {
                    rows.iter_mut()
                        .find(|row| row_id(row) == Some(id) && owned_by(row, owner))
                })
                .ok_or(RepoError::NotFound)?;
            let old = row.clone();
            for (column, value) in patch {
                row.insert(column, value);
            }
            if row.contains_key("updated_at") {
                row.insert("updated_at".to_string(), Value::String(now));
            }
            (old, row.clone())
        };

        let new = Value::Object(new);
        self.emit(table, RawChange::update(Value::Object(old), new.clone()));
        Ok(new)
    }

    async fn delete(&self, table: &'static str, owner: Uuid, id: Uuid) -> Result<(), RepoError> {
        self.check_mutation(table)?;
        {
            let mut tables = mutex_lock(&self.tables, SOURCE, "delete");
            let rows = tables.get_mut(table).ok_or(RepoError::NotFound)?;
            let before = rows.len();
            rows.retain(|row| !(row_id(row) == Some(id) && owned_by(row, owner)));
            if rows.len() == before {
                return Err(RepoError::NotFound);
            }
        }
        // Deletes only carry the primary key, like a default replica identity.
        self.emit(table, RawChange::delete(json!({ "id": id })));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, filter: &ChangeFilter) -> Result<ChangeStream, SubscriptionError> {
        self.record_call("subscribe".to_string());
        if mutex_lock(&self.failures, SOURCE, "subscribe").subscriptions {
            return Err(SubscriptionError::Connect("change feed unavailable".into()));
        }

        let table = filter.table().to_string();
        let mut changes = self.changes.subscribe();
        let mut generation = self.feed_generation.subscribe();
        generation.mark_unchanged();

        let events = stream! {
            loop {
                tokio::select! {
                    _ = generation.changed() => break,
                    received = changes.recv() => match received {
                        Ok(TableChange { table: changed, change }) if changed == table => {
                            yield ChangeEvent::try_from(change);
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(SubscriptionError::Lagged(skipped));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        };
        Ok(events.boxed())
    }
}

#[async_trait]
impl RpcClient for InMemoryBackend {
    async fn call(&self, name: &str, args: Value) -> Result<Value, RepoError> {
        self.record_call(format!("rpc:{name}"));
        if mutex_lock(&self.failures, SOURCE, "call").rpcs.contains(name) {
            return Err(RepoError::from_persistence(format!("procedure `{name}` failed")));
        }
        match name {
            DAILY_LIMIT_RPC => self.check_daily_limit(&args),
            ORDER_NUMBER_RPC => self.generate_order_number(&args),
            other => Err(RepoError::invalid_input(format!("unknown procedure `{other}`"))),
        }
    }
}
