//! PostgREST-style HTTP adapter for the hosted backend.
//!
//! Tables live under `{base}/rest/v1/{table}` and procedures under
//! `{base}/rest/v1/rpc/{name}`. Every request carries the project API key,
//! and the signed-in user's access token when one is configured. The change
//! feed needs the websocket channel, which this adapter does not speak.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::repos::{
    ChangeFeed, ChangeStream, FilterOp, MutationRepo, OWNER_COLUMN, QueryRepo, RepoError,
    RpcClient, SelectQuery,
};
use crate::cache::{ChangeFilter, SubscriptionError};

use super::error::InfraError;

const API_KEY: HeaderName = HeaderName::from_static("apikey");
const PREFER: HeaderName = HeaderName::from_static("prefer");
const RANGE: HeaderName = HeaderName::from_static("range");
const RANGE_UNIT: HeaderName = HeaderName::from_static("range-unit");

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base: Url,
}

impl RestBackend {
    pub fn new(
        url: &str,
        api_key: &str,
        access_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let base = Url::parse(url)?.join("rest/v1/")?;

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY, header_value(api_key)?);
        let bearer = access_token.unwrap_or(api_key);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {bearer}"))?);

        let client = Client::builder()
            .user_agent(concat!("kasirpro/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn table_url(&self, table: &str, query: &[(String, String)]) -> Result<Url, RepoError> {
        let mut url = self
            .base
            .join(table)
            .map_err(|err| RepoError::invalid_input(err.to_string()))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        table: &str,
        query: &[(String, String)],
    ) -> Result<RequestBuilder, RepoError> {
        let url = self.table_url(table, query)?;
        debug!(%method, %url, "Backend request");
        Ok(self.client.request(method, url))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, InfraError> {
    HeaderValue::from_str(value)
        .map_err(|err| InfraError::configuration(format!("invalid header value: {err}")))
}

fn owner_pair(owner: Uuid) -> (String, String) {
    (OWNER_COLUMN.to_string(), format!("eq.{owner}"))
}

fn id_pair(id: Uuid) -> (String, String) {
    ("id".to_string(), format!("eq.{id}"))
}

/// Query-string pairs for the owner and filter part of a select.
fn filter_pairs(query: &SelectQuery) -> Vec<(String, String)> {
    let mut pairs = vec![owner_pair(query.owner)];
    for filter in &query.filters {
        let op = match filter.op {
            FilterOp::Eq => "eq",
            FilterOp::ILike => "ilike",
        };
        pairs.push((filter.column.to_string(), format!("{op}.{}", filter.value)));
    }
    pairs
}

fn select_pairs(query: &SelectQuery) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    pairs.extend(filter_pairs(query));
    if let Some(order) = &query.order_by {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
    }
    pairs
}

/// Total from a `Content-Range` header such as `0-19/57` or `*/57`.
fn parse_total(content_range: &str) -> Option<u64> {
    content_range
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

fn transport_error(err: reqwest::Error) -> RepoError {
    if err.is_timeout() {
        RepoError::Timeout
    } else {
        RepoError::from_persistence(err)
    }
}

async fn checked(response: Response) -> Result<Response, RepoError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, body = %body, "Backend request failed");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepoError::Unauthorized { message: body },
        StatusCode::NOT_FOUND => RepoError::NotFound,
        StatusCode::CONFLICT => RepoError::Duplicate { constraint: body },
        StatusCode::BAD_REQUEST => RepoError::invalid_input(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RepoError::Timeout,
        _ => RepoError::from_persistence(format!("status {status} body {body}")),
    })
}

async fn json_body(response: Response) -> Result<Value, RepoError> {
    let response = checked(response).await?;
    response.json().await.map_err(transport_error)
}

/// The single row of a `return=representation` response.
fn single_row(body: Value) -> Result<Value, RepoError> {
    match body {
        Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Value::Array(_) => Err(RepoError::NotFound),
        row @ Value::Object(_) => Ok(row),
        other => Err(RepoError::from_persistence(format!(
            "unexpected response body `{other}`"
        ))),
    }
}

#[async_trait]
impl QueryRepo for RestBackend {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, RepoError> {
        let mut request = self.request(Method::GET, query.table, &select_pairs(query))?;
        if let Some(range) = query.range {
            request = request
                .header(RANGE_UNIT, "items")
                .header(RANGE, format!("{}-{}", range.offset, range.last()));
        }
        let response = request.send().await.map_err(transport_error)?;
        match json_body(response).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(RepoError::from_persistence(format!(
                "expected an array of rows, got `{other}`"
            ))),
        }
    }

    async fn count(&self, query: &SelectQuery) -> Result<u64, RepoError> {
        let mut pairs = vec![("select".to_string(), "id".to_string())];
        pairs.extend(filter_pairs(query));
        let response = self
            .request(Method::HEAD, query.table, &pairs)?
            .header(PREFER, "count=exact")
            .send()
            .await
            .map_err(transport_error)?;
        let response = checked(response).await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_total)
            .ok_or_else(|| RepoError::from_persistence("missing row count in Content-Range"))
    }
}

#[async_trait]
impl MutationRepo for RestBackend {
    async fn insert(&self, table: &'static str, record: Value) -> Result<Value, RepoError> {
        let response = self
            .request(Method::POST, table, &[])?
            .header(PREFER, "return=representation")
            .json(&record)
            .send()
            .await
            .map_err(transport_error)?;
        single_row(json_body(response).await?)
    }

    async fn update(
        &self,
        table: &'static str,
        owner: Uuid,
        id: Uuid,
        patch: Value,
    ) -> Result<Value, RepoError> {
        let response = self
            .request(Method::PATCH, table, &[id_pair(id), owner_pair(owner)])?
            .header(PREFER, "return=representation")
            .json(&patch)
            .send()
            .await
            .map_err(transport_error)?;
        single_row(json_body(response).await?)
    }

    async fn delete(&self, table: &'static str, owner: Uuid, id: Uuid) -> Result<(), RepoError> {
        let response = self
            .request(Method::DELETE, table, &[id_pair(id), owner_pair(owner)])?
            .header(PREFER, "return=representation")
            .send()
            .await
            .map_err(transport_error)?;
        single_row(json_body(response).await?).map(|_| ())
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(&self, filter: &ChangeFilter) -> Result<ChangeStream, SubscriptionError> {
        Err(SubscriptionError::Unsupported(format!(
            "realtime changes for `{}` need the websocket channel",
            filter.table()
        )))
    }
}

#[async_trait]
impl RpcClient for RestBackend {
    async fn call(&self, name: &str, args: Value) -> Result<Value, RepoError> {
        let response = self
            .request(Method::POST, &format!("rpc/{name}"), &[])?
            .json(&args)
            .send()
            .await
            .map_err(transport_error)?;
        json_body(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pagination::PageRequest;
    use crate::application::repos::Filter;
    use crate::domain::entities::OrderBy;

    #[test]
    fn builds_postgrest_pairs() {
        let owner = Uuid::from_u128(5);
        let query = SelectQuery::new("orders", owner)
            .filter(Filter::eq("status", "pending"))
            .filter(Filter::contains("customer_name", "sari"))
            .order(OrderBy::desc("created_at"))
            .range(PageRequest::new(2, 10).unwrap().range());

        let pairs = select_pairs(&query);
        let expect = |key: &str, value: &str| {
            assert!(
                pairs.iter().any(|(k, v)| k == key && v == value),
                "missing {key}={value} in {pairs:?}"
            );
        };
        expect("select", "*");
        expect("user_id", &format!("eq.{owner}"));
        expect("status", "eq.pending");
        expect("customer_name", "ilike.*sari*");
        expect("order", "created_at.desc");
    }

    #[test]
    fn reads_content_range_totals() {
        assert_eq!(parse_total("0-19/57"), Some(57));
        assert_eq!(parse_total("*/0"), Some(0));
        assert_eq!(parse_total("*/*"), None);
        assert_eq!(parse_total("garbage"), None);
    }

    #[test]
    fn representation_bodies() {
        let row = serde_json::json!({ "id": 1 });
        assert_eq!(single_row(serde_json::json!([row.clone()])).unwrap(), row);
        assert_eq!(single_row(serde_json::json!([])).unwrap_err(), RepoError::NotFound);
    }

    #[test]
    fn base_url_gets_rest_prefix() {
        let backend =
            RestBackend::new("https://demo.supabase.co/", "anon", None, Duration::from_secs(5))
                .unwrap();
        let url = backend
            .table_url("orders", &[("select".to_string(), "*".to_string())])
            .unwrap();
        assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/orders?select=*");
    }
}
