//! Orders collection with the backend's order-creation procedure.
//!
//! Creating an order asks the backend whether today's transaction limit
//! allows another order, then asks it for the next order number, and only
//! then inserts the row. The two procedure calls are not compensated if a
//! later step fails; that bookkeeping belongs to the backend.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::collection::CollectionView;
use crate::application::error::MutationError;
use crate::application::repos::RpcClient;
use crate::domain::entities::{Draft, NewOrder, OrderPatch, OrderRecord};
use crate::domain::error::DomainError;
use crate::domain::types::OrderStatus;

pub const DAILY_LIMIT_RPC: &str = "check_daily_transaction_limit";
pub const ORDER_NUMBER_RPC: &str = "generate_order_number";

pub struct OrderCollection {
    view: CollectionView<OrderRecord>,
    rpc: Arc<dyn RpcClient>,
}

impl OrderCollection {
    pub(crate) fn new(view: CollectionView<OrderRecord>, rpc: Arc<dyn RpcClient>) -> Self {
        Self { view, rpc }
    }

    /// The cached orders of this owner and business type.
    pub fn view(&self) -> &CollectionView<OrderRecord> {
        &self.view
    }

    pub async fn create(&self, draft: NewOrder) -> Result<OrderRecord, MutationError> {
        draft.validate()?;
        let scope = self.view.scope();
        let partition = scope
            .partition
            .ok_or_else(|| DomainError::validation("a business type is required to create orders"))?;

        let args = json!({
            "p_user_id": scope.owner,
            "p_business_type": partition,
        });

        let verdict = self.call(DAILY_LIMIT_RPC, args.clone()).await?;
        if !limit_allows(&verdict)? {
            warn!(owner = %scope.owner, business_type = %partition, "Daily transaction limit reached");
            return Err(MutationError::LimitReached);
        }

        let number = self.call(ORDER_NUMBER_RPC, args).await?;
        let order_number = parse_order_number(&number)?;

        let mut extra = Map::new();
        extra.insert("order_number".to_string(), Value::String(order_number.clone()));
        let order = self.view.create_with(draft, extra).await?;
        info!(order_number = %order_number, id = %order.id, "Order created");
        Ok(order)
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: OrderStatus,
    ) -> Result<OrderRecord, MutationError> {
        self.view.update(id, OrderPatch::status(status)).await
    }

    pub async fn update(&self, id: Uuid, patch: OrderPatch) -> Result<OrderRecord, MutationError> {
        self.view.update(id, patch).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), MutationError> {
        self.view.delete(id).await
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value, MutationError> {
        self.rpc.call(name, args).await.map_err(|err| {
            warn!(rpc = name, error = %err, "Order procedure failed; order not created");
            MutationError::rpc(name, err.to_string())
        })
    }
}

/// The limit procedure answers either a bare boolean or `{ "allowed": bool }`.
fn limit_allows(verdict: &Value) -> Result<bool, MutationError> {
    match verdict {
        Value::Bool(allowed) => Ok(*allowed),
        Value::Object(map) => map
            .get("allowed")
            .and_then(Value::as_bool)
            .ok_or_else(|| MutationError::rpc(DAILY_LIMIT_RPC, format!("unexpected response `{verdict}`"))),
        other => Err(MutationError::rpc(
            DAILY_LIMIT_RPC,
            format!("unexpected response `{other}`"),
        )),
    }
}

fn parse_order_number(value: &Value) -> Result<String, MutationError> {
    let number = match value {
        Value::String(number) => Some(number.as_str()),
        Value::Object(map) => map.get("order_number").and_then(Value::as_str),
        _ => None,
    };
    match number {
        Some(number) if !number.trim().is_empty() => Ok(number.to_string()),
        _ => Err(MutationError::rpc(
            ORDER_NUMBER_RPC,
            format!("unexpected response `{value}`"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_verdict_shapes() {
        assert!(limit_allows(&json!(true)).unwrap());
        assert!(!limit_allows(&json!({ "allowed": false, "remaining": 0 })).unwrap());
        assert!(limit_allows(&json!("yes")).is_err());
        assert!(limit_allows(&json!({ "remaining": 3 })).is_err());
    }

    #[test]
    fn order_number_shapes() {
        assert_eq!(parse_order_number(&json!("LDR-00007")).unwrap(), "LDR-00007");
        assert_eq!(
            parse_order_number(&json!({ "order_number": "WRG-00001" })).unwrap(),
            "WRG-00001"
        );
        assert!(parse_order_number(&json!("")).is_err());
        assert!(parse_order_number(&json!(42)).is_err());
    }
}
