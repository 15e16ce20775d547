//! Entity records mirrored from the backend tables.
//!
//! The cache core treats these as opaque immutable values; only the collection
//! views know how to decode them and which drafts and patches they accept.

use std::{borrow::Cow, fmt::Debug};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    error::DomainError,
    types::{BusinessType, EntityType, OrderStatus, PaymentStatus},
};

/// Column ordering applied to a collection query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub column: Cow<'static, str>,
    pub ascending: bool,
}

impl OrderBy {
    pub const fn asc(column: &'static str) -> Self {
        Self {
            column: Cow::Borrowed(column),
            ascending: true,
        }
    }

    pub const fn desc(column: &'static str) -> Self {
        Self {
            column: Cow::Borrowed(column),
            ascending: false,
        }
    }
}

/// A row type that can be held in a cached collection.
pub trait Record: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    const ENTITY: EntityType;

    type Draft: Draft;
    type Patch: Serialize + Send + Sync;

    fn id(&self) -> Uuid;

    fn order_by() -> OrderBy;
}

/// Input accepted by a collection's `create`.
pub trait Draft: Serialize + Send + Sync {
    fn validate(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

fn require_name(entity: &'static str, name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::validation(format!("{entity} name must not be empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub business_type: BusinessType,
    pub order_number: String,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    pub customer_name: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: i64,
    #[serde(default)]
    pub paid_amount: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewOrder {
    pub customer_id: Option<Uuid>,
    pub customer_name: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub notes: Option<String>,
}

impl NewOrder {
    /// A pending order; payment status follows from the amounts.
    pub fn new(customer_name: impl Into<String>, total_amount: i64, paid_amount: i64) -> Self {
        let payment_status = if paid_amount <= 0 {
            PaymentStatus::Unpaid
        } else if paid_amount < total_amount {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Paid
        };
        Self {
            customer_id: None,
            customer_name: customer_name.into(),
            status: OrderStatus::Pending,
            payment_status,
            total_amount,
            paid_amount,
            notes: None,
        }
    }
}

impl Draft for NewOrder {
    fn validate(&self) -> Result<(), DomainError> {
        require_name("customer", &self.customer_name)?;
        if self.total_amount < 0 || self.paid_amount < 0 {
            return Err(DomainError::validation("order amounts must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OrderPatch {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

impl Record for OrderRecord {
    const ENTITY: EntityType = EntityType::Orders;

    type Draft = NewOrder;
    type Patch = OrderPatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_by() -> OrderBy {
        OrderBy::desc("created_at")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub business_type: BusinessType,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCustomer {
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl Draft for NewCustomer {
    fn validate(&self) -> Result<(), DomainError> {
        require_name("customer", &self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CustomerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Record for CustomerRecord {
    const ENTITY: EntityType = EntityType::Customers;

    type Draft = NewCustomer;
    type Patch = CustomerPatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_by() -> OrderBy {
        OrderBy::asc("name")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub business_type: BusinessType,
    pub name: String,
    pub price: i64,
    pub unit: String,
    #[serde(default)]
    pub duration_hours: Option<i32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct NewService {
    pub name: String,
    pub price: i64,
    pub unit: String,
    pub duration_hours: Option<i32>,
    pub is_active: bool,
}

impl Draft for NewService {
    fn validate(&self) -> Result<(), DomainError> {
        require_name("service", &self.name)?;
        if self.price < 0 {
            return Err(DomainError::validation("service price must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServicePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Record for ServiceRecord {
    const ENTITY: EntityType = EntityType::Services;

    type Draft = NewService;
    type Patch = ServicePatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_by() -> OrderBy {
        OrderBy::asc("name")
    }
}

/// Warung stock item. Products are not partitioned by business type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub stock: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewProduct {
    pub name: String,
    pub sku: Option<String>,
    pub price: i64,
    pub stock: i64,
}

impl Draft for NewProduct {
    fn validate(&self) -> Result<(), DomainError> {
        require_name("product", &self.name)?;
        if self.stock < 0 {
            return Err(DomainError::validation("product stock must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
}

impl Record for ProductRecord {
    const ENTITY: EntityType = EntityType::Products;

    type Draft = NewProduct;
    type Patch = ProductPatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_by() -> OrderBy {
        OrderBy::asc("name")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_order_derives_payment_status() {
        assert_eq!(NewOrder::new("Budi", 20_000, 0).payment_status, PaymentStatus::Unpaid);
        assert_eq!(
            NewOrder::new("Budi", 20_000, 5_000).payment_status,
            PaymentStatus::Partial
        );
        assert_eq!(NewOrder::new("Budi", 20_000, 20_000).payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn drafts_reject_blank_names() {
        assert!(NewOrder::new("  ", 1, 0).validate().is_err());
        let customer = NewCustomer {
            name: String::new(),
            phone: None,
            address: None,
        };
        assert!(customer.validate().is_err());
    }

    #[test]
    fn patch_serializes_only_listed_fields() {
        let patch = OrderPatch::status(OrderStatus::Ready);
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "status": "ready" }));
    }

    #[test]
    fn order_record_decodes_backend_row() {
        let row = json!({
            "id": "6f1c1d6e-8a0c-4f44-9d52-5f1f54b1f001",
            "user_id": "6f1c1d6e-8a0c-4f44-9d52-5f1f54b1f002",
            "business_type": "laundry",
            "order_number": "LDR-00001",
            "customer_name": "Sari",
            "status": "processing",
            "payment_status": "paid",
            "total_amount": 35000,
            "paid_amount": 35000,
            "created_at": "2026-10-19T08:00:00Z",
            "updated_at": "2026-10-19T08:05:00Z"
        });
        let order: OrderRecord = serde_json::from_value(row).expect("order row decodes");
        assert_eq!(order.business_type, BusinessType::Laundry);
        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.customer_id.is_none());
    }
}
