//! Shared domain enumerations aligned with the backend's column values.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Business vertical that partitions the shared orders, customers and services tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Laundry,
    Warung,
    CuciMotor,
}

impl BusinessType {
    pub const ALL: [BusinessType; 3] = [
        BusinessType::Laundry,
        BusinessType::Warung,
        BusinessType::CuciMotor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BusinessType::Laundry => "laundry",
            BusinessType::Warung => "warung",
            BusinessType::CuciMotor => "cuci_motor",
        }
    }
}

impl fmt::Display for BusinessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "laundry" => Ok(BusinessType::Laundry),
            "warung" => Ok(BusinessType::Warung),
            "cuci_motor" => Ok(BusinessType::CuciMotor),
            other => Err(DomainError::unknown_variant("business type", other)),
        }
    }
}

/// Collections the client keeps cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Orders,
    Customers,
    Services,
    Products,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Orders => "orders",
            EntityType::Customers => "customers",
            EntityType::Services => "services",
            EntityType::Products => "products",
        }
    }

    /// Backend table holding rows of this entity.
    pub fn table(self) -> &'static str {
        self.as_str()
    }

    /// Whether rows carry a `business_type` partition column.
    pub fn is_partitioned(self) -> bool {
        !matches!(self, EntityType::Products)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "orders" => Ok(EntityType::Orders),
            "customers" => Ok(EntityType::Customers),
            "services" => Ok(EntityType::Services),
            "products" => Ok(EntityType::Products),
            other => Err(DomainError::unknown_variant("entity", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::unknown_variant("order status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}
