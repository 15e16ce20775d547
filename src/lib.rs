//! KasirPro client data layer.
//!
//! Keeps per-owner, per-business collections (orders, customers, services,
//! products) cached in process, refreshes them when the backend's change feed
//! reports a relevant row change, and routes mutations through the backend
//! before invalidating the affected cache entries.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
