//! Collection views, order workflows and the backend ports they use.

pub mod collection;
pub mod error;
pub mod history;
pub mod hub;
pub mod orders;
pub mod pagination;
pub mod repos;
