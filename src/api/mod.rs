//! HTTP API for the inventory service
//!
//! Queries over the store, single and bulk mutations, failed alerts and
//! health/metrics endpoints.

mod error;
mod query;
mod rest;

pub use error::{ApiError, ErrorCode, ErrorDetails};
pub use query::{ItemView, ItemsResponse, QueryService, StoreItemsResponse};
pub use rest::*;
