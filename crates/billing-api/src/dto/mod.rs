//! Data Transfer Objects (DTOs) for API requests and responses

pub mod common;
pub mod query;

pub use common::*;
pub use query::*;
