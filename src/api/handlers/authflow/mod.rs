//! `/v1/authflows` endpoints.

pub mod cookies;
pub mod create;
pub mod errors;
pub mod get;
pub mod input;
pub mod types;
pub mod websocket;
