//! Route handlers.

pub mod authflow;
pub mod health;
pub mod root;
