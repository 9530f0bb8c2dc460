//! Billing client, pricing and the order lifecycle built on them.

pub mod billing;
pub mod compute;
pub mod lifecycle;

pub use lifecycle::{BaseOrderRequest, ExpandOrderRequest, OrderLifecycle, RenewOrderRequest};
