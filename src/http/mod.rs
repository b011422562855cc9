//! HTTP service boundary.
//!
//! Exposes the engine over axum. Successful responses are
//! `{"success": true, ...}` bodies, failures are the
//! [`FailureBody`](crate::FailureBody) produced by [`LedgerError`](crate::LedgerError)'s
//! `IntoResponse` impl. The acting user is taken from the `x-user-id` header,
//! which the upstream authentication layer is expected to set.

mod extract;
mod response;
mod routes;

pub use extract::{ActorId, USER_ID_HEADER};
pub use response::{BalanceResponse, Success};
pub use routes::router;
