//! Alba-style HTTP testing for the ledger router
//!
//! Drives the axum router with `tower::ServiceExt::oneshot`, so no server
//! or socket is involved.
//!
//! # Example
//!
//! ```rust,ignore
//! use creditgate::testing;
//!
//! let body: serde_json::Value = testing::post(app, "/v1/purchases")
//!     .json_body(&json!({
//!         "target": {"kind": "personal", "user_id": "u1"},
//!         "amount": "5.00",
//!         "external_payment_id": "pi_1"
//!     }))
//!     .execute()
//!     .await
//!     .assert_ok()
//!     .json()
//!     .await;
//! ```

use axum::{
    Router,
    body::Body,
    http::{HeaderName, Method, Request, StatusCode, header},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tower::ServiceExt;

use crate::http::USER_ID_HEADER;

/// Test scenario builder for one request
pub struct Scenario {
    app: Router,
    request: Request<Body>,
}

impl Scenario {
    /// Create a new test scenario with the given app
    pub fn new(app: Router) -> Self {
        Self {
            app,
            request: Request::builder()
                .method(Method::GET)
                .uri("/")
                .body(Body::empty())
                .unwrap(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        *self.request.method_mut() = method;
        self
    }

    pub fn uri(mut self, uri: &str) -> Self {
        *self.request.uri_mut() = uri.parse().unwrap();
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.request.headers_mut().insert(
            HeaderName::from_bytes(key.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        self
    }

    /// Act as `user_id`, the way the upstream auth layer would.
    pub fn as_user(self, user_id: &str) -> Self {
        self.header(USER_ID_HEADER, user_id)
    }

    /// Set JSON body from a serializable type
    pub fn json_body<T: Serialize>(mut self, body: &T) -> Self {
        let json = serde_json::to_string(body).unwrap();
        *self.request.body_mut() = Body::from(json);
        self.request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        self
    }

    /// Execute the request and get an assertion builder
    pub async fn execute(self) -> ScenarioAssert {
        let response = self.app.oneshot(self.request).await.unwrap();
        ScenarioAssert { response }
    }
}

/// Assertion builder for test responses
pub struct ScenarioAssert {
    response: axum::response::Response,
}

impl ScenarioAssert {
    /// Assert the response status code
    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.response.status(),
            expected,
            "Expected status {}, got {}",
            expected,
            self.response.status()
        );
        self
    }

    pub fn assert_ok(self) -> Self {
        self.assert_status(StatusCode::OK)
    }

    pub fn assert_bad_request(self) -> Self {
        self.assert_status(StatusCode::BAD_REQUEST)
    }

    /// Credit shortage.
    pub fn assert_payment_required(self) -> Self {
        self.assert_status(StatusCode::PAYMENT_REQUIRED)
    }

    /// Gate or permission rejection.
    pub fn assert_forbidden(self) -> Self {
        self.assert_status(StatusCode::FORBIDDEN)
    }

    pub fn assert_conflict(self) -> Self {
        self.assert_status(StatusCode::CONFLICT)
    }

    /// Parse the JSON response body into a type
    pub async fn json<T: for<'de> Deserialize<'de>>(self) -> T {
        let bytes = axum::body::to_bytes(self.response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).expect("Failed to parse JSON response")
    }

    /// Assert a `{success: false, reason}` failure body and return it.
    pub async fn assert_reason(self, reason: &str) -> serde_json::Value {
        let body: serde_json::Value = self.json().await;
        assert_eq!(body["success"], false, "expected a failure body: {}", body);
        assert_eq!(body["reason"], reason, "reason mismatch: {}", body);
        body
    }

    /// Read a decimal field (serialized as a string) from a success body.
    pub async fn decimal_field(self, field: &str) -> Decimal {
        let body: serde_json::Value = self.json().await;
        assert_eq!(body["success"], true, "expected a success body: {}", body);
        let raw = body[field]
            .as_str()
            .unwrap_or_else(|| panic!("field '{}' missing in {}", field, body));
        Decimal::from_str(raw).unwrap()
    }

    /// Get the underlying response for custom assertions
    pub fn response(self) -> axum::response::Response {
        self.response
    }
}

/// Convenience function to create a GET request scenario
pub fn get(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::GET).uri(uri)
}

/// Convenience function to create a POST request scenario
pub fn post(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::POST).uri(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, extract::Path, routing::post as axum_post};
    use serde_json::json;

    use crate::http::ActorId;

    async fn whoami(ActorId(user): ActorId, Path(id): Path<String>) -> Json<serde_json::Value> {
        Json(json!({"success": true, "user": user, "id": id, "amount": "1.50"}))
    }

    fn app() -> Router {
        Router::new().route("/things/{id}", axum_post(whoami))
    }

    #[tokio::test]
    async fn test_as_user_sets_header() {
        let body: serde_json::Value = post(app(), "/things/42")
            .as_user("parent-1")
            .execute()
            .await
            .assert_ok()
            .json()
            .await;
        assert_eq!(body["user"], "parent-1");
        assert_eq!(body["id"], "42");
    }

    #[tokio::test]
    async fn test_decimal_field() {
        let amount = post(app(), "/things/1")
            .as_user("u")
            .execute()
            .await
            .decimal_field("amount")
            .await;
        assert_eq!(amount, Decimal::new(150, 2));
    }

    #[tokio::test]
    async fn test_missing_user_is_bad_request() {
        post(app(), "/things/1")
            .execute()
            .await
            .assert_bad_request()
            .assert_reason("invalid_request")
            .await;
    }
}
