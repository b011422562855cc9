use axum::{
    Json,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::Serialize;

/// Successful JSON response: `{"success": true, ...fields of T}`.
#[derive(Debug, Serialize)]
pub struct Success<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for Success<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// The common `{success, new_balance}` shape.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub new_balance: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl BalanceResponse {
    pub fn new(new_balance: Decimal) -> Self {
        Self {
            new_balance,
            transaction_id: None,
        }
    }

    #[must_use]
    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_flattens_payload() {
        let body = Success::new(BalanceResponse::new(Decimal::new(150, 2)));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["new_balance"], "1.50");
        assert!(json.get("transaction_id").is_none());
    }
}
