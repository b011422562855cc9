//! Ledger error types.
//!
//! Every rejection the engine can produce has a variant here with a stable
//! machine-readable reason code. Client-facing failures (credit, gate,
//! permission, input) are distinguished from server-side failures
//! (`LedgerInconsistency`, `Storage`), whose details never reach callers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::ledger::PoolKind;

/// Errors produced by ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Amount was zero, negative or otherwise unusable.
    #[error("Invalid amount: {reason}")]
    InvalidAmount {
        /// Why the amount was rejected.
        reason: String,
    },

    /// The resolved pool does not hold enough credit for the debit.
    #[error("Insufficient credit in {pool} pool: {available} available, {requested} requested")]
    InsufficientCredit {
        pool: PoolKind,
        available: Decimal,
        requested: Decimal,
    },

    /// `org_only` preference and the organization allocation is exhausted.
    #[error("Organization credit is exhausted")]
    InsufficientOrgCredit,

    /// `personal_only` preference and the personal balance is exhausted.
    #[error("Personal credit is exhausted")]
    InsufficientPersonalCredit,

    /// Neither the organization nor the personal pool has credit left.
    #[error("No credit available")]
    NoCreditAvailable,

    /// The organization's unallocated pool cannot cover an allocation.
    #[error("Organization pool too small: {available} unallocated, {requested} requested")]
    InsufficientOrgPool {
        available: Decimal,
        requested: Decimal,
    },

    /// Usage attempted during the child's quiet hours.
    #[error("Quiet hours are active until {until}")]
    QuietHours {
        /// Local end of quiet hours, `HH:MM`.
        until: String,
    },

    /// The child's daily credit allowance is used up.
    #[error("Daily credit limit reached ({used} of {limit} used)")]
    DailyLimitReached { limit: Decimal, used: Decimal },

    /// Trial ended or subscription no longer grants access.
    #[error("Trial expired")]
    TrialExpired,

    /// Model is outside the member's allowlist.
    #[error("Model not allowed: {model}")]
    ModelNotAllowed { model: String },

    /// No pricing is configured for the model.
    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    /// Organization is suspended or archived.
    #[error("Organization is not active: {org_id}")]
    OrganizationInactive { org_id: String },

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Actor has no active membership in the organization.
    #[error("User is not a member of this organization")]
    NotMember,

    /// Actor's role does not grant the capability.
    #[error("Insufficient permissions: requires {required}")]
    InsufficientPermission { required: String },

    /// Request was structurally valid but semantically wrong.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The usage transaction has already been reversed.
    #[error("Transaction already reversed: {transaction_id}")]
    AlreadyReversed { transaction_id: String },

    /// A balance invariant would have been broken. Nothing was written.
    #[error("Ledger inconsistency: {detail}")]
    LedgerInconsistency { detail: String },

    /// Backing store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    pub fn invalid_amount(reason: impl Into<String>) -> Self {
        Self::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn insufficient_permission(required: impl Into<String>) -> Self {
        Self::InsufficientPermission {
            required: required.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn inactive(org_id: impl Into<String>) -> Self {
        Self::OrganizationInactive {
            org_id: org_id.into(),
        }
    }

    /// Create an inconsistency error and log it at error level.
    ///
    /// Inconsistencies mean a write would have broken a balance invariant,
    /// which should never happen with correct callers.
    pub fn inconsistency(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(target: "creditgate::ledger", detail = %detail, "ledger inconsistency detected");
        Self::LedgerInconsistency { detail }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Stable machine-readable reason code.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "invalid_amount",
            Self::InsufficientCredit { .. } => "insufficient_credit",
            Self::InsufficientOrgCredit => "insufficient_org_credit",
            Self::InsufficientPersonalCredit => "insufficient_personal_credit",
            Self::NoCreditAvailable => "no_credit_available",
            Self::InsufficientOrgPool { .. } => "insufficient_org_pool",
            Self::QuietHours { .. } => "quiet_hours",
            Self::DailyLimitReached { .. } => "daily_limit_reached",
            Self::TrialExpired => "trial_expired",
            Self::ModelNotAllowed { .. } => "model_not_allowed",
            Self::UnknownModel { .. } => "unknown_model",
            Self::OrganizationInactive { .. } => "organization_inactive",
            Self::NotFound { .. } => "not_found",
            Self::NotMember => "not_member",
            Self::InsufficientPermission { .. } => "insufficient_permission",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::AlreadyReversed { .. } => "already_reversed",
            Self::LedgerInconsistency { .. } => "ledger_inconsistency",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Whether the caller caused the failure (4xx class).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::LedgerInconsistency { .. } | Self::Storage(_) | Self::Configuration(_)
        )
    }

    /// Whether this is a credit shortage of any kind.
    #[must_use]
    pub fn is_credit_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredit { .. }
                | Self::InsufficientOrgCredit
                | Self::InsufficientPersonalCredit
                | Self::NoCreditAvailable
                | Self::InsufficientOrgPool { .. }
        )
    }

    /// Whether this came from the precondition gate.
    #[must_use]
    pub fn is_gate_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuietHours { .. }
                | Self::DailyLimitReached { .. }
                | Self::TrialExpired
                | Self::ModelNotAllowed { .. }
        )
    }

    /// Message safe to show to end users.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::LedgerInconsistency { .. } | Self::Storage(_) | Self::Configuration(_) => {
                "An internal error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            e if e.is_credit_error() => StatusCode::PAYMENT_REQUIRED,
            e if e.is_gate_rejection() => StatusCode::FORBIDDEN,
            Self::OrganizationInactive { .. }
            | Self::NotMember
            | Self::InsufficientPermission { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidAmount { .. } | Self::InvalidRequest { .. } | Self::UnknownModel { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::AlreadyReversed { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure body returned by the service boundary.
#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub success: bool,
    pub reason: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(reason = self.reason_code(), error = %self, "request failed");
        } else {
            tracing::warn!(reason = self.reason_code(), error = %self, "request rejected");
        }

        let until = match &self {
            Self::QuietHours { until } => Some(until.clone()),
            _ => None,
        };
        let body = FailureBody {
            success: false,
            reason: self.reason_code(),
            message: self.user_message(),
            until,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
