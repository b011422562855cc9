//! Guardian notifications.
//!
//! The ledger decides *when* guardians are told something (a child asked for
//! more credit, content was flagged) and *who* is told (active owners and
//! admins of the organization). Delivery belongs to a [`Notifier`]
//! implementation and happens off the request path: failures are logged and
//! never fail the operation that triggered them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Something guardians should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A child asked for more credit.
    CreditRequested {
        organization_id: String,
        child_user_id: String,
        amount: Option<Decimal>,
        message: Option<String>,
    },
    /// Content from a child was flagged by moderation.
    ContentFlagged {
        organization_id: String,
        child_user_id: String,
        category: String,
    },
}

impl Notification {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreditRequested { .. } => "credit_requested",
            Self::ContentFlagged { .. } => "content_flagged",
        }
    }

    #[must_use]
    pub fn organization_id(&self) -> &str {
        match self {
            Self::CreditRequested {
                organization_id, ..
            }
            | Self::ContentFlagged {
                organization_id, ..
            } => organization_id,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreditRequested {
                child_user_id,
                amount,
                ..
            } => match amount {
                Some(amount) => write!(f, "{} requested {} credits", child_user_id, amount),
                None => write!(f, "{} requested more credits", child_user_id),
            },
            Self::ContentFlagged {
                child_user_id,
                category,
                ..
            } => write!(f, "content from {} flagged as {}", child_user_id, category),
        }
    }
}

/// Delivery backend for guardian notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notification` to the given user ids.
    async fn notify(&self, notification: &Notification, recipients: &[String]) -> Result<()>;
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _notification: &Notification, _recipients: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Logs notifications at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification, recipients: &[String]) -> Result<()> {
        tracing::info!(
            target: "creditgate::notify",
            event_type = notification.kind(),
            organization_id = notification.organization_id(),
            recipients = recipients.len(),
            "{}",
            notification
        );
        Ok(())
    }
}

/// Send in the background. Errors are logged, never returned.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification, recipients: Vec<String>) {
    if recipients.is_empty() {
        tracing::debug!(event_type = notification.kind(), "no recipients for notification");
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification, &recipients).await {
            tracing::warn!(
                event_type = notification.kind(),
                error = %e,
                "failed to deliver notification"
            );
        }
    });
}
