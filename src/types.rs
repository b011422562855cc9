//! Core account types: organizations, members, profiles and parental controls.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::non_negative;

/// Error returned when parsing one of the string-coded enums fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    kind: &'static str,
    invalid_value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            invalid_value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.kind, self.invalid_value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Declares an enum stored and transmitted as a lowercase string code.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $value)] $variant, )+
        }

        impl $name {
            /// String code used in storage and on the wire.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $value, )+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::types::ParseEnumError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $( $value => Ok(Self::$variant), )+
                    _ => Err($crate::types::ParseEnumError::new($kind, s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// Kind of organization. Only `Family` organizations get parental gating
    /// and parent-to-child transfers.
    pub enum OrganizationType ("organization type") {
        School => "school",
        University => "university",
        Business => "business",
        TrainingCenter => "training_center",
        Family => "family",
    }
}

string_enum! {
    /// Lifecycle state. Organizations are never hard-deleted.
    #[derive(Default)]
    pub enum OrganizationStatus ("organization status") {
        #[default]
        Active => "active",
        Suspended => "suspended",
        Archived => "archived",
    }
}

string_enum! {
    /// Subscription state as last reported by the payment provider.
    #[derive(Default)]
    pub enum SubscriptionStatus ("subscription status") {
        #[default]
        Active => "active",
        Trialing => "trialing",
        PastDue => "past_due",
        Canceled => "canceled",
        Expired => "expired",
    }
}

string_enum! {
    /// Role of a member inside an organization.
    ///
    /// In family organizations parents are owners or admins and children are
    /// students.
    pub enum MemberRole ("member role") {
        Owner => "owner",
        Admin => "admin",
        Teacher => "teacher",
        Student => "student",
    }
}

string_enum! {
    #[derive(Default)]
    pub enum MemberStatus ("member status") {
        #[default]
        Active => "active",
        Archived => "archived",
    }
}

string_enum! {
    /// Which pool a user wants usage charged to first.
    #[derive(Default)]
    pub enum CreditPreference ("credit preference") {
        #[default]
        Auto => "auto",
        OrgFirst => "org_first",
        PersonalFirst => "personal_first",
        OrgOnly => "org_only",
        PersonalOnly => "personal_only",
    }
}

string_enum! {
    /// How closely a child's usage is supervised.
    #[derive(Default)]
    pub enum SupervisionMode ("supervision mode") {
        #[default]
        Guided => "guided",
        Trusted => "trusted",
        Adult => "adult",
    }
}

impl MemberRole {
    /// Owners and admins may spend the organization's unallocated pool directly.
    #[must_use]
    pub fn is_manager(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// Subscription status plus trial end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl SubscriptionState {
    #[must_use]
    pub fn active() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trialing(ends_at: DateTime<Utc>) -> Self {
        Self {
            status: SubscriptionStatus::Trialing,
            trial_ends_at: Some(ends_at),
        }
    }

    /// Whether the subscription still grants usage at `now`.
    ///
    /// Past-due subscriptions keep access while the provider retries payment.
    #[must_use]
    pub fn allows_usage(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::PastDue => true,
            SubscriptionStatus::Trialing => self.trial_ends_at.is_none_or(|end| now < end),
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired => false,
        }
    }
}

/// An organization and its credit pool.
///
/// `credit_balance` is everything purchased for the organization,
/// `credit_allocated` the part handed out to members or transferred to
/// children. The difference is the unallocated pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub org_type: OrganizationType,
    pub credit_balance: Decimal,
    pub credit_allocated: Decimal,
    pub status: OrganizationStatus,
    pub subscription: SubscriptionState,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>, org_type: OrganizationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            org_type,
            credit_balance: Decimal::ZERO,
            credit_allocated: Decimal::ZERO,
            status: OrganizationStatus::Active,
            subscription: SubscriptionState::active(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.credit_balance = balance;
        self
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: SubscriptionState) -> Self {
        self.subscription = subscription;
        self
    }

    /// Credit not yet handed to any member.
    #[must_use]
    pub fn unallocated(&self) -> Decimal {
        non_negative(self.credit_balance - self.credit_allocated)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == OrganizationStatus::Active
    }

    #[must_use]
    pub fn is_family(&self) -> bool {
        self.org_type == OrganizationType::Family
    }
}

/// A user's membership in an organization, with their allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub credit_allocated: Decimal,
    pub credit_used: Decimal,
    pub class_id: Option<String>,
    pub status: MemberStatus,
    /// Models the member may use. `None` means no restriction.
    pub allowed_models: Option<Vec<String>>,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            role,
            credit_allocated: Decimal::ZERO,
            credit_used: Decimal::ZERO,
            class_id: None,
            status: MemberStatus::Active,
            allowed_models: None,
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_class(mut self, class_id: impl Into<String>) -> Self {
        self.class_id = Some(class_id.into());
        self
    }

    #[must_use]
    pub fn with_allowed_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    /// Allocation not yet spent.
    #[must_use]
    pub fn remaining(&self) -> Decimal {
        non_negative(self.credit_allocated - self.credit_used)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models
            .as_ref()
            .is_none_or(|models| models.iter().any(|m| m == model))
    }
}

/// A user's personal account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub credits_balance: Decimal,
    #[serde(default)]
    pub credit_preference: CreditPreference,
}

impl Profile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            credits_balance: Decimal::ZERO,
            credit_preference: CreditPreference::default(),
        }
    }

    #[must_use]
    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.credits_balance = balance;
        self
    }

    #[must_use]
    pub fn with_preference(mut self, preference: CreditPreference) -> Self {
        self.credit_preference = preference;
        self
    }
}

/// Guardian-configured limits for one child in a family organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentalControls {
    pub organization_id: String,
    pub member_id: String,
    #[serde(default)]
    pub supervision_mode: SupervisionMode,
    pub daily_credit_limit: Option<Decimal>,
    /// Stored for the chat layer, which tracks session time.
    pub daily_time_limit_minutes: Option<u32>,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    /// Unused daily allowance carries over to following days.
    #[serde(default)]
    pub cumulative_credits: bool,
    /// Offset of the child's local time from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Start of the cumulative allowance period.
    pub allowance_anchor: DateTime<Utc>,
}

impl ParentalControls {
    pub fn new(organization_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            member_id: member_id.into(),
            supervision_mode: SupervisionMode::default(),
            daily_credit_limit: None,
            daily_time_limit_minutes: None,
            quiet_hours_start: None,
            quiet_hours_end: None,
            cumulative_credits: false,
            utc_offset_minutes: 0,
            allowance_anchor: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_daily_limit(mut self, limit: Decimal) -> Self {
        self.daily_credit_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_quiet_hours(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.quiet_hours_start = Some(start);
        self.quiet_hours_end = Some(end);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SupervisionMode) -> Self {
        self.supervision_mode = mode;
        self
    }

    #[must_use]
    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_cumulative(mut self, anchor: DateTime<Utc>) -> Self {
        self.cumulative_credits = true;
        self.allowance_anchor = anchor;
        self
    }

    /// The child's local offset. Out-of-range values fall back to UTC.
    #[must_use]
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    #[test]
    fn test_string_codes() {
        assert_eq!(OrganizationType::TrainingCenter.as_str(), "training_center");
        assert_eq!(
            CreditPreference::from_str("ORG_FIRST").unwrap(),
            CreditPreference::OrgFirst
        );
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "past_due");
        let err = MemberRole::from_str("parent").unwrap_err();
        assert_eq!(err.to_string(), "invalid member role: 'parent'");
    }

    #[test]
    fn test_serde_uses_codes() {
        let json = serde_json::to_string(&CreditPreference::PersonalOnly).unwrap();
        assert_eq!(json, "\"personal_only\"");
        let parsed: OrganizationType = serde_json::from_str("\"family\"").unwrap();
        assert_eq!(parsed, OrganizationType::Family);
    }

    #[test]
    fn test_subscription_allows_usage() {
        let now = Utc::now();
        assert!(SubscriptionState::active().allows_usage(now));
        assert!(SubscriptionState::trialing(now + Duration::days(1)).allows_usage(now));
        assert!(!SubscriptionState::trialing(now - Duration::seconds(1)).allows_usage(now));

        let past_due = SubscriptionState {
            status: SubscriptionStatus::PastDue,
            trial_ends_at: None,
        };
        assert!(past_due.allows_usage(now));

        let expired = SubscriptionState {
            status: SubscriptionStatus::Expired,
            trial_ends_at: None,
        };
        assert!(!expired.allows_usage(now));
    }

    #[test]
    fn test_member_remaining_and_models() {
        let mut member = Member::new("org", "user", MemberRole::Student)
            .with_allowed_models(["gpt-4o-mini"]);
        member.credit_allocated = Decimal::new(100, 2);
        member.credit_used = Decimal::new(40, 2);

        assert_eq!(member.remaining(), Decimal::new(60, 2));
        assert!(member.allows_model("gpt-4o-mini"));
        assert!(!member.allows_model("gpt-4o"));
        assert!(Member::new("org", "u2", MemberRole::Teacher).allows_model("anything"));
    }

    #[test]
    fn test_unallocated() {
        let mut org = Organization::new("Acme", OrganizationType::School)
            .with_balance(Decimal::new(1000, 2));
        org.credit_allocated = Decimal::new(550, 2);
        assert_eq!(org.unallocated(), Decimal::new(450, 2));
    }
}
