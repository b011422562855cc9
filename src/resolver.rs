//! Credit Resolver.
//!
//! Decides which pool pays for a request. Resolution is a pure function of
//! the user's preference and the two remainders; it reads nothing and writes
//! nothing, so the same inputs always give the same pool.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::ledger::PoolRef;
use crate::types::{CreditPreference, Member, Organization};

/// The organization side of a resolution: which pool and how much is left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrgSide {
    pub pool: PoolRef,
    pub remaining: Decimal,
}

impl OrgSide {
    /// Organization side for an active member.
    ///
    /// Owners and admins with nothing left in their own allocation may
    /// spend the organization's unallocated pool directly.
    #[must_use]
    pub fn for_member(member: &Member, org: &Organization) -> Self {
        if member.role.is_manager() && member.remaining().is_zero() {
            return Self {
                pool: PoolRef::organization(&org.id),
                remaining: org.unallocated(),
            };
        }
        Self {
            pool: PoolRef::member(&org.id, &member.id),
            remaining: member.remaining(),
        }
    }
}

/// Everything the resolver looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionInput {
    pub user_id: String,
    pub preference: CreditPreference,
    /// `None` when the user has no active membership in the organization.
    pub organization: Option<OrgSide>,
    pub personal_balance: Decimal,
}

/// The pool chosen to pay, with its remainder at resolution time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub pool: PoolRef,
    pub available_amount: Decimal,
}

/// Pick the paying pool.
pub fn resolve_pool(input: &ResolutionInput) -> Result<Resolution> {
    let personal = Resolution {
        pool: PoolRef::personal(&input.user_id),
        available_amount: input.personal_balance,
    };
    let has_personal = input.personal_balance > Decimal::ZERO;

    let org = input.organization.as_ref().map(|side| Resolution {
        pool: side.pool.clone(),
        available_amount: side.remaining,
    });
    let has_org = org
        .as_ref()
        .is_some_and(|o| o.available_amount > Decimal::ZERO);

    if !has_org && !has_personal {
        return Err(LedgerError::NoCreditAvailable);
    }

    let Some(org) = org else {
        return Ok(personal);
    };

    match input.preference {
        CreditPreference::OrgOnly if has_org => Ok(org),
        CreditPreference::OrgOnly => Err(LedgerError::InsufficientOrgCredit),
        CreditPreference::PersonalOnly if has_personal => Ok(personal),
        CreditPreference::PersonalOnly => Err(LedgerError::InsufficientPersonalCredit),
        CreditPreference::PersonalFirst if has_personal => Ok(personal),
        CreditPreference::PersonalFirst => Ok(org),
        CreditPreference::OrgFirst | CreditPreference::Auto if has_org => Ok(org),
        CreditPreference::OrgFirst | CreditPreference::Auto => Ok(personal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PoolKind;
    use crate::types::{MemberRole, OrganizationType};

    fn input(preference: CreditPreference, org: Option<i64>, personal: i64) -> ResolutionInput {
        ResolutionInput {
            user_id: "u1".into(),
            preference,
            organization: org.map(|cents| OrgSide {
                pool: PoolRef::member("org", "m1"),
                remaining: Decimal::new(cents, 2),
            }),
            personal_balance: Decimal::new(personal, 2),
        }
    }

    fn kind(result: Result<Resolution>) -> Result<PoolKind> {
        result.map(|r| r.pool.kind())
    }

    #[test]
    fn test_resolution_table() {
        use CreditPreference::*;
        let cases = [
            (OrgOnly, Some(100), 100, Ok(PoolKind::MemberAllocation)),
            (OrgOnly, Some(0), 100, Err(LedgerError::InsufficientOrgCredit)),
            (PersonalOnly, Some(100), 100, Ok(PoolKind::Personal)),
            (PersonalOnly, Some(100), 0, Err(LedgerError::InsufficientPersonalCredit)),
            (OrgFirst, Some(100), 100, Ok(PoolKind::MemberAllocation)),
            (OrgFirst, Some(0), 100, Ok(PoolKind::Personal)),
            (PersonalFirst, Some(100), 100, Ok(PoolKind::Personal)),
            (PersonalFirst, Some(100), 0, Ok(PoolKind::MemberAllocation)),
            (Auto, Some(100), 100, Ok(PoolKind::MemberAllocation)),
            (Auto, Some(0), 100, Ok(PoolKind::Personal)),
        ];

        for (preference, org, personal, expected) in cases {
            assert_eq!(
                kind(resolve_pool(&input(preference, org, personal))),
                expected,
                "{preference} org={org:?} personal={personal}"
            );
        }
    }

    #[test]
    fn test_exhausted_everywhere() {
        for preference in [
            CreditPreference::Auto,
            CreditPreference::OrgOnly,
            CreditPreference::PersonalOnly,
            CreditPreference::OrgFirst,
            CreditPreference::PersonalFirst,
        ] {
            assert_eq!(
                resolve_pool(&input(preference, Some(0), 0)),
                Err(LedgerError::NoCreditAvailable)
            );
        }
        assert_eq!(
            resolve_pool(&input(CreditPreference::Auto, None, 0)),
            Err(LedgerError::NoCreditAvailable)
        );
    }

    #[test]
    fn test_no_membership_ignores_preference() {
        let resolution = resolve_pool(&input(CreditPreference::OrgOnly, None, 25)).unwrap();
        assert_eq!(resolution.pool, PoolRef::personal("u1"));
        assert_eq!(resolution.available_amount, Decimal::new(25, 2));
    }

    #[test]
    fn test_deterministic() {
        let i = input(CreditPreference::Auto, Some(5), 5);
        assert_eq!(resolve_pool(&i), resolve_pool(&i));
    }

    #[test]
    fn test_manager_falls_back_to_org_pool() {
        let org = Organization::new("Acme", OrganizationType::Business)
            .with_balance(Decimal::new(1000, 2));
        let admin = Member::new(&org.id, "boss", MemberRole::Admin);
        let side = OrgSide::for_member(&admin, &org);
        assert_eq!(side.pool, PoolRef::organization(&org.id));
        assert_eq!(side.remaining, Decimal::new(1000, 2));

        let teacher = Member::new(&org.id, "t", MemberRole::Teacher);
        let side = OrgSide::for_member(&teacher, &org);
        assert_eq!(side.pool.kind(), PoolKind::MemberAllocation);
        assert!(side.remaining.is_zero());
    }
}
