//! Role checks for ledger entry points.
//!
//! Administrative operations (allocation, transfers, reversals, reading
//! another member's ledger) are only reachable through [`require`], which
//! resolves the actor's active membership and checks the capability against
//! their role.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, Result};
use crate::storage::LedgerStore;
use crate::types::{Member, MemberRole};

/// Things an actor may be allowed to do inside an organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AllocateCredit,
    TransferCredit,
    ManageParentalControls,
    ViewLedger,
    ReverseTransaction,
}

impl Capability {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllocateCredit => "allocate_credit",
            Self::TransferCredit => "transfer_credit",
            Self::ManageParentalControls => "manage_parental_controls",
            Self::ViewLedger => "view_ledger",
            Self::ReverseTransaction => "reverse_transaction",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission checks for a role.
///
/// Implemented for [`MemberRole`]; custom role models can implement it and
/// reuse [`RolePermissions::can`].
pub trait RolePermissions {
    /// Allocate organization credit to members.
    fn can_allocate(&self) -> bool;

    /// Move family credit to a child.
    fn can_transfer(&self) -> bool;

    /// Edit a child's parental controls.
    fn can_manage_parental_controls(&self) -> bool;

    /// Read the organization's transaction log.
    fn can_view_ledger(&self) -> bool;

    /// Reverse a usage transaction.
    fn can_reverse(&self) -> bool;

    fn can(&self, capability: Capability) -> bool {
        match capability {
            Capability::AllocateCredit => self.can_allocate(),
            Capability::TransferCredit => self.can_transfer(),
            Capability::ManageParentalControls => self.can_manage_parental_controls(),
            Capability::ViewLedger => self.can_view_ledger(),
            Capability::ReverseTransaction => self.can_reverse(),
        }
    }
}

impl RolePermissions for MemberRole {
    fn can_allocate(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    fn can_transfer(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    fn can_manage_parental_controls(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    fn can_view_ledger(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    fn can_reverse(&self) -> bool {
        matches!(self, Self::Owner)
    }
}

/// Resolve `actor_user_id`'s active membership and check `capability`.
///
/// Returns the membership so callers can use it (for example as the parent
/// in a family transfer).
pub async fn require<S: LedgerStore + ?Sized>(
    store: &S,
    organization_id: &str,
    actor_user_id: &str,
    capability: Capability,
) -> Result<Member> {
    let member = store
        .find_membership(organization_id, actor_user_id)
        .await?
        .filter(Member::is_active)
        .ok_or(LedgerError::NotMember)?;

    if !member.role.can(capability) {
        tracing::warn!(
            organization_id = %organization_id,
            actor = %actor_user_id,
            role = %member.role,
            capability = %capability,
            "permission denied"
        );
        return Err(LedgerError::insufficient_permission(capability.as_str()));
    }
    Ok(member)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryLedgerStore;
    use crate::types::{MemberStatus, Organization, OrganizationType};

    #[test]
    fn test_role_capabilities() {
        assert!(MemberRole::Owner.can(Capability::ReverseTransaction));
        assert!(!MemberRole::Admin.can(Capability::ReverseTransaction));
        assert!(MemberRole::Admin.can(Capability::AllocateCredit));
        assert!(!MemberRole::Teacher.can(Capability::AllocateCredit));
        assert!(!MemberRole::Teacher.can(Capability::ViewLedger));
        assert!(!MemberRole::Teacher.can(Capability::TransferCredit));
        assert!(!MemberRole::Student.can(Capability::ViewLedger));
        assert!(MemberRole::Admin.can(Capability::ManageParentalControls));
    }

    #[tokio::test]
    async fn test_require() {
        let store = InMemoryLedgerStore::new();
        let org = Organization::new("School", OrganizationType::School);
        store.create_organization(&org).await.unwrap();
        let admin = Member::new(&org.id, "admin", MemberRole::Admin);
        store.add_member(&admin).await.unwrap();
        let teacher = Member::new(&org.id, "teacher", MemberRole::Teacher);
        store.add_member(&teacher).await.unwrap();
        let student = Member::new(&org.id, "student", MemberRole::Student);
        store.add_member(&student).await.unwrap();

        let found = require(&store, &org.id, "admin", Capability::AllocateCredit)
            .await
            .unwrap();
        assert_eq!(found.id, admin.id);

        for user in ["teacher", "student"] {
            assert!(matches!(
                require(&store, &org.id, user, Capability::AllocateCredit).await,
                Err(LedgerError::InsufficientPermission { .. })
            ));
        }
        assert_eq!(
            require(&store, &org.id, "stranger", Capability::ViewLedger).await,
            Err(LedgerError::NotMember)
        );

        store
            .set_member_status(&admin.id, MemberStatus::Archived)
            .await
            .unwrap();
        assert_eq!(
            require(&store, &org.id, "admin", Capability::AllocateCredit).await,
            Err(LedgerError::NotMember)
        );
    }
}
