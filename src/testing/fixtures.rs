//! Ledger fixtures for tests.
//!
//! Seed helpers write straight into a [`LedgerStore`] and panic on failure,
//! which is what a test wants when its setup is broken. Opening balances are
//! written as purchase rows, so every seeded pool reconciles.

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::ledger::{PoolRef, Transaction, TransactionType};
use crate::storage::LedgerStore;
use crate::types::{
    Member, MemberRole, Organization, OrganizationType, Profile, SubscriptionState,
};

/// Helper functions for generating fake identifiers
pub mod fake {
    use super::*;

    /// A unique user id with a readable prefix.
    pub fn user_id(prefix: &str) -> String {
        format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8])
    }

    /// A unique payment id as a provider would send it.
    pub fn payment_id() -> String {
        format!("pi_{}", Uuid::new_v4().simple())
    }
}

/// Credits from hundredths: `credits(150)` is `1.50`.
pub fn credits(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub async fn seed_profile<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
    balance: Decimal,
) -> Profile {
    let profile = Profile::new(user_id);
    store
        .save_profile(&profile)
        .await
        .expect("seed profile");
    fund(store, &PoolRef::personal(user_id), balance).await;
    profile.with_balance(balance)
}

pub async fn seed_organization<S: LedgerStore + ?Sized>(
    store: &S,
    org_type: OrganizationType,
    balance: Decimal,
) -> Organization {
    let org = Organization::new(format!("Test {}", org_type), org_type)
        .with_subscription(SubscriptionState::active());
    store
        .create_organization(&org)
        .await
        .expect("seed organization");
    fund(store, &PoolRef::organization(&org.id), balance).await;
    org.with_balance(balance)
}

async fn fund<S: LedgerStore + ?Sized>(store: &S, pool: &PoolRef, balance: Decimal) {
    if balance <= Decimal::ZERO {
        return;
    }
    let tx = Transaction::new(
        TransactionType::Purchase,
        pool,
        balance,
        "Opening balance",
        Utc::now(),
    )
    .with_external_id(format!("opening:{}", Uuid::new_v4().simple()));
    store.apply_purchase(&tx).await.expect("seed opening balance");
}

/// Add a member and, if the user has none yet, an empty personal profile.
pub async fn seed_member<S: LedgerStore + ?Sized>(
    store: &S,
    org: &Organization,
    user_id: &str,
    role: MemberRole,
) -> Member {
    if store
        .get_profile(user_id)
        .await
        .expect("load profile")
        .is_none()
    {
        seed_profile(store, user_id, Decimal::ZERO).await;
    }
    let member = Member::new(&org.id, user_id, role);
    store.add_member(&member).await.expect("seed member");
    member
}

/// A school with one teacher and a class of students.
pub struct SchoolFixture {
    pub org: Organization,
    pub admin: Member,
    pub teacher: Member,
    pub class_id: String,
    pub students: Vec<Member>,
}

pub async fn seed_school<S: LedgerStore + ?Sized>(
    store: &S,
    balance: Decimal,
    students: usize,
) -> SchoolFixture {
    let org = seed_organization(store, OrganizationType::School, balance).await;
    let admin = seed_member(store, &org, &fake::user_id("admin"), MemberRole::Admin).await;
    let teacher = seed_member(store, &org, &fake::user_id("teacher"), MemberRole::Teacher).await;
    let class_id = "class-7b".to_string();

    let mut seeded = Vec::with_capacity(students);
    for _ in 0..students {
        let user_id = fake::user_id("student");
        seed_profile(store, &user_id, Decimal::ZERO).await;
        let member = Member::new(&org.id, &user_id, MemberRole::Student).with_class(&class_id);
        store.add_member(&member).await.expect("seed student");
        seeded.push(member);
    }

    SchoolFixture {
        org,
        admin,
        teacher,
        class_id,
        students: seeded,
    }
}

/// A family with one parent (owner) and one child.
pub struct FamilyFixture {
    pub org: Organization,
    pub parent: Member,
    pub child: Member,
}

pub async fn seed_family<S: LedgerStore + ?Sized>(store: &S, balance: Decimal) -> FamilyFixture {
    let org = seed_organization(store, OrganizationType::Family, balance).await;
    let parent = seed_member(store, &org, &fake::user_id("parent"), MemberRole::Owner).await;
    let child = seed_member(store, &org, &fake::user_id("child"), MemberRole::Student).await;
    FamilyFixture { org, parent, child }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransactionLogger;
    use crate::storage::InMemoryLedgerStore;

    #[tokio::test]
    async fn test_seed_school() {
        let store = InMemoryLedgerStore::new();
        let school = seed_school(&store, credits(1000), 3).await;

        let class = store
            .list_class_members(&school.org.id, &school.class_id)
            .await
            .unwrap();
        assert_eq!(class.len(), 3);
        assert!(
            store
                .get_profile(&school.students[0].user_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_seeded_balances_reconcile() {
        let store = InMemoryLedgerStore::new();
        let logger = TransactionLogger::new(store.clone());
        let school = seed_school(&store, credits(1000), 1).await;
        let user = fake::user_id("solo");
        let profile = seed_profile(&store, &user, credits(250)).await;
        assert_eq!(profile.credits_balance, credits(250));

        for pool in [PoolRef::organization(&school.org.id), PoolRef::personal(&user)] {
            let reconciliation = logger.reconcile(&pool).await.unwrap();
            assert!(reconciliation.is_balanced(), "{:?}", reconciliation);
        }
        let org = store.get_organization(&school.org.id).await.unwrap().unwrap();
        assert_eq!(org.credit_balance, credits(1000));
    }

    #[test]
    fn test_fake_ids_are_unique() {
        assert_ne!(fake::user_id("kid"), fake::user_id("kid"));
        assert!(fake::payment_id().starts_with("pi_"));
    }
}
