//! Concurrent debits never overdraw a pool.

use futures::future::join_all;
use rust_decimal::Decimal;

use creditgate::testing::fixtures::{credits, fake, seed_profile, seed_school};
use creditgate::{
    ConfigBuilder, CreditEngine, InMemoryLedgerStore, LedgerError, LedgerStore, PoolRef,
};

fn engine(store: &InMemoryLedgerStore) -> CreditEngine<InMemoryLedgerStore> {
    let config = ConfigBuilder::new().build().unwrap();
    CreditEngine::new(store.clone(), &config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_debits_against_one_balance() {
    let store = InMemoryLedgerStore::new();
    let engine = engine(&store);
    let user = fake::user_id("solo");
    seed_profile(&store, &user, Decimal::ZERO).await;
    let pool = PoolRef::personal(&user);
    engine
        .record_purchase(&pool, credits(5), &fake::payment_id())
        .await
        .unwrap();

    let attempts = (0..2).map(|_| {
        let engine = engine.clone();
        let pool = pool.clone();
        let user = user.clone();
        tokio::spawn(async move { engine.debit(&pool, credits(3), &user).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "{:?}", results);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(LedgerError::InsufficientCredit { available, .. }) if *available == credits(2)
    )));

    let profile = store.get_profile(&user).await.unwrap().unwrap();
    assert_eq!(profile.credits_balance, credits(2));
    assert!(engine.reconcile(&pool).await.unwrap().is_balanced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_allocations_respect_pool() {
    let store = InMemoryLedgerStore::new();
    let engine = engine(&store);
    let school = seed_school(&store, Decimal::ZERO, 10).await;
    engine
        .record_purchase(
            &PoolRef::organization(&school.org.id),
            credits(700),
            &fake::payment_id(),
        )
        .await
        .unwrap();

    let attempts = school.students.iter().map(|student| {
        let engine = engine.clone();
        let actor = school.admin.user_id.clone();
        let org_id = school.org.id.clone();
        let member_id = student.id.clone();
        tokio::spawn(async move {
            engine
                .allocate(&actor, &org_id, &member_id, credits(100))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 7);
    let org = store.get_organization(&school.org.id).await.unwrap().unwrap();
    assert_eq!(org.unallocated(), Decimal::ZERO);
    assert!(
        engine
            .reconcile(&PoolRef::organization(&school.org.id))
            .await
            .unwrap()
            .is_balanced()
    );
}
