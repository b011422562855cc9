//! Engine flows against the SeaORM store on SQLite.

#![cfg(feature = "database")]

use futures::future::join_all;
use rust_decimal::Decimal;

use creditgate::testing::TestDb;
use creditgate::testing::fixtures::{credits, fake, seed_family, seed_profile, seed_school};
use creditgate::{
    ConfigBuilder, CreditEngine, LedgerError, LedgerStore, PoolRef, SeaOrmLedgerStore,
    TransactionQuery, TransactionType,
};

async fn engine() -> (TestDb, CreditEngine<SeaOrmLedgerStore>) {
    let db = TestDb::new().await.expect("Failed to create test database");
    let config = ConfigBuilder::new().build().unwrap();
    let engine = CreditEngine::new(db.store(), &config);
    (db, engine)
}

#[tokio::test]
async fn test_school_flow_reconciles() {
    let (db, engine) = engine().await;
    let store = db.store();
    let school = seed_school(&store, Decimal::ZERO, 3).await;
    let org_pool = PoolRef::organization(&school.org.id);

    engine
        .record_purchase(&org_pool, credits(1000), &fake::payment_id())
        .await
        .unwrap();
    let bulk = engine
        .bulk_allocate(&school.admin.user_id, &school.org.id, &school.class_id, credits(200))
        .await
        .unwrap();
    assert_eq!(bulk.succeeded.len(), 3);

    let student = &school.students[0];
    let member_pool = PoolRef::member(&school.org.id, &student.id);
    let debit = engine
        .debit(&member_pool, credits(75), &student.user_id)
        .await
        .unwrap();
    assert_eq!(debit.remaining, credits(125));

    let err = engine
        .debit(&member_pool, credits(200), &student.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredit { .. }));

    for pool in [org_pool.clone(), member_pool.clone()] {
        let reconciliation = engine.reconcile(&pool).await.unwrap();
        assert!(reconciliation.is_balanced(), "{:?}", reconciliation);
    }

    let org = store.get_organization(&school.org.id).await.unwrap().unwrap();
    assert_eq!(org.unallocated(), credits(400));

    let usage = engine
        .logger()
        .list(
            &TransactionQuery::new()
                .member(&student.id)
                .tx_type(TransactionType::Usage),
        )
        .await
        .unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].amount, credits(-75));
}

#[tokio::test]
async fn test_family_transfer_and_refund() {
    let (db, engine) = engine().await;
    let store = db.store();
    let family = seed_family(&store, Decimal::ZERO).await;
    engine
        .record_purchase(
            &PoolRef::organization(&family.org.id),
            credits(1000),
            &fake::payment_id(),
        )
        .await
        .unwrap();

    let transfer = engine
        .transfer(&family.parent.user_id, &family.org.id, &family.child.user_id, credits(300))
        .await
        .unwrap();
    assert_eq!(transfer.child_balance, credits(300));
    assert_eq!(transfer.parent_balance, Some(credits(700)));

    let child_pool = PoolRef::personal(&family.child.user_id);
    let debit = engine
        .debit(&child_pool, credits(50), &family.child.user_id)
        .await
        .unwrap();
    let refund = engine
        .refund_usage(&debit.transaction.id, "provider timeout")
        .await
        .unwrap();
    assert_eq!(refund.new_balance, credits(300));

    let err = engine
        .refund_usage(&debit.transaction.id, "provider timeout")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyReversed { .. }));

    for pool in [PoolRef::organization(&family.org.id), child_pool] {
        let reconciliation = engine.reconcile(&pool).await.unwrap();
        assert!(reconciliation.is_balanced(), "{:?}", reconciliation);
    }
}

#[tokio::test]
async fn test_reconcile_detects_drift() {
    let (db, engine) = engine().await;
    let store = db.store();
    let user = fake::user_id("solo");
    seed_profile(&store, &user, Decimal::ZERO).await;
    let pool = PoolRef::personal(&user);
    engine
        .record_purchase(&pool, credits(500), &fake::payment_id())
        .await
        .unwrap();

    db.seed(&[&format!(
        "UPDATE profiles SET credits_balance = credits_balance + 1000000 WHERE user_id = '{}'",
        user
    )])
    .await
    .unwrap();

    let reconciliation = engine.reconcile(&pool).await.unwrap();
    assert!(!reconciliation.is_balanced());
    assert_eq!(reconciliation.drift(), Decimal::ONE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_do_not_overdraw() {
    let (db, engine) = engine().await;
    let store = db.store();
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

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{:?}", results);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(LedgerError::InsufficientCredit { .. })))
    );

    let profile = store.get_profile(&user).await.unwrap().unwrap();
    assert_eq!(profile.credits_balance, credits(2));
    assert!(engine.reconcile(&pool).await.unwrap().is_balanced());
}
