use axum::Router;
use rust_decimal::Decimal;
use serde_json::{Value, json};

use creditgate::http::router;
use creditgate::testing::fixtures::{credits, fake, seed_family, seed_profile, seed_school};
use creditgate::testing::{get, post};
use creditgate::{
    ConfigBuilder, CreditEngine, InMemoryLedgerStore, LedgerStore, ModelPrice, PricingConfig,
};

fn app(store: &InMemoryLedgerStore) -> Router {
    let config = ConfigBuilder::new()
        .with_pricing(PricingConfig::default().with_model(
            "small",
            ModelPrice::new(Decimal::new(100, 0), Decimal::new(200, 0)),
        ))
        .build()
        .unwrap();
    router(CreditEngine::new(store.clone(), &config))
}

async fn purchase(store: &InMemoryLedgerStore, target: Value, cents: i64) -> Value {
    post(app(store), "/v1/purchases")
        .json_body(&json!({
            "target": target,
            "amount": credits(cents).to_string(),
            "external_payment_id": fake::payment_id(),
        }))
        .execute()
        .await
        .assert_ok()
        .json()
        .await
}

#[tokio::test]
async fn test_authorize_and_settle() {
    let store = InMemoryLedgerStore::new();
    let user = fake::user_id("solo");
    seed_profile(&store, &user, Decimal::ZERO).await;
    purchase(&store, json!({"kind": "personal", "user_id": user}), 100).await;

    let auth: Value = post(app(&store), "/v1/usage/authorize")
        .as_user(&user)
        .json_body(&json!({"model": "small"}))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(auth["success"], true);
    assert_eq!(auth["pool"]["kind"], "personal");
    assert_eq!(auth["available_amount"], "1.00");

    let balance = post(app(&store), "/v1/usage/settle")
        .as_user(&user)
        .json_body(&json!({
            "pool": auth["pool"],
            "model": "small",
            "tokens_in": 1000,
            "tokens_out": 1000,
        }))
        .execute()
        .await
        .assert_ok()
        .decimal_field("new_balance")
        .await;
    assert_eq!(balance, credits(70));
}

#[tokio::test]
async fn test_authorize_without_credit_is_payment_required() {
    let store = InMemoryLedgerStore::new();
    let user = fake::user_id("broke");
    seed_profile(&store, &user, Decimal::ZERO).await;

    let body = post(app(&store), "/v1/usage/authorize")
        .as_user(&user)
        .json_body(&json!({}))
        .execute()
        .await
        .assert_payment_required()
        .assert_reason("no_credit_available")
        .await;
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_missing_actor_is_rejected() {
    let store = InMemoryLedgerStore::new();

    post(app(&store), "/v1/usage/authorize")
        .json_body(&json!({}))
        .execute()
        .await
        .assert_bad_request()
        .assert_reason("invalid_request")
        .await;
}

#[tokio::test]
async fn test_purchase_replay_is_not_applied_twice() {
    let store = InMemoryLedgerStore::new();
    let user = fake::user_id("buyer");
    seed_profile(&store, &user, Decimal::ZERO).await;
    let body = json!({
        "target": {"kind": "personal", "user_id": user},
        "amount": "5.00",
        "external_payment_id": "pi_replayed",
    });

    let first: Value = post(app(&store), "/v1/purchases")
        .json_body(&body)
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    let replay: Value = post(app(&store), "/v1/purchases")
        .json_body(&body)
        .execute()
        .await
        .assert_ok()
        .json()
        .await;

    assert_eq!(first["applied"], true);
    assert_eq!(replay["applied"], false);
    assert_eq!(first["transaction_id"], replay["transaction_id"]);
    assert_eq!(replay["new_balance"], "5.00");
}

#[tokio::test]
async fn test_allocation_permissions() {
    let store = InMemoryLedgerStore::new();
    let school = seed_school(&store, credits(1000), 2).await;
    let uri = format!("/v1/orgs/{}/allocations", school.org.id);

    let allocation = post(app(&store), &uri)
        .as_user(&school.admin.user_id)
        .json_body(&json!({"member_id": school.students[0].id, "amount": "2.50"}))
        .execute()
        .await
        .assert_ok()
        .decimal_field("new_balance")
        .await;
    assert_eq!(allocation, credits(250));

    for actor in [&school.teacher.user_id, &school.students[0].user_id] {
        post(app(&store), &uri)
            .as_user(actor)
            .json_body(&json!({"member_id": school.students[1].id, "amount": "1.00"}))
            .execute()
            .await
            .assert_forbidden()
            .assert_reason("insufficient_permission")
            .await;
    }

    get(app(&store), &format!("/v1/orgs/{}/transactions", school.org.id))
        .as_user(&school.teacher.user_id)
        .execute()
        .await
        .assert_forbidden();
}

#[tokio::test]
async fn test_bulk_allocation_shortfall() {
    let store = InMemoryLedgerStore::new();
    let school = seed_school(&store, credits(450), 5).await;
    let uri = format!(
        "/v1/orgs/{}/classes/{}/allocations",
        school.org.id, school.class_id
    );

    post(app(&store), &uri)
        .as_user(&school.admin.user_id)
        .json_body(&json!({"amount_per_student": "1.00"}))
        .execute()
        .await
        .assert_payment_required()
        .assert_reason("insufficient_org_pool")
        .await;

    let body: Value = post(app(&store), &uri)
        .as_user(&school.admin.user_id)
        .json_body(&json!({"amount_per_student": "0.50"}))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(body["succeeded"].as_array().unwrap().len(), 5);
    assert_eq!(body["total_allocated"], "2.50");
}

#[tokio::test]
async fn test_family_transfer_and_ledger_listing() {
    let store = InMemoryLedgerStore::new();
    let family = seed_family(&store, Decimal::ZERO).await;
    purchase(
        &store,
        json!({"kind": "organization", "organization_id": family.org.id}),
        1000,
    )
    .await;

    let body: Value = post(app(&store), &format!("/v1/orgs/{}/transfers", family.org.id))
        .as_user(&family.parent.user_id)
        .json_body(&json!({"child_user_id": family.child.user_id, "amount": "4.00"}))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(body["new_balance"], "4.00");
    assert_eq!(body["organization_unallocated"], "6.00");
    assert_eq!(body["parent_balance"], "6.00");

    let listing: Value = get(
        app(&store),
        &format!("/v1/orgs/{}/transactions?tx_type=transfer", family.org.id),
    )
    .as_user(&family.parent.user_id)
    .execute()
    .await
    .assert_ok()
    .json()
    .await;
    let transactions = listing["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["amount"], "4.00");

    get(
        app(&store),
        &format!("/v1/orgs/{}/transactions", family.org.id),
    )
    .as_user(&family.child.user_id)
    .execute()
    .await
    .assert_forbidden();

    let child = store
        .get_profile(&family.child.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.credits_balance, credits(400));
}

#[tokio::test]
async fn test_credit_request_counts_guardians() {
    let store = InMemoryLedgerStore::new();
    let family = seed_family(&store, credits(100)).await;

    let body: Value = post(
        app(&store),
        &format!("/v1/orgs/{}/credit-requests", family.org.id),
    )
    .as_user(&family.child.user_id)
    .json_body(&json!({"amount": "2.00", "message": "science project"}))
    .execute()
    .await
    .assert_ok()
    .json()
    .await;
    assert_eq!(body["notified"], 1);
}
