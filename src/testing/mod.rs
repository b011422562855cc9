//! Testing utilities for creditgate
//!
//! - Ledger fixtures that seed organizations, members and profiles
//! - A recording [`Notifier`](crate::Notifier) for asserting notifications
//! - Alba-style HTTP endpoint testing without running a server
//! - A migrated SQLite in-memory database (feature `database`)
//!
//! # Example
//!
//! ```rust,ignore
//! use creditgate::testing::{self, fixtures};
//! use creditgate::{CreditEngine, InMemoryLedgerStore, LedgerConfig};
//!
//! #[tokio::test]
//! async fn test_allocate() {
//!     let store = InMemoryLedgerStore::new();
//!     let school = fixtures::seed_school(&store, fixtures::credits(1000), 2).await;
//!     let app = creditgate::http::router(CreditEngine::new(store, &LedgerConfig::default()));
//!
//!     testing::post(app, &format!("/v1/orgs/{}/allocations", school.org.id))
//!         .as_user(&school.admin.user_id)
//!         .json_body(&serde_json::json!({"member_id": school.students[0].id, "amount": "1.00"}))
//!         .execute()
//!         .await
//!         .assert_ok();
//! }
//! ```

#[cfg(feature = "database")]
mod database;
pub mod fixtures;
mod notifier;
mod scenario;

#[cfg(feature = "database")]
pub use database::TestDb;
pub use notifier::RecordingNotifier;
pub use scenario::{Scenario, ScenarioAssert, get, post};
