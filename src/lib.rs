//! creditgate - a multi-tenant credit ledger and usage gate
//!
//! Organizations (schools, universities, businesses, training centers and
//! families) buy credit into a pool, allocate slices of it to members, and
//! members spend credit on metered model usage. Individuals may also hold a
//! personal balance. Every balance change is recorded in an append-only
//! transaction log.
//!
//! # Features
//!
//! - **Credit Resolver**: picks the pool a request is charged to from the
//!   user's preference and balances
//! - **Allocator**: single, bulk (all-or-nothing) and family transfers
//! - **Usage Debiter**: atomic check-and-decrement with reversals
//! - **Precondition Gate**: quiet hours, daily limits, trial and model
//!   checks for children in family organizations
//! - **Storage**: in-memory store, SeaORM store behind the `database` feature
//! - **HTTP**: axum service boundary
//! - **Testing**: fixtures and an HTTP scenario helper
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use creditgate::{ConfigBuilder, CreditEngine, InMemoryLedgerStore, UsageRequest};
//!
//! #[tokio::main]
//! async fn main() -> creditgate::Result<()> {
//!     creditgate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let engine = CreditEngine::new(InMemoryLedgerStore::new(), &config);
//!
//!     let auth = engine
//!         .authorize_usage(&UsageRequest {
//!             user_id: "user-1".into(),
//!             organization_id: None,
//!             model: Some("small".into()),
//!         })
//!         .await?;
//!     println!("charging {}", auth.pool);
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod amount;
pub mod clock;
mod config;
pub mod debiter;
mod engine;
mod error;
pub mod gate;
pub mod guard;
pub mod http;
pub mod ledger;
pub mod notify;
pub mod pricing;
pub mod purchases;
pub mod resolver;
pub mod storage;
pub mod testing;
pub mod types;
pub mod utils;

// Re-exports for public API
pub use allocator::{
    AllocationOutcome, Allocator, BulkAllocationOutcome, BulkFailure, FamilyConfig,
    FamilyTransferOutcome,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigBuilder, DatabaseConfig, LedgerConfig, LoggingConfig};
pub use debiter::{DebitOutcome, ReversalOutcome, UsageDebiter};
pub use engine::{
    CreditEngine, Settlement, SettlementRequest, UsageAuthorization, UsageRequest,
};
pub use error::{FailureBody, LedgerError, Result};
pub use gate::{GateConfig, PreconditionGate};
pub use guard::{Capability, RolePermissions};
pub use ledger::{
    PoolKind, PoolRef, Reconciliation, Transaction, TransactionLogger, TransactionQuery,
    TransactionType,
};
pub use notify::{NoOpNotifier, Notification, Notifier, TracingNotifier};
pub use pricing::{ModelPrice, PricingConfig, UsageCost};
pub use resolver::{Resolution, ResolutionInput, resolve_pool};
pub use storage::{InMemoryLedgerStore, LedgerStore, PurchaseOutcome, TransferOutcome};
#[cfg(feature = "database")]
pub use storage::SeaOrmLedgerStore;
pub use types::{
    CreditPreference, Member, MemberRole, MemberStatus, Organization, OrganizationStatus,
    OrganizationType, ParentalControls, Profile, SubscriptionState, SubscriptionStatus,
    SupervisionMode,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before building the engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "creditgate=debug")
/// - `CREDITGATE_LOG_JSON`: Set to "true" for JSON formatted logs
///
/// Audit lines for committed ledger writes use the target
/// `creditgate::audit`, so they can be routed separately with
/// `RUST_LOG=creditgate::audit=info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .and_then(|v| utils::parse_flag(&v))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &LedgerConfig) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
