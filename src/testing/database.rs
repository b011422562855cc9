//! Database testing utilities
//!
//! Creates a SQLite in-memory database with the ledger schema applied, so
//! the SeaORM store can be exercised without external services.
//!
//! # Example
//!
//! ```rust,ignore
//! use creditgate::testing::TestDb;
//!
//! #[tokio::test]
//! async fn test_with_database() {
//!     let db = TestDb::new().await.expect("Failed to create test database");
//!     let store = db.store();
//! }
//! ```

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;

use crate::storage::SeaOrmLedgerStore;
use crate::storage::migration::Migrator;

/// Manages a test database connection
pub struct TestDb {
    pub connection: DatabaseConnection,
}

impl TestDb {
    /// SQLite in-memory database with the ledger migrations applied.
    ///
    /// The pool holds exactly one connection: every pooled connection to
    /// `sqlite::memory:` would otherwise open its own empty database.
    pub async fn new() -> Result<Self, DbErr> {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options
            .max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let connection = Database::connect(options).await?;
        connection
            .execute_unprepared("PRAGMA foreign_keys=ON;")
            .await?;

        Migrator::up(&connection, None).await?;
        Ok(Self { connection })
    }

    /// Connect to an existing database (for example PostgreSQL from
    /// `TEST_DATABASE_URL`) and apply the ledger migrations.
    pub async fn from_url(url: &str) -> Result<Self, DbErr> {
        let connection = Database::connect(url).await?;
        Migrator::up(&connection, None).await?;
        Ok(Self { connection })
    }

    /// Get a clone of the database connection
    pub fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }

    /// A ledger store on this database.
    pub fn store(&self) -> SeaOrmLedgerStore {
        SeaOrmLedgerStore::new(self.connection())
    }

    /// Execute raw SQL statements, for corrupting state in drift tests.
    pub async fn seed(&self, statements: &[&str]) -> Result<(), DbErr> {
        for statement in statements {
            self.connection.execute_unprepared(statement).await?;
        }
        Ok(())
    }
}

/// Helper macro to create a migrated test database for each test
///
/// ```rust,ignore
/// let db = creditgate::test_db!();
/// ```
#[macro_export]
macro_rules! test_db {
    () => {{
        $crate::testing::TestDb::new()
            .await
            .expect("Failed to create test database")
    }};
}
