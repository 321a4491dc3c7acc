//! Integration tests for database migrations and connection pooling.
//!
//! Each test opens a fresh SQLite file in a temporary directory and runs
//! migrations against it, so tests are fully isolated without needing a
//! shared server process.

use sqlx::Row;

use foreman_db::pool;
use foreman_test_utils::create_test_db;

const EXPECTED_TABLES: &[&str] = &["batch_tasks", "batches", "proof_logs", "state_log", "tasks"];

#[tokio::test]
async fn migrations_create_all_tables() {
    let store = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' \
         ORDER BY name",
    )
    .fetch_all(&store.pool)
    .await
    .expect("should list tables");

    let table_names: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    assert_eq!(
        table_names, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let store = create_test_db().await;

    pool::run_migrations(&store.pool)
        .await
        .expect("second migration run should succeed (idempotent)");

    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) AS cnt FROM {table}");
        let row = sqlx::query(&query)
            .fetch_one(&store.pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        let count: i64 = row.get("cnt");
        assert_eq!(count, 0, "table {table} should be empty after migrations");
    }
}

#[tokio::test]
async fn pool_is_functional_after_migration() {
    let store = create_test_db().await;

    let one: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(&store.pool)
        .await
        .expect("simple query should work");
    assert_eq!(one.0, 1);

    store.pool.close().await;
}

#[tokio::test]
async fn table_counts_returns_expected_tables() {
    let store = create_test_db().await;

    let counts = pool::table_counts(&store.pool)
        .await
        .expect("table_counts should succeed");

    assert_eq!(counts.len(), EXPECTED_TABLES.len());
    for (name, count) in &counts {
        assert_eq!(*count, 0, "table {name} should be empty");
    }
}
