//! PostgreSQL pool initialization and the liveness query.
//!
//! Schema migrations are owned by the deployment tooling, not this
//! process; the pool is optional and its absence only affects the
//! database probe and collector.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use vaiz_core::config::PostgresConfig;

pub async fn init_pg_pool(config: &PostgresConfig) -> Option<PgPool> {
    if !config.is_configured() {
        tracing::info!("postgres not configured, relational features disabled");
        return None;
    }

    match PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.connection_string())
        .await
    {
        Ok(pool) => {
            tracing::info!(
                host = %config.host,
                database = %config.database,
                "postgres pool ready"
            );
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(error = %e, "postgres unavailable, continuing without it");
            None
        }
    }
}

pub async fn select_one(pool: &PgPool) -> anyhow::Result<()> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    anyhow::ensure!(row.0 == 1, "unexpected SELECT 1 result");
    Ok(())
}

/// Lightweight introspection for the database collector: server version
/// and per-table row estimates.
pub async fn introspect(pool: &PgPool) -> anyhow::Result<serde_json::Value> {
    let (version,): (String,) = sqlx::query_as("SHOW server_version").fetch_one(pool).await?;

    let tables: Vec<(String, i64)> = sqlx::query_as(
        "SELECT relname, n_live_tup FROM pg_stat_user_tables ORDER BY relname",
    )
    .fetch_all(pool)
    .await?;

    let table_map: serde_json::Map<String, serde_json::Value> = tables
        .into_iter()
        .map(|(name, rows)| (name, serde_json::Value::from(rows)))
        .collect();

    Ok(serde_json::json!({
        "backend": "postgresql",
        "server_version": version,
        "tables": table_map,
    }))
}
