use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?
            // PgBouncer txn mode safe
            .statement_cache_capacity(0);

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // All queries in this tool are unqualified; the schema is applied per
        // session so every acquired connection resolves the same tables.
        let set_search_path = schema_set_statement(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(move |conn, _meta| {
                let stmt = set_search_path.clone();
                Box::pin(async move {
                    sqlx::query(&stmt).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        let version: String = sqlx::query_scalar("SELECT version()")
            .persistent(false)
            .fetch_one(&pool)
            .await?;
        info!(schema, version = %version, "connected to db");
        Ok(Self { pool })
    }
}

// SET search_path cannot take a bind parameter, so the schema name is
// validated before being quoted into the statement.
fn schema_set_statement(schema: &str) -> Result<String> {
    let valid = !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        anyhow::bail!("invalid schema name: {schema:?}");
    }
    Ok(format!("SET search_path TO \"{schema}\""))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
