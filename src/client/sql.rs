//! SQL side of the target cluster: dropping half-loaded tables and clearing
//! the coordination metadata a load leaves behind.

use crate::models::{LodeError, Result, TableName, TableScope, TidbConfig};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Table holding one row per table being loaded.
pub const TABLE_META_TABLE: &str = "table_meta";
/// Table holding one row per running load task.
pub const TASK_META_TABLE: &str = "task_meta";

/// Operations on the target database used by recovery commands.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    /// `DROP TABLE IF EXISTS` for one table.
    async fn drop_table(&self, table: &TableName) -> Result<()>;

    /// Remove table-meta rows in scope, then drop the meta schema once no
    /// table-meta rows remain. Missing meta tables are not an error.
    async fn cleanup_metas(&self, scope: &TableScope, meta_schema: &str) -> Result<()>;

    async fn close(&self);
}

/// Quote an identifier with backticks.
fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Connection options for the target. Credentials are passed as-is, never
/// through a URL.
fn connect_options(config: &TidbConfig) -> MySqlConnectOptions {
    let options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user);
    let password = config.resolved_password();
    if password.is_empty() {
        options
    } else {
        options.password(&password)
    }
}

/// Target database reached over the MySQL protocol.
pub struct MySqlTarget {
    pool: MySqlPool,
}

impl MySqlTarget {
    pub async fn connect(config: &TidbConfig, timeout: Duration) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(timeout)
            .connect_with(connect_options(config))
            .await
            .map_err(|e| {
                LodeError::unavailable(format!("target database {}:{}", config.host, config.port), e)
            })?;
        debug!(host = %config.host, port = config.port, "Connected to target database");
        Ok(Self { pool })
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl TargetDatabase for MySqlTarget {
    async fn drop_table(&self, table: &TableName) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {table}");
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table = %table, "Dropped table");
        Ok(())
    }

    async fn cleanup_metas(&self, scope: &TableScope, meta_schema: &str) -> Result<()> {
        let table_meta_exists = self.table_exists(meta_schema, TABLE_META_TABLE).await?;
        let table_meta = format!("{}.{}", quote_ident(meta_schema), quote_ident(TABLE_META_TABLE));

        if table_meta_exists {
            match scope {
                TableScope::All => {
                    sqlx::query(&format!("DELETE FROM {table_meta}"))
                        .execute(&self.pool)
                        .await?;
                }
                TableScope::Table(name) => {
                    sqlx::query(&format!("DELETE FROM {table_meta} WHERE table_name = ?"))
                        .bind(name.to_string())
                        .execute(&self.pool)
                        .await?;
                }
            }
        }

        if !self.table_exists(meta_schema, TASK_META_TABLE).await? {
            return Ok(());
        }

        // The schema is shared by every table of the task; keep it while any
        // table still has a row.
        if table_meta_exists {
            let remaining: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table_meta}"))
                .fetch_one(&self.pool)
                .await?;
            if remaining > 0 {
                debug!(remaining, "Table metas remain, keeping meta schema");
                return Ok(());
            }
        }

        sqlx::query(&format!("DROP DATABASE IF EXISTS {}", quote_ident(meta_schema)))
            .execute(&self.pool)
            .await?;
        info!(schema = meta_schema, "Dropped meta schema");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("lightning_metadata"), "`lightning_metadata`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_connect_options_keep_special_characters() {
        let config = TidbConfig {
            host: "tidb.internal".to_string(),
            port: 4001,
            user: "loader@ops".to_string(),
            password: "p@ss:w/rd".to_string(),
        };
        let options = connect_options(&config);
        assert_eq!(options.get_host(), "tidb.internal");
        assert_eq!(options.get_port(), 4001);
        assert_eq!(options.get_username(), "loader@ops");
        assert!(format!("{options:?}").contains("p@ss:w/rd"));
    }

    #[test]
    fn test_drop_statement_uses_quoted_name() {
        let name = TableName::new("db", "t`1");
        assert_eq!(format!("DROP TABLE IF EXISTS {name}"), "DROP TABLE IF EXISTS `db`.`t``1`");
    }
}
