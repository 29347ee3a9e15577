//! Verbs acting on one engine named by the operator.

use super::CommandContext;
use crate::backend::{EngineManager, EngineRef};
use crate::models::Result;
use tracing::info;

/// Force-close the engine and import it into the fleet.
pub async fn import_engine(ctx: &CommandContext, engine: &str) -> Result<()> {
    let engine = EngineRef::parse(engine)?;
    let backend = ctx.connector().import_backend(&ctx.config)?;
    let manager = EngineManager::new(backend);

    let closed = manager.close_engine_ref(&engine).await?;
    closed
        .import(
            &ctx.cancel,
            ctx.config.importer.effective_region_split_size(),
        )
        .await?;
    info!(engine = %closed.tag(), "Import finished");
    Ok(())
}

/// Force-close the engine and release its resources.
pub async fn cleanup_engine(ctx: &CommandContext, engine: &str) -> Result<()> {
    let engine = EngineRef::parse(engine)?;
    let backend = ctx.connector().import_backend(&ctx.config)?;
    let manager = EngineManager::new(backend);

    let closed = manager.close_engine_ref(&engine).await?;
    closed.cleanup(&ctx.cancel).await
}

#[cfg(test)]
mod tests {
    use super::super::context::testing::*;
    use super::*;
    use crate::backend::{make_uuid, CleanupStrategy};
    use crate::models::{LodeError, TableName, DEFAULT_REGION_SPLIT_SIZE};
    use tempfile::TempDir;

    fn harness(temp: &TempDir) -> Harness {
        Harness::new(
            temp,
            connector(
                Vec::new(),
                FakeAdmin::default(),
                FakeBackend::new(CleanupStrategy::CloseThenCleanup),
            ),
        )
    }

    #[tokio::test]
    async fn test_import_engine_by_table_ref() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);

        import_engine(&harness.ctx, "`db`.`t2`:0").await.unwrap();

        let (_, uuid) = make_uuid(&TableName::new("db", "t2"), 0);
        assert_eq!(
            harness.connector.backend.calls(),
            vec![
                format!("close {uuid}"),
                format!("import {uuid} {DEFAULT_REGION_SPLIT_SIZE}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_engine_by_uuid() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);
        let uuid = uuid::Uuid::new_v4();

        cleanup_engine(&harness.ctx, &uuid.to_string()).await.unwrap();

        assert_eq!(
            harness.connector.backend.calls(),
            vec![format!("close {uuid}"), format!("cleanup {uuid}")]
        );
    }

    #[tokio::test]
    async fn test_bad_reference_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);

        let err = import_engine(&harness.ctx, "db.t2:x").await.unwrap_err();
        assert!(matches!(err, LodeError::InvalidArgument(_)));
        assert!(harness.connector.backend.calls().is_empty());
    }
}
