//! Operator verbs for repairing an interrupted bulk load.
//!
//! Every verb takes a [`CommandContext`]; [`execute`] runs one verb and maps
//! its outcome to an exit status.

mod checkpoints;
mod context;
mod engine;
mod fleet;

pub use checkpoints::*;
pub use context::*;
pub use engine::*;
pub use fleet::*;

use crate::models::{LodeError, Result, SwitchMode, TableScope};
use std::error::Error as StdError;
use std::path::PathBuf;
use tracing::error;

/// One operator request, already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Compact,
    SwitchMode(SwitchMode),
    FetchMode,
    ImportEngine(String),
    CleanupEngine(String),
    CheckpointRemove(TableScope),
    CheckpointErrorIgnore(TableScope),
    CheckpointErrorDestroy(TableScope),
    CheckpointDump(PathBuf),
    CheckLocalStorage,
}

/// Run one action to completion.
pub async fn run(ctx: &CommandContext, action: &Action) -> Result<()> {
    match action {
        Action::Compact => compact_cluster(ctx).await,
        Action::SwitchMode(mode) => switch_mode(ctx, *mode).await,
        Action::FetchMode => fetch_mode(ctx).await,
        Action::ImportEngine(engine) => import_engine(ctx, engine).await,
        Action::CleanupEngine(engine) => cleanup_engine(ctx, engine).await,
        Action::CheckpointRemove(scope) => checkpoint_remove(ctx, scope).await,
        Action::CheckpointErrorIgnore(scope) => checkpoint_error_ignore(ctx, scope).await,
        Action::CheckpointErrorDestroy(scope) => checkpoint_error_destroy(ctx, scope).await,
        Action::CheckpointDump(dir) => checkpoint_dump(ctx, dir).await,
        Action::CheckLocalStorage => check_local_storage(ctx).await,
    }
}

/// Run `action` and return its exit status.
pub async fn execute(ctx: &CommandContext, action: &Action) -> i32 {
    match run(ctx, action).await {
        Ok(()) => 0,
        Err(e) => fail(ctx, &e),
    }
}

/// Write the full cause chain of `err` to the report stream and invoke the
/// terminator with status 1.
pub fn fail(ctx: &CommandContext, err: &LodeError) -> i32 {
    error!(error = %err, "Command failed");
    ctx.say(format_args!("Error: {err}"));
    let mut source = err.source();
    while let Some(cause) = source {
        ctx.say(format_args!("Caused by: {cause}"));
        source = cause.source();
    }
    ctx.terminate(1);
    1
}

#[cfg(test)]
mod tests {
    use super::context::testing::*;
    use super::*;
    use crate::backend::CleanupStrategy;
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
    async fn test_success_does_not_terminate() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);

        let code = execute(&harness.ctx, &Action::CheckpointRemove(TableScope::All)).await;
        assert_eq!(code, 0);
        assert!(harness.terminator.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_prints_chain_and_exits_one() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);

        let code = execute(&harness.ctx, &Action::ImportEngine("db.t1:nope".into())).await;
        assert_eq!(code, 1);
        assert_eq!(*harness.terminator.0.lock().unwrap(), vec![1]);
        assert!(harness
            .output
            .contents()
            .starts_with("Error: Invalid argument: invalid engine id"));
    }

    #[tokio::test]
    async fn test_cancelled_fleet_command_fails() {
        let temp = TempDir::new().unwrap();
        let harness = harness(&temp);
        harness.ctx.cancel.cancel();

        let code = execute(&harness.ctx, &Action::FetchMode).await;
        assert_eq!(code, 1);
        assert!(harness.output.contents().contains("Operation cancelled"));
    }
}
