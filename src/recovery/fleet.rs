//! Verbs acting on every storage node.

use super::CommandContext;
use crate::fleet::{for_all_stores, FleetReport, UNREACHABLE_STATES};
use crate::models::{Result, SwitchMode, FULL_LEVEL_COMPACT};
use std::sync::Arc;
use tracing::info;

/// Print one line per failed node; successes are only counted.
fn report_failures<T>(ctx: &CommandContext, verb: &str, report: FleetReport<T>) {
    let succeeded = report.succeeded();
    let skipped = report.skipped.len();
    let failures = report.into_failures();
    for failure in &failures {
        ctx.say(failure);
    }
    info!(
        verb,
        succeeded,
        failed = failures.len(),
        skipped,
        "Fleet operation finished"
    );
}

/// Full-level compaction on every reachable node.
pub async fn compact_cluster(ctx: &CommandContext) -> Result<()> {
    let directory = ctx.connector().store_directory(&ctx.config)?;
    let admin = ctx.connector().store_admin(&ctx.config)?;

    let report = for_all_stores(
        &ctx.cancel,
        directory.as_ref(),
        UNREACHABLE_STATES,
        ctx.config.fleet.concurrency,
        move |store| {
            let admin = Arc::clone(&admin);
            async move { admin.compact(&store.address, FULL_LEVEL_COMPACT).await }
        },
    )
    .await?;

    report_failures(ctx, "compact", report);
    Ok(())
}

/// Switch every reachable node into `mode`.
pub async fn switch_mode(ctx: &CommandContext, mode: SwitchMode) -> Result<()> {
    let directory = ctx.connector().store_directory(&ctx.config)?;
    let admin = ctx.connector().store_admin(&ctx.config)?;

    let report = for_all_stores(
        &ctx.cancel,
        directory.as_ref(),
        UNREACHABLE_STATES,
        ctx.config.fleet.concurrency,
        move |store| {
            let admin = Arc::clone(&admin);
            async move { admin.switch_mode(&store.address, mode).await }
        },
    )
    .await?;

    report_failures(ctx, "switch-mode", report);
    Ok(())
}

/// Print the current mode of every reachable node. Node errors are
/// printed inline and never fail the command.
pub async fn fetch_mode(ctx: &CommandContext) -> Result<()> {
    let directory = ctx.connector().store_directory(&ctx.config)?;
    let admin = ctx.connector().store_admin(&ctx.config)?;

    let report = for_all_stores(
        &ctx.cancel,
        directory.as_ref(),
        UNREACHABLE_STATES,
        ctx.config.fleet.concurrency,
        move |store| {
            let admin = Arc::clone(&admin);
            async move { admin.fetch_mode(&store.address).await }
        },
    )
    .await?;

    for (store, outcome) in &report.outcomes {
        match outcome {
            Ok(mode) => ctx.say(format_args!("{:<30} | {} mode", store.address, mode)),
            Err(e) => ctx.say(format_args!("{:<30} | Error: {}", store.address, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::context::testing::*;
    use super::*;
    use crate::backend::CleanupStrategy;
    use crate::models::{Store, StoreState};
    use tempfile::TempDir;

    fn stores() -> Vec<Store> {
        vec![
            Store {
                id: 1,
                address: "10.0.0.1:20160".into(),
                state: StoreState::Up,
                version: String::new(),
            },
            Store {
                id: 2,
                address: "10.0.0.2:20160".into(),
                state: StoreState::Up,
                version: String::new(),
            },
            Store {
                id: 3,
                address: "10.0.0.3:20160".into(),
                state: StoreState::Tombstone,
                version: String::new(),
            },
            Store {
                id: 4,
                address: "10.0.0.4:20160".into(),
                state: StoreState::Disconnected,
                version: String::new(),
            },
        ]
    }

    fn backend() -> FakeBackend {
        FakeBackend::new(CleanupStrategy::CloseThenCleanup)
    }

    #[tokio::test]
    async fn test_compact_skips_unreachable_and_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let admin = FakeAdmin {
            failing: vec!["10.0.0.1:20160".into()],
            ..Default::default()
        };
        let harness = Harness::new(&temp, connector(stores(), admin, backend()));

        compact_cluster(&harness.ctx).await.unwrap();

        let mut calls = harness.connector.admin.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec!["compact 10.0.0.1:20160 -1", "compact 10.0.0.2:20160 -1"]
        );
        let output = harness.output.contents();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Store 10.0.0.1:20160 failed:"));
        assert!(lines[0].contains("store is busy"));
        assert!(!output.contains("10.0.0.2:20160"));
        assert!(!output.contains("10.0.0.4:20160"));
    }

    #[tokio::test]
    async fn test_switch_mode_reaches_every_live_store() {
        let temp = TempDir::new().unwrap();
        let harness = Harness::new(&temp, connector(stores(), FakeAdmin::default(), backend()));

        switch_mode(&harness.ctx, SwitchMode::Import).await.unwrap();

        let calls = harness.connector.admin.calls.lock().unwrap().len();
        assert_eq!(calls, 2);
        assert!(harness.output.contents().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_mode_prints_errors_inline() {
        let temp = TempDir::new().unwrap();
        let mut admin = FakeAdmin {
            failing: vec!["10.0.0.2:20160".into()],
            ..Default::default()
        };
        admin
            .modes
            .insert("10.0.0.1:20160".into(), SwitchMode::Import);
        let harness = Harness::new(&temp, connector(stores(), admin, backend()));

        fetch_mode(&harness.ctx).await.unwrap();

        let output = harness.output.contents();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{:<30} | import mode", "10.0.0.1:20160"));
        assert!(lines[1].starts_with(&format!("{:<30} | Error: ", "10.0.0.2:20160")));
    }
}
