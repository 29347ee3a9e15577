//! Everything a recovery command needs besides its arguments.

use crate::backend::{backend_from_config, ImportBackend};
use crate::checkpoint::{is_checkpoints_db_exists, open_checkpoints_db, CheckpointsDb};
use crate::client::{HttpStoreAdmin, MySqlTarget, PdClient, StoreAdmin, StoreDirectory, TargetDatabase};
use crate::models::{Config, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt::Display;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ends the process with a status code. Swapped out in tests.
pub trait Terminator: Send + Sync {
    fn exit(&self, code: i32);
}

/// Calls `std::process::exit`.
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Opens the collaborators commands talk to.
///
/// Nothing is connected until a command asks for it, so a command that only
/// reads checkpoints never needs the database or the fleet to be reachable.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn checkpoints(&self, config: &Config) -> Result<Box<dyn CheckpointsDb>>;

    async fn checkpoints_exist(&self, config: &Config) -> Result<bool>;

    fn store_directory(&self, config: &Config) -> Result<Arc<dyn StoreDirectory>>;

    fn store_admin(&self, config: &Config) -> Result<Arc<dyn StoreAdmin>>;

    fn import_backend(&self, config: &Config) -> Result<Arc<dyn ImportBackend>>;

    async fn target(&self, config: &Config) -> Result<Box<dyn TargetDatabase>>;
}

/// Connects to the real cluster.
pub struct LiveConnector;

#[async_trait]
impl Connector for LiveConnector {
    async fn checkpoints(&self, config: &Config) -> Result<Box<dyn CheckpointsDb>> {
        open_checkpoints_db(config).await
    }

    async fn checkpoints_exist(&self, config: &Config) -> Result<bool> {
        is_checkpoints_db_exists(config).await
    }

    fn store_directory(&self, config: &Config) -> Result<Arc<dyn StoreDirectory>> {
        Ok(Arc::new(PdClient::new(&config.cluster, &config.security)?))
    }

    fn store_admin(&self, config: &Config) -> Result<Arc<dyn StoreAdmin>> {
        Ok(Arc::new(HttpStoreAdmin::new(&config.cluster, &config.security)?))
    }

    fn import_backend(&self, config: &Config) -> Result<Arc<dyn ImportBackend>> {
        backend_from_config(config)
    }

    async fn target(&self, config: &Config) -> Result<Box<dyn TargetDatabase>> {
        Ok(Box::new(
            MySqlTarget::connect(&config.tidb, config.cluster.timeout()).await?,
        ))
    }
}

/// Shared state of one command invocation.
pub struct CommandContext {
    pub config: Config,
    pub cancel: CancellationToken,
    connector: Arc<dyn Connector>,
    terminator: Arc<dyn Terminator>,
    report: Mutex<Box<dyn Write + Send>>,
    show_progress: bool,
}

impl CommandContext {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        terminator: Arc<dyn Terminator>,
        report: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            connector,
            terminator,
            report: Mutex::new(report),
            show_progress: false,
        }
    }

    /// Draw progress bars on stderr for long loops.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Write one line to the operator-facing report stream.
    pub fn say(&self, line: impl Display) {
        let mut report = match self.report.lock() {
            Ok(report) => report,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(report, "{line}").and_then(|_| report.flush()) {
            debug!(error = %e, "Failed to write report line");
        }
    }

    pub fn terminate(&self, code: i32) {
        self.terminator.exit(code);
    }

    /// Progress bar over `len` items, hidden unless progress is enabled.
    pub fn progress_bar(&self, len: u64, message: &'static str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::hidden());
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(message);
        pb
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::backend::CleanupStrategy;
    use tempfile::TempDir;

    #[test]
    fn test_say_writes_lines() {
        let temp = TempDir::new().unwrap();
        let harness = Harness::new(
            &temp,
            connector(
                Vec::new(),
                FakeAdmin::default(),
                FakeBackend::new(CleanupStrategy::CloseThenCleanup),
            ),
        );
        harness.ctx.say("first");
        harness.ctx.say(format_args!("second {}", 2));
        assert_eq!(harness.output.contents(), "first\nsecond 2\n");
    }

    #[test]
    fn test_terminate_goes_through_terminator() {
        let temp = TempDir::new().unwrap();
        let harness = Harness::new(
            &temp,
            connector(
                Vec::new(),
                FakeAdmin::default(),
                FakeBackend::new(CleanupStrategy::CloseThenCleanup),
            ),
        );
        harness.ctx.terminate(1);
        assert_eq!(*harness.terminator.0.lock().unwrap(), vec![1]);
    }
}
