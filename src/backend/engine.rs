//! Engine lifecycle: typed handles over an [`ImportBackend`] plus a registry
//! of the state every engine touched in this process is in.

use super::{make_uuid, EngineRef, ImportBackend, KvPair};
use crate::models::{LodeError, Result, TableName};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where an engine is in its lifecycle.
///
/// Engines move forward through open, writing, closed, importing and
/// imported. A failed import drops back to closed. Any engine that is
/// closed or later can be cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Open,
    Writing,
    Closed,
    Importing,
    Imported,
    CleanedUp,
}

impl EngineState {
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Open, Writing)
                | (Open, Closed)
                | (Writing, Writing)
                | (Writing, Closed)
                | (Closed, Importing)
                // failed import, engine stays importable
                | (Importing, Closed)
                | (Importing, Imported)
                | (Closed, CleanedUp)
                | (Importing, CleanedUp)
                | (Imported, CleanedUp)
                | (CleanedUp, CleanedUp)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Writing => "writing",
            Self::Closed => "closed",
            Self::Importing => "importing",
            Self::Imported => "imported",
            Self::CleanedUp => "cleaned-up",
        };
        f.write_str(s)
    }
}

/// Hands out engine handles and tracks their state.
pub struct EngineManager {
    backend: Arc<dyn ImportBackend>,
    states: DashMap<Uuid, EngineState>,
}

impl EngineManager {
    pub fn new(backend: Arc<dyn ImportBackend>) -> Self {
        Self {
            backend,
            states: DashMap::new(),
        }
    }

    /// Last known state, `None` for engines this process never touched.
    pub fn state(&self, uuid: &Uuid) -> Option<EngineState> {
        self.states.get(uuid).map(|entry| *entry)
    }

    /// Move a tracked engine to `to`.
    fn transition(&self, tag: &str, uuid: Uuid, to: EngineState) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(&uuid)
            .ok_or_else(|| LodeError::NotFound(format!("engine {tag} is not tracked")))?;
        let from = *entry;
        if !from.can_transition_to(to) {
            return Err(LodeError::InvalidTransition {
                engine: tag.to_string(),
                from,
                to,
            });
        }
        *entry = to;
        Ok(())
    }

    fn force(&self, uuid: Uuid, to: EngineState) {
        self.states.insert(uuid, to);
    }

    /// Open a new engine for writing.
    pub async fn open_engine(&self, table: &TableName, engine_id: i32) -> Result<OpenEngine<'_>> {
        let (tag, uuid) = make_uuid(table, engine_id);
        if let Some(state) = self.state(&uuid) {
            if state != EngineState::CleanedUp {
                return Err(LodeError::InvalidTransition {
                    engine: tag,
                    from: state,
                    to: EngineState::Open,
                });
            }
        }
        self.backend.open_engine(uuid).await?;
        self.force(uuid, EngineState::Open);
        debug!(engine = %tag, %uuid, "Opened engine");
        Ok(OpenEngine {
            manager: self,
            tag,
            uuid,
        })
    }

    /// Force an engine into `Closed` without validating its writer.
    ///
    /// Used by recovery, where the process that wrote the engine is gone.
    pub async fn unsafe_close_engine(
        &self,
        table: &TableName,
        engine_id: i32,
    ) -> Result<ClosedEngine<'_>> {
        let (tag, uuid) = make_uuid(table, engine_id);
        self.unsafe_close_engine_with_uuid(tag, uuid).await
    }

    /// [`Self::unsafe_close_engine`] for an engine known only by UUID.
    pub async fn unsafe_close_engine_with_uuid(
        &self,
        tag: impl Into<String>,
        uuid: Uuid,
    ) -> Result<ClosedEngine<'_>> {
        let tag = tag.into();
        self.backend.close_engine(uuid).await?;
        match self.state(&uuid) {
            // already past writing; keep so a re-import stays a no-op
            Some(EngineState::Importing | EngineState::Imported | EngineState::CleanedUp) => {}
            _ => self.force(uuid, EngineState::Closed),
        }
        debug!(engine = %tag, %uuid, "Force-closed engine");
        Ok(ClosedEngine {
            manager: self,
            tag,
            uuid,
        })
    }

    /// Force-close whatever `engine` refers to.
    pub async fn close_engine_ref(&self, engine: &EngineRef) -> Result<ClosedEngine<'_>> {
        let (tag, uuid) = engine.resolve();
        self.unsafe_close_engine_with_uuid(tag, uuid).await
    }
}

/// An engine accepting writes.
pub struct OpenEngine<'a> {
    manager: &'a EngineManager,
    tag: String,
    uuid: Uuid,
}

impl<'a> OpenEngine<'a> {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn write(&self, pairs: Vec<KvPair>) -> Result<()> {
        self.manager
            .transition(&self.tag, self.uuid, EngineState::Writing)?;
        self.manager.backend.write_rows(self.uuid, pairs).await
    }

    /// Finish writing. The handle is consumed; only a closed engine can be
    /// imported.
    pub async fn close(self) -> Result<ClosedEngine<'a>> {
        self.manager
            .transition(&self.tag, self.uuid, EngineState::Closed)?;
        self.manager.backend.close_engine(self.uuid).await?;
        debug!(engine = %self.tag, "Closed engine");
        Ok(ClosedEngine {
            manager: self.manager,
            tag: self.tag,
            uuid: self.uuid,
        })
    }
}

/// An engine that no longer accepts writes.
pub struct ClosedEngine<'a> {
    manager: &'a EngineManager,
    tag: String,
    uuid: Uuid,
}

impl ClosedEngine<'_> {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Ingest the engine into the fleet. Re-importing is a no-op.
    pub async fn import(&self, cancel: &CancellationToken, region_split_size: u64) -> Result<()> {
        if self.manager.state(&self.uuid) == Some(EngineState::Imported) {
            debug!(engine = %self.tag, "Engine already imported");
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(LodeError::Cancelled);
        }

        self.manager
            .transition(&self.tag, self.uuid, EngineState::Importing)?;
        info!(
            engine = %self.tag,
            uuid = %self.uuid,
            backend = self.manager.backend.name(),
            "Importing engine"
        );

        match self
            .manager
            .backend
            .import_engine(cancel, self.uuid, region_split_size)
            .await
        {
            Ok(()) => {
                self.manager.force(self.uuid, EngineState::Imported);
                info!(engine = %self.tag, "Engine imported");
                Ok(())
            }
            Err(e) => {
                self.manager.force(self.uuid, EngineState::Closed);
                warn!(engine = %self.tag, error = %e, "Engine import failed");
                Err(e)
            }
        }
    }

    /// Release the engine's resources. Cleaning up twice succeeds.
    pub async fn cleanup(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LodeError::Cancelled);
        }
        if let Some(from) = self.manager.state(&self.uuid) {
            if !from.can_transition_to(EngineState::CleanedUp) {
                return Err(LodeError::InvalidTransition {
                    engine: self.tag.clone(),
                    from,
                    to: EngineState::CleanedUp,
                });
            }
        }
        self.manager.backend.cleanup_engine(self.uuid).await?;
        self.manager.force(self.uuid, EngineState::CleanedUp);
        info!(engine = %self.tag, backend = self.manager.backend.name(), "Engine cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CleanupStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend counting calls; imports fail while `fail_import` is set.
    #[derive(Default)]
    struct CountingBackend {
        imports: AtomicUsize,
        cleanups: AtomicUsize,
        fail_import: AtomicBool,
    }

    #[async_trait]
    impl ImportBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn cleanup_strategy(&self) -> CleanupStrategy {
            CleanupStrategy::CloseThenCleanup
        }

        async fn open_engine(&self, _uuid: Uuid) -> Result<()> {
            Ok(())
        }

        async fn write_rows(&self, _uuid: Uuid, _pairs: Vec<KvPair>) -> Result<()> {
            Ok(())
        }

        async fn close_engine(&self, _uuid: Uuid) -> Result<()> {
            Ok(())
        }

        async fn import_engine(
            &self,
            _cancel: &CancellationToken,
            _uuid: Uuid,
            _region_split_size: u64,
        ) -> Result<()> {
            self.imports.fetch_add(1, Ordering::SeqCst);
            if self.fail_import.load(Ordering::SeqCst) {
                return Err(LodeError::Remote {
                    status: 500,
                    message: "ingest failed".into(),
                });
            }
            Ok(())
        }

        async fn cleanup_engine(&self, _uuid: Uuid) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn table() -> TableName {
        TableName::new("db", "t")
    }

    #[test]
    fn test_state_machine() {
        use EngineState::*;
        assert!(Open.can_transition_to(Writing));
        assert!(Writing.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Importing));
        assert!(Importing.can_transition_to(Imported));
        assert!(Imported.can_transition_to(CleanedUp));
        assert!(Closed.can_transition_to(CleanedUp));

        assert!(!Open.can_transition_to(Importing));
        assert!(!Writing.can_transition_to(Imported));
        assert!(!Imported.can_transition_to(Writing));
        assert!(!CleanedUp.can_transition_to(Open));
        assert!(!Open.can_transition_to(CleanedUp));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let backend = Arc::new(CountingBackend::default());
        let manager = EngineManager::new(backend.clone());
        let cancel = CancellationToken::new();

        let open = manager.open_engine(&table(), 0).await.unwrap();
        open.write(vec![KvPair::new("a", "1")]).await.unwrap();
        let uuid = open.uuid();
        assert_eq!(manager.state(&uuid), Some(EngineState::Writing));

        let closed = open.close().await.unwrap();
        closed.import(&cancel, 1024).await.unwrap();
        assert_eq!(manager.state(&uuid), Some(EngineState::Imported));

        closed.cleanup(&cancel).await.unwrap();
        assert_eq!(manager.state(&uuid), Some(EngineState::CleanedUp));
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reimport_is_noop() {
        let backend = Arc::new(CountingBackend::default());
        let manager = EngineManager::new(backend.clone());
        let cancel = CancellationToken::new();

        let closed = manager.unsafe_close_engine(&table(), 1).await.unwrap();
        closed.import(&cancel, 1024).await.unwrap();
        closed.import(&cancel, 1024).await.unwrap();
        assert_eq!(backend.imports.load(Ordering::SeqCst), 1);

        // force-closing again must not make it importable twice
        let again = manager.unsafe_close_engine(&table(), 1).await.unwrap();
        again.import(&cancel, 1024).await.unwrap();
        assert_eq!(backend.imports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_import_can_be_retried() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail_import.store(true, Ordering::SeqCst);
        let manager = EngineManager::new(backend.clone());
        let cancel = CancellationToken::new();

        let closed = manager.unsafe_close_engine(&table(), 0).await.unwrap();
        assert!(closed.import(&cancel, 1024).await.is_err());
        assert_eq!(manager.state(&closed.uuid()), Some(EngineState::Closed));

        backend.fail_import.store(false, Ordering::SeqCst);
        closed.import(&cancel, 1024).await.unwrap();
        assert_eq!(manager.state(&closed.uuid()), Some(EngineState::Imported));
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let manager = EngineManager::new(Arc::new(CountingBackend::default()));
        let open = manager.open_engine(&table(), 0).await.unwrap();
        let uuid = open.uuid();
        let tag = open.tag().to_string();
        open.close().await.unwrap();

        let err = manager
            .transition(&tag, uuid, EngineState::Writing)
            .unwrap_err();
        assert!(matches!(
            err,
            LodeError::InvalidTransition {
                from: EngineState::Closed,
                to: EngineState::Writing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_import_does_not_call_backend() {
        let backend = Arc::new(CountingBackend::default());
        let manager = EngineManager::new(backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let closed = manager.unsafe_close_engine(&table(), 0).await.unwrap();
        assert!(matches!(
            closed.import(&cancel, 1024).await,
            Err(LodeError::Cancelled)
        ));
        assert_eq!(backend.imports.load(Ordering::SeqCst), 0);
    }
}
