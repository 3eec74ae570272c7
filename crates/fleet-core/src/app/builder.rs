//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast）: 設定は `build()` で検証する
//! - 省略可能な依存（Clock, IdGenerator）はデフォルト実装で補う

use std::sync::Arc;

use super::broadcaster::ProgressBroadcaster;
use super::engine::Engine;
use super::orchestrator::DeploymentOrchestrator;
use super::pool::NodeWorkerPool;
use super::tasks::TaskManager;
use crate::config::{ConfigError, EngineConfig, FleetConfig};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(config.engine.clone())
///     .store(Arc::new(InMemoryTaskStore::new()))
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            ids: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a `UlidGenerator` on the configured clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        FleetConfig {
            engine: self.config.clone(),
            ..FleetConfig::default()
        }
        .validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let broadcaster = Arc::new(ProgressBroadcaster::new(self.config.subscriber_buffer));
        let tasks = Arc::new(TaskManager::new(
            store,
            broadcaster,
            clock,
            ids,
            self.config.default_max_retries,
        ));
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            Arc::clone(&tasks),
            NodeWorkerPool::new(self.config.max_concurrency),
            self.config.output_limit,
            self.config.task_timeout(),
        ));
        Ok(Engine::new(tasks, orchestrator))
    }
}
