//! App - アプリケーションロジック
//!
//! ports の上に組み立てるオーケストレーション層。
//!
//! - **TaskManager**: タスクレコードとイベントログ
//! - **ProgressBroadcaster**: 進捗イベントの購読者への配信
//! - **NodeWorkerPool**: ノード単位の並列実行（上限付き）
//! - **StageRunner**: 1 ステージをノード集合に対して実行
//! - **DeploymentOrchestrator**: タスクをパイプラインに沿って進める
//! - **Engine** / **EngineBuilder**: 呼び出し側の窓口とワイヤリング

pub mod broadcaster;
pub mod builder;
pub mod engine;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod stage;
pub mod tasks;

pub use self::broadcaster::{ProgressBroadcaster, Snapshot, Subscription};
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::Engine;
pub use self::orchestrator::DeploymentOrchestrator;
pub use self::pipeline::{DEFAULT_STAGES, Pipeline, default_pipeline};
pub use self::pool::{NodeWorkerPool, PoolRun};
pub use self::stage::{
    ActionOutput, CommandAction, DetectOsAction, FactsByNode, NodeAction, Stage, StagePolicy,
    StagePosition, StageResult, StageRunner, StageStatus,
};
pub use self::tasks::TaskManager;
