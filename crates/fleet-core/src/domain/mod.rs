//! Domain - ドメインモデル
//!
//! - ids: 型付き ID（TaskId）
//! - state: タスクの状態
//! - task: タスクレコードと状態遷移
//! - events: ライフサイクルイベントとワイヤ形式
//! - node: ノードとステージ単位の結果
//! - errors: エラー型

pub mod errors;
pub mod events;
pub mod ids;
pub mod node;
pub mod state;
pub mod task;

pub use errors::{EngineError, ExecError, StoreError};
pub use events::{EventDraft, EventKind, EventPayload, TaskEvent};
pub use ids::{Id, IdMarker, ParseIdError, TaskId};
pub use node::{Node, NodeFacts, NodeOutcome, NodeStatus};
pub use state::TaskStatus;
pub use task::{Completion, NodeCounters, RETRY_TAG, TaskRecord, TaskSpec};
