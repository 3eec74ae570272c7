//! Ports - 抽象化レイヤー
//!
//! エンジンが所有しない外部システムへのインターフェースを trait として定義します。
//!
//! - `TaskStore`: タスクレコードとイベントログの正本（source of truth）
//! - `RemoteExecutor`: リモートシェルでのコマンド実行
//! - `Clock` / `IdGenerator`: 時刻と ID（テストで差し替え可能）

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::RemoteExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Page, TaskFilter, TaskPage, TaskStore};
