//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: プロセス内メモリに保持する TaskStore（テスト・単一プロセス用）
//! - **SshExecutor**: システムの `ssh` クライアント経由でリモートコマンドを実行

pub mod inmem_store;
pub mod ssh_executor;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::ssh_executor::SshExecutor;
