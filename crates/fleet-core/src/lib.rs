//! fleet-core
//!
//! Orchestration engine for unattended fleet provisioning.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, node, task, events, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, RemoteExecutor, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（tasks, broadcaster, pool, stage, pipeline, orchestrator, engine, builder）
//! - **impls**: 実装（InMemoryTaskStore, SshExecutor）
//! - **cancel**: 協調的キャンセル（watch ベース）
//! - **config**: TOML 設定の読み込みと検証
//! - **observability**: ステータス別の集計ビュー

pub mod app;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
