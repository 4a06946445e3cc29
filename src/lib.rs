//! # pglog-replay
//!
//! 把 PostgreSQL CSV 日志转换为紧凑的回放 trace，并按原始语句间隔（可加速）重放到数据库。
//!
//! ## 功能特性
//!
//! - **紧凑 trace**: 十六进制时间戳、SQL 文本去重为整数 id、带类型标记的参数
//! - **流式读取**: 固定缓冲区，记录跨读取边界时只拷贝未消费的尾部
//! - **事务还原**: 按 VXID 把语句归组为显式 / 隐式事务，保留回滚标志
//! - **定时回放**: 以事务开始时刻为锚点，按 `speedup` 缩放原始间隔，sleep 后重新校正
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use pglog_replay::{ReplayConfig, Replayer, TraceManager, run_workers};
//! use pglog_replay::replayer::{ExecuteResult, Statement};
//! use pglog_replay::TypedValue;
//!
//! let config = ReplayConfig::new("/var/log/postgresql/postgresql.csv")
//!     .with_speedup(2.0)
//!     .with_workers(4);
//! let manager = TraceManager::new(config.clone())?;
//! let queue = manager.load()?;
//!
//! let replayer = Replayer::from_config(&config);
//! let summary = run_workers(&queue, &replayer, config.workers, |_worker| {
//!     |statement: &Statement<'_>, params: &[TypedValue]| -> ExecuteResult {
//!         println!("{} {:?}", statement.sql, params);
//!         Ok(())
//!     }
//! })?;
//! println!("committed {}, aborted {}", summary.committed, summary.aborted);
//! # Ok::<(), pglog_replay::ReplayError>(())
//! ```
//!
//! ## trace 格式
//!
//! ```text
//! 179a0eb4aef55780,"BEGIN",""
//! 179a0eb4af3c8a40,"0","i'42'v'it''s'"
//! 179a0eb4afa62380,"COMMIT",""
//! #
//! 0,"INSERT INTO t VALUES (?, ?)"
//! ```

pub mod config;
pub mod converter;
pub mod error;
pub mod loader;
pub mod pglog;
pub mod queue;
pub mod replayer;
pub mod tools;
pub mod trace;
pub mod transaction;

pub use config::ReplayConfig;
pub use converter::{ConvertSummary, LogConverter, convert};
pub use error::{ExecutionError, ReplayError, Result};
pub use loader::{LoadedTrace, TraceLoader, TraceManager, TracePlan, plan_trace};
pub use queue::ReplayQueue;
pub use replayer::{
    ReplayOutcome, ReplaySummary, Replayer, Statement, StatementExecutor, replay, run_workers,
};
pub use tools::{LogTimestampParser, hex_to_i64, i64_to_hex};
pub use trace::{StatementTag, TraceReader, TraceRecord, TypedValue};
pub use transaction::{CallTarget, ReplayTransaction, StatementCall, StatementKey, StatementTable};
