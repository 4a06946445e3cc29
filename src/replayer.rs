//! 按原始节奏回放事务
//!
//! 每个事务以开始回放的时刻 `t0` 为锚点：第 k 条语句的目标时间是
//! `t0 + (call_time_k - first_log_time) / speedup`。
//! 排队等待的事务开始后仍然保持自己内部的语句间隔，不会被压缩成一次突发。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::ReplayConfig;
use crate::error::{ExecutionError, ReplayError, Result};
use crate::queue::ReplayQueue;
use crate::trace::TypedValue;
use crate::transaction::{CallTarget, ReplayTransaction, StatementKey, StatementTable};

/// 单次 sleep 的上限，停止请求最多延迟这么久生效
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(5);

/// 距目标时间小于该值时不再 sleep，改为让出 CPU 直到到点
const SPIN_THRESHOLD: Duration = Duration::from_micros(500);

/// 执行器单次调用的结果
pub type ExecuteResult = std::result::Result<(), ExecutionError>;

/// 交给执行器的语句
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement<'a> {
    pub key: StatementKey,
    pub sql: &'a str,
}

/// 外部执行器（数据库驱动层）
///
/// 只需实现 `execute`；`begin` / `commit` / `rollback` 由 [`run_workers`]
/// 在显式事务前后调用，默认什么都不做。
pub trait StatementExecutor {
    fn execute(&mut self, statement: &Statement<'_>, params: &[TypedValue]) -> ExecuteResult;

    fn begin(&mut self) -> ExecuteResult {
        Ok(())
    }

    fn commit(&mut self) -> ExecuteResult {
        Ok(())
    }

    fn rollback(&mut self) -> ExecuteResult {
        Ok(())
    }
}

impl<F> StatementExecutor for F
where
    F: FnMut(&Statement<'_>, &[TypedValue]) -> ExecuteResult,
{
    fn execute(&mut self, statement: &Statement<'_>, params: &[TypedValue]) -> ExecuteResult {
        self(statement, params)
    }
}

/// 单个事务的回放结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// 所有语句执行成功，应当提交
    Committed,
    /// 所有语句执行成功，但原始事务以 ROLLBACK 结束，应当回滚
    Aborted,
    /// 收到停止请求，事务未执行完
    Cancelled,
}

/// 定时回放器
///
/// 可以 clone 给多个 worker，停止标志是共享的。
#[derive(Debug, Clone)]
pub struct Replayer {
    speedup_limited: bool,
    speedup: f64,
    stop: Arc<AtomicBool>,
}

impl Replayer {
    /// `speedup` 非正数或非有限值时按 1.0 处理
    pub fn new(speedup_limited: bool, speedup: f64) -> Self {
        let speedup = if speedup.is_finite() && speedup > 0.0 {
            speedup
        } else {
            1.0
        };
        Self {
            speedup_limited,
            speedup,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &ReplayConfig) -> Self {
        Self::new(config.speedup_limited, config.speedup)
    }

    pub fn speedup(&self) -> f64 {
        self.speedup
    }

    /// 共享的停止标志，置位后回放在下一个语句间隙或 sleep 片段结束时停止
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// 语句相对事务开始的目标偏移
    pub fn target_offset(&self, first_log_time: i64, call_time: i64) -> Duration {
        let delta = call_time.saturating_sub(first_log_time).max(0);
        Duration::from_nanos((delta as f64 / self.speedup) as u64)
    }

    /// 等到 `target`；期间收到停止请求返回 `false`
    ///
    /// sleep 可能提前返回，所以每次醒来都重新检查时间。目标已经过去时立即返回。
    fn pace_until(&self, target: Instant) -> bool {
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= target {
                return true;
            }
            let remaining = target - now;
            if remaining > SPIN_THRESHOLD {
                thread::sleep((remaining - SPIN_THRESHOLD).min(MAX_SLEEP_SLICE));
            } else {
                thread::yield_now();
            }
        }
    }

    /// 回放一个事务
    ///
    /// 语句按顺序出队执行，语句之间按原始间隔等待。显式事务的 COMMIT / ROLLBACK
    /// 只参与节奏控制，不交给执行器；是否提交由返回值告诉调用方。
    ///
    /// # 错误
    ///
    /// - 执行器返回错误：`Execution { index, .. }`，不重试
    /// - 语句键无法解析：`UnresolvedStatement`
    /// - 显式事务没有结束标志：`AbortFlagUnset`
    pub fn replay<E>(&self, mut txn: ReplayTransaction, statements: &StatementTable, executor: &mut E) -> Result<ReplayOutcome>
    where
        E: StatementExecutor + ?Sized,
    {
        let t0 = Instant::now();
        let first_log_time = txn.first_log_time();
        let mut index = 0;

        while let Some(call) = txn.pop_call() {
            if self.is_stopped() {
                return Ok(ReplayOutcome::Cancelled);
            }
            if self.speedup_limited {
                let target = t0 + self.target_offset(first_log_time, call.call_time);
                if !self.pace_until(target) {
                    return Ok(ReplayOutcome::Cancelled);
                }
            }

            let CallTarget::Statement(key) = call.target else {
                continue;
            };
            let sql = statements.resolve(key).ok_or(ReplayError::UnresolvedStatement {
                id: match key {
                    StatementKey::Interned(id) | StatementKey::Inline(id) => id,
                },
            })?;
            executor
                .execute(&Statement { key, sql }, &call.params)
                .map_err(|source| ReplayError::Execution { index, source })?;
            index += 1;
        }

        if txn.should_abort()? {
            Ok(ReplayOutcome::Aborted)
        } else {
            Ok(ReplayOutcome::Committed)
        }
    }
}

/// 用默认的停止标志回放单个事务
pub fn replay<E>(
    txn: ReplayTransaction,
    statements: &StatementTable,
    speedup_limited: bool,
    speedup: f64,
    executor: &mut E,
) -> Result<ReplayOutcome>
where
    E: StatementExecutor + ?Sized,
{
    Replayer::new(speedup_limited, speedup).replay(txn, statements, executor)
}

/// worker 回放统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub committed: usize,
    pub aborted: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ReplaySummary {
    pub fn total(&self) -> usize {
        self.committed + self.aborted + self.failed + self.cancelled
    }
}

#[derive(Default)]
struct Counters {
    committed: AtomicUsize,
    aborted: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> ReplaySummary {
        ReplaySummary {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// 用 `workers` 个线程并发消费队列直到队列为空或收到停止请求
///
/// 每个 worker 通过 `make_executor(worker_index)` 创建自己的执行器（通常对应一个数据库连接）。
/// 显式事务前调用 `begin`，按回放结果调用 `commit` 或 `rollback`；
/// 执行失败的事务计入 `failed` 并继续下一个。
pub fn run_workers<E, F>(queue: &ReplayQueue, replayer: &Replayer, workers: usize, make_executor: F) -> Result<ReplaySummary>
where
    E: StatementExecutor,
    F: Fn(usize) -> E + Sync,
{
    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("replay-worker-{i}"))
        .build()
        .map_err(|e| ReplayError::InvalidConfig(format!("cannot start worker pool: {e}")))?;

    let counters = Counters::default();
    let statements = queue.statements();

    pool.scope(|scope| {
        for worker in 0..workers {
            let counters = &counters;
            let make_executor = &make_executor;
            scope.spawn(move |_| {
                let mut executor = make_executor(worker);
                while !replayer.is_stopped() {
                    let Some(txn) = queue.try_pop() else {
                        break;
                    };
                    run_one(worker, txn, statements, replayer, &mut executor, counters);
                }
            });
        }
    });

    let summary = counters.summary();
    debug!("replay finished: {summary:?}");
    Ok(summary)
}

fn run_one<E: StatementExecutor>(
    worker: usize,
    txn: ReplayTransaction,
    statements: &StatementTable,
    replayer: &Replayer,
    executor: &mut E,
    counters: &Counters,
) {
    let explicit = txn.is_explicit();
    if explicit {
        if let Err(e) = executor.begin() {
            warn!("worker {worker}: begin failed: {e}");
            Counters::bump(&counters.failed);
            return;
        }
    }

    let finish = |executor: &mut E, commit: bool| {
        if !explicit {
            return Ok(());
        }
        if commit {
            executor.commit()
        } else {
            executor.rollback()
        }
    };

    match replayer.replay(txn, statements, executor) {
        Ok(ReplayOutcome::Committed) => match finish(executor, true) {
            Ok(()) => Counters::bump(&counters.committed),
            Err(e) => {
                warn!("worker {worker}: commit failed: {e}");
                Counters::bump(&counters.failed);
            }
        },
        Ok(ReplayOutcome::Aborted) => {
            if let Err(e) = finish(executor, false) {
                warn!("worker {worker}: rollback failed: {e}");
            }
            Counters::bump(&counters.aborted);
        }
        Ok(ReplayOutcome::Cancelled) => {
            let _ = finish(executor, false);
            Counters::bump(&counters.cancelled);
        }
        Err(e) => {
            warn!("worker {worker}: transaction failed: {e}");
            let _ = finish(executor, false);
            Counters::bump(&counters.failed);
        }
    }
}
