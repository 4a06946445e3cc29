//! trace 加载
//!
//! [`TraceLoader`] 用流式读取器把整个 trace 读入内存，重建事务和语句表；
//! [`TraceManager`] 负责决定重新转换还是复用已有 trace，并保证只加载一次。

use std::collections::{BTreeSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;

use crate::config::ReplayConfig;
use crate::converter::LogConverter;
use crate::error::{ReplayError, Result};
use crate::queue::ReplayQueue;
use crate::trace::reader::DEFAULT_BUFFER_CAPACITY;
use crate::trace::{StatementTag, TraceReader};
use crate::transaction::{ReplayTransaction, StatementCall, StatementKey, StatementTable};

/// 加载结果
#[derive(Debug, Default)]
pub struct LoadedTrace {
    pub transactions: VecDeque<ReplayTransaction>,
    pub statements: StatementTable,
}

/// trace 文件加载器
#[derive(Debug, Clone)]
pub struct TraceLoader {
    buffer_capacity: usize,
}

impl Default for TraceLoader {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

fn open_existing(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ReplayError::FileNotFound {
            path: path.display().to_string(),
        },
        _ => e.into(),
    })
}

/// trace 中没有 VXID，用记录序号标识出错位置
fn record_label(index: usize) -> String {
    format!("trace record #{index}")
}

impl TraceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn load_path(&self, path: &Path) -> Result<LoadedTrace> {
        let loaded = self.load_from(open_existing(path)?)?;
        info!(
            "loaded {} transactions, {} statements from {}",
            loaded.transactions.len(),
            loaded.statements.interned_len(),
            path.display()
        );
        Ok(loaded)
    }

    /// 读取完整的 trace
    ///
    /// 记录段中事务是连续的：BEGIN 到 COMMIT / ROLLBACK 之间的记录都属于同一事务，
    /// 段外的单条语句各自构成隐式事务。
    ///
    /// # 错误
    ///
    /// 记录损坏、事务边界不配对、字符串表重复 id、引用的 id 在字符串表中缺失或为空，
    /// 都会使加载失败。
    pub fn load_from<R: Read>(&self, source: R) -> Result<LoadedTrace> {
        let mut reader = TraceReader::with_capacity(source, self.buffer_capacity);
        let mut transactions = VecDeque::new();
        let mut statements = StatementTable::new();
        let mut referenced = BTreeSet::new();
        let mut open: Option<ReplayTransaction> = None;
        let mut index = 0;

        while let Some(record) = reader.read_record()? {
            index += 1;
            let key = match record.tag {
                StatementTag::Begin => {
                    if open.is_some() {
                        return Err(ReplayError::DuplicateBegin {
                            vxid: record_label(index),
                        });
                    }
                    open = Some(ReplayTransaction::explicit(record.log_time));
                    continue;
                }
                tag @ (StatementTag::Commit | StatementTag::Rollback) => {
                    let mut txn = open.take().ok_or_else(|| ReplayError::EndWithoutBegin {
                        vxid: record_label(index),
                    })?;
                    txn.push_call(StatementCall::end(record.log_time));
                    txn.set_abort(tag == StatementTag::Rollback)?;
                    transactions.push_back(txn);
                    continue;
                }
                StatementTag::Id(id) => {
                    referenced.insert(id);
                    StatementKey::Interned(id)
                }
                StatementTag::Inline(sql) => {
                    if sql.trim().is_empty() {
                        return Err(ReplayError::MalformedRecord {
                            offset: record.end_offset,
                            reason: "empty statement text",
                        });
                    }
                    statements.push_inline(sql)
                }
            };

            let call = StatementCall::statement(key, record.params, record.log_time);
            match open.as_mut() {
                Some(txn) => txn.push_call(call),
                None => transactions.push_back(ReplayTransaction::implicit(call)),
            }
        }
        if open.is_some() {
            return Err(ReplayError::IncompleteTransaction);
        }

        if reader.skip_section_delimiter()? {
            while let Some(entry) = reader.read_statement_entry()? {
                statements.insert_interned(entry.id, entry.sql)?;
            }
        }

        for &id in &referenced {
            match statements.resolve(StatementKey::Interned(id)) {
                Some(sql) if !sql.trim().is_empty() => {}
                _ => return Err(ReplayError::UnresolvedStatement { id }),
            }
        }
        let unused = statements
            .interned_ids()
            .filter(|id| !referenced.contains(id))
            .count();
        if unused > 0 {
            warn!("{unused} string table entries are not referenced by any record");
        }

        Ok(LoadedTrace {
            transactions,
            statements,
        })
    }
}

/// trace 来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePlan {
    /// 从日志重新转换
    Convert,
    /// 直接使用已有 trace
    Reuse,
}

fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 决定重新转换还是复用
///
/// - 日志比 trace 新，或 trace 不存在：重新转换
/// - 日志不存在但 trace 存在：复用
/// - 两者都不存在：`MissingInputs`
pub fn plan_trace(log_path: &Path, trace_path: &Path) -> Result<TracePlan> {
    let plan = match (modified(log_path)?, modified(trace_path)?) {
        (None, None) => {
            return Err(ReplayError::MissingInputs {
                log: log_path.display().to_string(),
                trace: trace_path.display().to_string(),
            });
        }
        (None, Some(_)) => TracePlan::Reuse,
        (Some(_), None) => TracePlan::Convert,
        (Some(log_time), Some(trace_time)) => {
            debug!("log modified {log_time:?}, trace modified {trace_time:?}");
            if log_time > trace_time {
                TracePlan::Convert
            } else {
                TracePlan::Reuse
            }
        }
    };
    Ok(plan)
}

/// 加载入口：转换或复用 trace，加载一次，之后提供队列访问
///
/// `load` 成功之前调用 `peek` / `pop` 返回 `NotLoaded`。
#[derive(Debug)]
pub struct TraceManager {
    config: ReplayConfig,
    trace_path: PathBuf,
    queue: OnceCell<Arc<ReplayQueue>>,
    load_lock: Mutex<()>,
}

impl TraceManager {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        config.validate()?;
        let trace_path = config.trace_path()?;
        Ok(Self {
            config,
            trace_path,
            queue: OnceCell::new(),
            load_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn trace_path(&self) -> &Path {
        &self.trace_path
    }

    /// 准备 trace 并加载，只能成功调用一次
    pub fn load(&self) -> Result<Arc<ReplayQueue>> {
        let _guard = self.load_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.queue.get().is_some() {
            return Err(ReplayError::AlreadyLoaded);
        }

        match plan_trace(&self.config.log_path, &self.trace_path)? {
            TracePlan::Convert => {
                info!("trace missing or older than the log, converting");
                LogConverter::new()
                    .with_progress(self.config.show_progress)
                    .convert(&self.config.log_path, &self.trace_path)?;
            }
            TracePlan::Reuse => info!("reusing trace {}", self.trace_path.display()),
        }

        let loaded = TraceLoader::new()
            .with_buffer_capacity(self.config.read_buffer_capacity)
            .load_path(&self.trace_path)?;
        let queue = Arc::new(ReplayQueue::new(loaded.transactions, loaded.statements));
        // 已持有 load_lock，不会有并发的 set
        let _ = self.queue.set(Arc::clone(&queue));
        Ok(queue)
    }

    pub fn is_loaded(&self) -> bool {
        self.queue.get().is_some()
    }

    /// 已加载的队列
    pub fn queue(&self) -> Result<&Arc<ReplayQueue>> {
        self.queue.get().ok_or(ReplayError::NotLoaded)
    }

    /// 在锁内查看队首事务
    pub fn peek<T>(&self, f: impl FnOnce(&ReplayTransaction) -> T) -> Result<Option<T>> {
        Ok(self.queue()?.front(f))
    }

    pub fn pop(&self) -> Result<Option<ReplayTransaction>> {
        Ok(self.queue()?.try_pop())
    }

    pub fn statements(&self) -> Result<Arc<StatementTable>> {
        Ok(Arc::clone(self.queue()?.statements()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Result<LoadedTrace> {
        TraceLoader::new().load_from(text.as_bytes())
    }

    #[test]
    fn explicit_and_implicit() {
        let loaded = load(concat!(
            "10,\"BEGIN\",\"\"\n",
            "15,\"0\",\"i'1'\"\n",
            "1c,\"ROLLBACK\",\"\"\n",
            "20,\"1\",\"\"\n",
            "#\n",
            "0,\"INSERT INTO t VALUES (?)\"\n",
            "1,\"SELECT 1\"\n",
        ))
        .unwrap();
        assert_eq!(loaded.transactions.len(), 2);
        let first = &loaded.transactions[0];
        assert!(first.is_explicit());
        assert_eq!(first.first_log_time(), 0x10);
        assert_eq!(first.should_abort(), Ok(true));
        assert_eq!(first.len(), 2);
        let second = &loaded.transactions[1];
        assert!(!second.is_explicit());
        assert_eq!(second.should_abort(), Ok(false));
        assert_eq!(loaded.statements.interned_len(), 2);
    }

    #[test]
    fn inline_statements() {
        let loaded = load("1,\"SELECT 42\",\"\"\n").unwrap();
        let call = loaded.transactions[0].calls().next().cloned().unwrap();
        assert_eq!(call.target, crate::transaction::CallTarget::Statement(StatementKey::Inline(0)));
        assert_eq!(loaded.statements.resolve(StatementKey::Inline(0)), Some("SELECT 42"));
    }

    #[test]
    fn boundary_errors() {
        assert!(matches!(
            load("1,\"BEGIN\",\"\"\n2,\"BEGIN\",\"\"\n"),
            Err(ReplayError::DuplicateBegin { .. })
        ));
        assert!(matches!(
            load("1,\"COMMIT\",\"\"\n"),
            Err(ReplayError::EndWithoutBegin { .. })
        ));
        assert_eq!(
            load("1,\"BEGIN\",\"\"\n#\n").unwrap_err(),
            ReplayError::IncompleteTransaction
        );
    }

    #[test]
    fn string_table_errors() {
        assert_eq!(
            load("1,\"99\",\"\"\n#\n0,\"SELECT 1\"\n").unwrap_err(),
            ReplayError::UnresolvedStatement { id: 99 }
        );
        assert_eq!(
            load("1,\"0\",\"\"\n#\n0,\"\"\n").unwrap_err(),
            ReplayError::UnresolvedStatement { id: 0 }
        );
        assert_eq!(
            load("1,\"0\",\"\"\n#\n0,\"a\"\n0,\"b\"\n").unwrap_err(),
            ReplayError::DuplicateStatementId { id: 0 }
        );
    }

    #[test]
    fn plan_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pg.csv");
        let trace = dir.path().join("pg.rply");

        assert!(matches!(
            plan_trace(&log, &trace),
            Err(ReplayError::MissingInputs { .. })
        ));

        fs::write(&trace, "#\n").unwrap();
        assert_eq!(plan_trace(&log, &trace).unwrap(), TracePlan::Reuse);

        fs::write(&log, "").unwrap();
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options().write(true).open(&trace).unwrap().set_modified(old).unwrap();
        assert_eq!(plan_trace(&log, &trace).unwrap(), TracePlan::Convert);

        fs::remove_file(&trace).unwrap();
        assert_eq!(plan_trace(&log, &trace).unwrap(), TracePlan::Convert);
    }

    #[test]
    fn queue_access_before_load() {
        let manager = TraceManager::new(ReplayConfig::new("/nonexistent/pg.csv")).unwrap();
        assert!(!manager.is_loaded());
        assert_eq!(manager.pop().unwrap_err(), ReplayError::NotLoaded);
        assert_eq!(manager.peek(|t| t.len()).unwrap_err(), ReplayError::NotLoaded);
        assert!(matches!(manager.load(), Err(ReplayError::MissingInputs { .. })));
        assert_eq!(manager.pop().unwrap_err(), ReplayError::NotLoaded);
    }
}
