//! 回放事务与语句表
//!
//! 事务只保存语句的键，SQL 文本统一存放在 [`StatementTable`] 中，通过键解析。

use std::collections::{HashMap, VecDeque};

use crate::error::{ReplayError, Result};
use crate::trace::TypedValue;

/// 语句键
///
/// 字符串表中的 id 与内联 SQL 的序号是两个独立的编号空间。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKey {
    /// trace 字符串表中的 id
    Interned(u32),
    /// 加载时收集的内联 SQL 序号
    Inline(u32),
}

/// 语句 id -> SQL 文本
///
/// 加载完成后只读，由所有 worker 通过 `Arc` 共享。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementTable {
    interned: HashMap<u32, String>,
    inline: Vec<String>,
}

impl StatementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记字符串表中的一行，重复 id 返回 `DuplicateStatementId`
    pub fn insert_interned(&mut self, id: u32, sql: String) -> Result<()> {
        if self.interned.contains_key(&id) {
            return Err(ReplayError::DuplicateStatementId { id });
        }
        self.interned.insert(id, sql);
        Ok(())
    }

    /// 保存一条内联 SQL，返回它的键
    pub fn push_inline(&mut self, sql: String) -> StatementKey {
        self.inline.push(sql);
        StatementKey::Inline((self.inline.len() - 1) as u32)
    }

    pub fn resolve(&self, key: StatementKey) -> Option<&str> {
        match key {
            StatementKey::Interned(id) => self.interned.get(&id).map(String::as_str),
            StatementKey::Inline(idx) => self.inline.get(idx as usize).map(String::as_str),
        }
    }

    /// 字符串表中的所有 id（无序）
    pub fn interned_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.interned.keys().copied()
    }

    pub fn interned_len(&self) -> usize {
        self.interned.len()
    }

    pub fn inline_len(&self) -> usize {
        self.inline.len()
    }
}

/// 语句调用的目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Statement(StatementKey),
    /// 显式事务的 COMMIT / ROLLBACK：只参与节奏控制，不执行
    End,
}

/// 一次语句调用
#[derive(Debug, Clone, PartialEq)]
pub struct StatementCall {
    pub target: CallTarget,
    pub params: Vec<TypedValue>,
    /// 原始日志时间（纳秒）
    pub call_time: i64,
}

impl StatementCall {
    pub fn statement(key: StatementKey, params: Vec<TypedValue>, call_time: i64) -> Self {
        Self {
            target: CallTarget::Statement(key),
            params,
            call_time,
        }
    }

    pub fn end(call_time: i64) -> Self {
        Self {
            target: CallTarget::End,
            params: Vec::new(),
            call_time,
        }
    }
}

/// 待回放的事务
///
/// 语句按记录顺序出队。abort 标志：
/// - `None`：显式事务尚未看到 COMMIT / ROLLBACK
/// - `Some(true)`：以 ROLLBACK 结束
/// - `Some(false)`：以 COMMIT 结束，或者是隐式事务
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTransaction {
    calls: VecDeque<StatementCall>,
    first_log_time: i64,
    explicit: bool,
    abort: Option<bool>,
}

impl ReplayTransaction {
    /// 由 BEGIN 开启的显式事务，`first_log_time` 取 BEGIN 的时间
    pub fn explicit(first_log_time: i64) -> Self {
        Self {
            calls: VecDeque::new(),
            first_log_time,
            explicit: true,
            abort: None,
        }
    }

    /// 单条语句构成的隐式事务，永远不会被回滚
    pub fn implicit(call: StatementCall) -> Self {
        Self {
            first_log_time: call.call_time,
            calls: VecDeque::from([call]),
            explicit: false,
            abort: Some(false),
        }
    }

    pub fn push_call(&mut self, call: StatementCall) {
        self.calls.push_back(call);
    }

    pub fn pop_call(&mut self) -> Option<StatementCall> {
        self.calls.pop_front()
    }

    pub fn calls(&self) -> impl Iterator<Item = &StatementCall> {
        self.calls.iter()
    }

    pub fn first_log_time(&self) -> i64 {
        self.first_log_time
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// 记录事务结果，只能设置一次
    pub fn set_abort(&mut self, abort: bool) -> Result<()> {
        if self.abort.is_some() {
            return Err(ReplayError::AbortFlagAlreadySet);
        }
        self.abort = Some(abort);
        Ok(())
    }

    pub fn is_abort_set(&self) -> bool {
        self.abort.is_some()
    }

    /// 事务是否应当回滚；在 COMMIT / ROLLBACK 之前读取返回 `AbortFlagUnset`
    pub fn should_abort(&self) -> Result<bool> {
        self.abort.ok_or(ReplayError::AbortFlagUnset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_lifecycle() {
        let mut txn = ReplayTransaction::explicit(10);
        assert_eq!(txn.should_abort(), Err(ReplayError::AbortFlagUnset));
        txn.set_abort(true).unwrap();
        assert_eq!(txn.should_abort(), Ok(true));
        assert_eq!(txn.set_abort(false), Err(ReplayError::AbortFlagAlreadySet));
        assert_eq!(txn.should_abort(), Ok(true));
    }

    #[test]
    fn implicit_is_never_aborted() {
        let mut txn =
            ReplayTransaction::implicit(StatementCall::statement(StatementKey::Interned(0), vec![], 5));
        assert_eq!(txn.should_abort(), Ok(false));
        assert_eq!(txn.first_log_time(), 5);
        assert!(!txn.is_explicit());
        assert_eq!(txn.set_abort(true), Err(ReplayError::AbortFlagAlreadySet));
    }

    #[test]
    fn calls_pop_in_order() {
        let mut txn = ReplayTransaction::explicit(0);
        txn.push_call(StatementCall::statement(StatementKey::Interned(1), vec![], 1));
        txn.push_call(StatementCall::statement(StatementKey::Inline(0), vec![], 2));
        txn.push_call(StatementCall::end(3));
        assert_eq!(txn.len(), 3);
        let times: Vec<i64> = std::iter::from_fn(|| txn.pop_call()).map(|c| c.call_time).collect();
        assert_eq!(times, vec![1, 2, 3]);
        assert!(txn.is_empty());
    }

    #[test]
    fn table_key_spaces_are_separate() {
        let mut table = StatementTable::new();
        table.insert_interned(0, "SELECT 1".to_string()).unwrap();
        let inline = table.push_inline("SELECT 2".to_string());
        assert_eq!(inline, StatementKey::Inline(0));
        assert_eq!(table.resolve(StatementKey::Interned(0)), Some("SELECT 1"));
        assert_eq!(table.resolve(inline), Some("SELECT 2"));
        assert_eq!(table.resolve(StatementKey::Interned(1)), None);
        assert_eq!(
            table.insert_interned(0, "x".to_string()),
            Err(ReplayError::DuplicateStatementId { id: 0 })
        );
    }
}
