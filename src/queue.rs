//! 回放事务队列
//!
//! 加载阶段一次性填充，之后由多个 worker 并发出队。
//! 只有一把锁，且只在操作队列期间持有。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transaction::{ReplayTransaction, StatementTable};

/// 线程安全的 FIFO
#[derive(Debug)]
pub struct ReplayQueue {
    inner: Mutex<VecDeque<ReplayTransaction>>,
    statements: Arc<StatementTable>,
}

impl ReplayQueue {
    pub fn new(transactions: VecDeque<ReplayTransaction>, statements: StatementTable) -> Self {
        Self {
            inner: Mutex::new(transactions),
            statements: Arc::new(statements),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ReplayTransaction>> {
        // 持锁期间只做 VecDeque 操作，中毒后的数据仍然一致
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 在锁内查看队首事务
    pub fn front<T>(&self, f: impl FnOnce(&ReplayTransaction) -> T) -> Option<T> {
        self.lock().front().map(f)
    }

    /// 取出队首事务
    pub fn try_pop(&self) -> Option<ReplayTransaction> {
        self.lock().pop_front()
    }

    /// 队首满足条件时才取出，查看与取出在同一次加锁内完成
    pub fn pop_if(&self, predicate: impl FnOnce(&ReplayTransaction) -> bool) -> Option<ReplayTransaction> {
        let mut guard = self.lock();
        if guard.front().is_some_and(predicate) {
            guard.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 所有事务共享的语句表
    pub fn statements(&self) -> &Arc<StatementTable> {
        &self.statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{StatementCall, StatementKey};
    use std::thread;

    fn implicit(t: i64) -> ReplayTransaction {
        ReplayTransaction::implicit(StatementCall::statement(StatementKey::Interned(0), vec![], t))
    }

    #[test]
    fn fifo_order() {
        let queue = ReplayQueue::new((0..5).map(implicit).collect(), StatementTable::new());
        assert_eq!(queue.front(|t| t.first_log_time()), Some(0));
        let order: Vec<i64> = std::iter::from_fn(|| queue.try_pop())
            .map(|t| t.first_log_time())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.front(|t| t.len()), None);
    }

    #[test]
    fn pop_if_checks_front() {
        let queue = ReplayQueue::new((0..2).map(implicit).collect(), StatementTable::new());
        assert!(queue.pop_if(|t| t.first_log_time() == 1).is_none());
        assert_eq!(queue.pop_if(|t| t.first_log_time() == 0).map(|t| t.first_log_time()), Some(0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn concurrent_consumers_take_each_once() {
        let queue = Arc::new(ReplayQueue::new((0..1000).map(implicit).collect(), StatementTable::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(t) = queue.try_pop() {
                        seen.push(t.first_log_time());
                    }
                    seen
                })
            })
            .collect();

        let per_thread: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // 每个线程看到的子序列都是递增的
        for seen in &per_thread {
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        let mut all: Vec<i64> = per_thread.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }
}
