//! 端到端测试 - 把转换后的 trace 回放到 SQLite

use pglog_replay::replayer::ExecuteResult;
use pglog_replay::{
    ExecutionError, ReplayConfig, Replayer, Statement, StatementExecutor, TraceManager, TypedValue,
    run_workers,
};
use rusqlite::Connection;
use rusqlite::types::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn row(log_time: &str, vxid: &str, message: &str, detail: &str) -> String {
    format!(
        "{log_time},\"postgres\",\"bank\",4242,\"127.0.0.1:51234\",655e1f2a.1092,3,\"idle\",2023-11-12 13:06:50 UTC,{vxid},0,LOG,00000,\"{}\",\"{}\",,,,,,,,,\"psql\"\n",
        message.replace('"', "\"\""),
        detail.replace('"', "\"\"")
    )
}

/// 每个 worker 一个 SQLite 连接
struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    fn open(path: &Path) -> Self {
        Self {
            conn: Connection::open(path).unwrap(),
        }
    }
}

fn to_sqlite(value: &TypedValue) -> Value {
    match value {
        TypedValue::Null => Value::Null,
        TypedValue::Integer(v) | TypedValue::Date(v) | TypedValue::Time(v) | TypedValue::Timestamp(v) => {
            Value::Integer(*v)
        }
        TypedValue::Double(v) => Value::Real(*v),
        TypedValue::Text(s) => Value::Text(s.clone()),
        TypedValue::Boolean(b) => Value::Integer(*b as i64),
    }
}

fn driver_error(e: rusqlite::Error) -> ExecutionError {
    ExecutionError::new(e.to_string())
}

impl StatementExecutor for SqliteExecutor {
    fn execute(&mut self, statement: &Statement<'_>, params: &[TypedValue]) -> ExecuteResult {
        let values: Vec<Value> = params.iter().map(to_sqlite).collect();
        self.conn
            .execute(statement.sql, rusqlite::params_from_iter(values))
            .map(|_| ())
            .map_err(driver_error)
    }

    fn begin(&mut self) -> ExecuteResult {
        self.conn.execute_batch("BEGIN").map_err(driver_error)
    }

    fn commit(&mut self) -> ExecuteResult {
        self.conn.execute_batch("COMMIT").map_err(driver_error)
    }

    fn rollback(&mut self) -> ExecuteResult {
        self.conn.execute_batch("ROLLBACK").map_err(driver_error)
    }
}

#[test]
fn test_replay_into_sqlite() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("bank.csv");
    let db = dir.path().join("bank.db");

    let insert = "execute <unnamed>: INSERT INTO accounts VALUES ($1, $2, $3)";
    fs::write(
        &log,
        [
            row(
                "2023-11-12 13:06:58.000 UTC",
                "3/1",
                "statement: CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT, balance REAL)",
                "",
            ),
            row("2023-11-12 13:06:58.010 UTC", "3/2", "statement: BEGIN", ""),
            row(
                "2023-11-12 13:06:58.020 UTC",
                "3/2",
                insert,
                "parameters: $1 = '1', $2 = 'alice', $3 = '10.5'",
            ),
            row(
                "2023-11-12 13:06:58.030 UTC",
                "3/2",
                insert,
                "parameters: $1 = '2', $2 = 'O''Neil', $3 = '3.25'",
            ),
            row("2023-11-12 13:06:58.040 UTC", "3/2", "statement: COMMIT", ""),
            row("2023-11-12 13:06:58.050 UTC", "3/3", "statement: BEGIN", ""),
            row(
                "2023-11-12 13:06:58.060 UTC",
                "3/3",
                insert,
                "parameters: $1 = '3', $2 = 'carol', $3 = '1.0'",
            ),
            row("2023-11-12 13:06:58.070 UTC", "3/3", "statement: ROLLBACK", ""),
            row(
                "2023-11-12 13:06:58.080 UTC",
                "3/4",
                "execute S_1: UPDATE accounts SET balance = balance + $1 WHERE owner = $2",
                "parameters: $1 = '1', $2 = 'alice'",
            ),
            row(
                "2023-11-12 13:06:58.090 UTC",
                "3/5",
                "statement: INSERT INTO missing_table VALUES (1)",
                "",
            ),
        ]
        .concat(),
    )
    .unwrap();

    let config = ReplayConfig::new(&log).with_speedup(10.0);
    let manager = TraceManager::new(config.clone()).unwrap();
    let queue = manager.load().unwrap();
    assert_eq!(queue.len(), 5);

    let replayer = Replayer::from_config(&config);
    let summary = run_workers(&queue, &replayer, config.workers, |_| SqliteExecutor::open(&db)).unwrap();
    assert_eq!(summary.committed, 3);
    assert_eq!(summary.aborted, 1);
    assert_eq!(summary.failed, 1);
    assert!(queue.is_empty());

    let conn = Connection::open(&db).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 2);
    let balance: f64 = conn
        .query_row("SELECT balance FROM accounts WHERE owner = 'alice'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(balance, 11.5);
    let owner: String = conn
        .query_row("SELECT owner FROM accounts WHERE id = 2", [], |r| r.get(0))
        .unwrap();
    assert_eq!(owner, "O'Neil");
}
