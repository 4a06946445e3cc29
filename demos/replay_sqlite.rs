/// 示例：把 PostgreSQL CSV 日志回放到 SQLite 数据库
///
/// 这个示例演示如何：
/// 1. 转换（或复用）日志对应的 trace 文件
/// 2. 用多个 worker 按原始节奏回放事务
/// 3. 把 `StatementExecutor` 接到真实的数据库驱动上
///
/// 运行方式：
/// ```bash
/// RUST_LOG=info cargo run --example replay_sqlite -- <postgresql.csv> [speedup] [workers]
/// ```
use pglog_replay::replayer::ExecuteResult;
use pglog_replay::{
    ExecutionError, ReplayConfig, Replayer, Statement, StatementExecutor, TraceManager, TypedValue,
    run_workers,
};
use rusqlite::Connection;
use rusqlite::types::Value;
use std::env;
use std::time::Instant;

const DB_PATH: &str = "replay.db";

struct SqliteExecutor {
    conn: Connection,
}

fn to_sqlite(value: &TypedValue) -> Value {
    match value {
        TypedValue::Null => Value::Null,
        TypedValue::Integer(v)
        | TypedValue::Date(v)
        | TypedValue::Time(v)
        | TypedValue::Timestamp(v) => Value::Integer(*v),
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("用法: {} <postgresql.csv> [speedup] [workers]", args[0]);
        std::process::exit(1);
    }

    let speedup = args.get(2).map(|s| s.parse::<f64>()).transpose()?.unwrap_or(1.0);
    let workers = args.get(3).map(|s| s.parse::<usize>()).transpose()?.unwrap_or(1);
    let config = ReplayConfig::new(&args[1])
        .with_speedup(speedup)
        .with_workers(workers)
        .with_show_progress(true);

    let manager = TraceManager::new(config.clone())?;
    let queue = manager.load()?;
    println!("📁 trace: {}", manager.trace_path().display());
    println!("✅ 待回放事务: {}", queue.len());

    let replayer = Replayer::from_config(&config);
    let start = Instant::now();
    let summary = run_workers(&queue, &replayer, config.workers, |_| SqliteExecutor {
        conn: Connection::open(DB_PATH).expect("open sqlite database"),
    })?;
    let duration = start.elapsed();

    println!("\n📊 回放统计:");
    println!("  ✅ 提交: {}", summary.committed);
    println!("  ↩️  回滚: {}", summary.aborted);
    println!("  ❌ 失败: {}", summary.failed);
    println!("  ⏹️  取消: {}", summary.cancelled);
    println!("  ⏱️  耗时: {:.2?}", duration);

    Ok(())
}
