//! 日志 -> trace 转换
//!
//! 逐行读取 PostgreSQL CSV 日志，按 VXID 把语句归组成事务，SQL 文本去重为整数 id，
//! 最后按事务首次出现的顺序写出记录段，再写出字符串表。
//!
//! 输出先写到目标目录下的临时文件，成功后原子替换为目标文件；
//! 出错时临时文件随之删除，不会留下写了一半的 trace。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::error::{ReplayError, Result};
use crate::pglog::{Boundary, PgLogReader, classify, parse_params_from_detail, parse_sql_from_message};
use crate::tools::{LogTimestampParser, ProgressBar};
use crate::trace::constants::SECTION_DELIM_LINE;
use crate::trace::{StatementTag, TypedValue, encode_record, encode_statement_entry};

/// 转换结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    /// 读取的日志行数
    pub rows: usize,
    /// 不是 SQL 的日志行（连接、耗时等）
    pub skipped_rows: usize,
    /// 写出的事务数
    pub transactions_written: usize,
    /// 日志结束时仍未提交 / 回滚而被丢弃的事务数
    pub dropped_incomplete: usize,
    /// 字符串表条目数
    pub interned_statements: usize,
}

#[derive(Debug)]
struct LogCall {
    log_time: i64,
    id: u32,
    params: Vec<TypedValue>,
}

/// 转换过程中的事务累积器
#[derive(Debug)]
struct LogTransaction {
    explicit: bool,
    begin_time: i64,
    calls: Vec<LogCall>,
    /// (结束时间, 是否回滚)；隐式事务为 `None`
    end: Option<(i64, bool)>,
    complete: bool,
}

/// SQL 文本去重
#[derive(Debug, Default)]
struct Interner {
    ids: HashMap<String, u32>,
    texts: Vec<String>,
}

impl Interner {
    fn intern(&mut self, sql: String) -> u32 {
        if let Some(&id) = self.ids.get(&sql) {
            return id;
        }
        let id = self.texts.len() as u32;
        self.texts.push(sql.clone());
        self.ids.insert(sql, id);
        id
    }
}

/// 日志转换器
#[derive(Debug, Clone, Default)]
pub struct LogConverter {
    show_progress: bool,
}

impl LogConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否在 stderr 显示进度条
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// 把 `source` 日志转换为 `dest` trace 文件
    ///
    /// # 错误
    ///
    /// I/O 错误、格式错误、同一 VXID 重复 BEGIN、没有 BEGIN 的 COMMIT / ROLLBACK
    /// 都会让转换失败，此时 `dest` 不会被写入。
    pub fn convert(&self, source: &Path, dest: &Path) -> Result<ConvertSummary> {
        let file = File::open(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ReplayError::FileNotFound {
                path: source.display().to_string(),
            },
            _ => e.into(),
        })?;
        let total = file.metadata()?.len();
        info!("converting {} ({} bytes) -> {}", source.display(), total, dest.display());

        let mut summary = ConvertSummary::default();
        let mut transactions: Vec<LogTransaction> = Vec::new();
        let mut open: HashMap<String, usize> = HashMap::new();
        let mut interner = Interner::default();
        let mut timestamps = LogTimestampParser::new();
        let mut progress = self.show_progress.then(|| ProgressBar::new(io::stderr()));

        let mut rows = PgLogReader::new(BufReader::new(file));
        while let Some(row) = rows.next() {
            let row = row?;
            summary.rows += 1;

            let Some(sql) = parse_sql_from_message(row.message()) else {
                summary.skipped_rows += 1;
                continue;
            };
            let log_time = timestamps.parse(row.log_time())?;
            let vxid = row.vxid();

            match classify(&sql) {
                Boundary::Begin => {
                    if open.contains_key(vxid) {
                        return Err(ReplayError::DuplicateBegin {
                            vxid: vxid.to_string(),
                        });
                    }
                    open.insert(vxid.to_string(), transactions.len());
                    transactions.push(LogTransaction {
                        explicit: true,
                        begin_time: log_time,
                        calls: Vec::new(),
                        end: None,
                        complete: false,
                    });
                }
                boundary @ (Boundary::Commit | Boundary::Rollback) => {
                    // 事务结束后立即移除，VXID 之后会被复用
                    let idx = open.remove(vxid).ok_or_else(|| ReplayError::EndWithoutBegin {
                        vxid: vxid.to_string(),
                    })?;
                    let txn = &mut transactions[idx];
                    txn.end = Some((log_time, boundary == Boundary::Rollback));
                    txn.complete = true;
                }
                Boundary::Statement => {
                    let params = parse_params_from_detail(row.detail(), row.line)?;
                    let call = LogCall {
                        log_time,
                        id: interner.intern(sql),
                        params,
                    };
                    match open.get(vxid) {
                        Some(&idx) => transactions[idx].calls.push(call),
                        None => transactions.push(LogTransaction {
                            explicit: false,
                            begin_time: log_time,
                            calls: vec![call],
                            end: None,
                            complete: true,
                        }),
                    }
                }
            }

            if let Some(bar) = progress.as_mut() {
                bar.update(rows.bytes_read(), total)?;
            }
        }
        if let Some(bar) = progress.as_mut() {
            bar.update(total, total)?;
            bar.finish()?;
        }

        let (written, dropped) = write_trace(dest, &transactions, &interner.texts)?;
        summary.transactions_written = written;
        summary.dropped_incomplete = dropped;
        summary.interned_statements = interner.texts.len();

        if dropped > 0 {
            warn!("dropped {dropped} transaction(s) left open at the end of the log");
        }
        info!(
            "converted {} rows into {} transactions, {} distinct statements",
            summary.rows, summary.transactions_written, summary.interned_statements
        );
        Ok(summary)
    }
}

/// 用默认选项转换
pub fn convert(source: &Path, dest: &Path) -> Result<ConvertSummary> {
    LogConverter::new().convert(source, dest)
}

/// 写出 trace，返回 (写出的事务数, 丢弃的事务数)
fn write_trace(dest: &Path, transactions: &[LogTransaction], texts: &[String]) -> Result<(usize, usize)> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let mut out = BufWriter::new(tmp);
    let mut line = Vec::with_capacity(256);
    let mut written = 0;
    let mut dropped = 0;

    for txn in transactions {
        if !txn.complete {
            dropped += 1;
            continue;
        }
        if txn.explicit {
            line.clear();
            encode_record(&mut line, txn.begin_time, &StatementTag::Begin, &[]);
            out.write_all(&line)?;
        }
        for call in &txn.calls {
            line.clear();
            encode_record(&mut line, call.log_time, &StatementTag::Id(call.id), &call.params);
            out.write_all(&line)?;
        }
        if let Some((end_time, rolled_back)) = txn.end {
            let tag = if rolled_back {
                StatementTag::Rollback
            } else {
                StatementTag::Commit
            };
            line.clear();
            encode_record(&mut line, end_time, &tag, &[]);
            out.write_all(&line)?;
        }
        written += 1;
    }

    out.write_all(SECTION_DELIM_LINE)?;
    for (id, sql) in texts.iter().enumerate() {
        line.clear();
        encode_statement_entry(&mut line, id as u32, sql);
        out.write_all(&line)?;
    }

    let tmp = out.into_inner().map_err(|e| ReplayError::from(e.into_error()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| ReplayError::from(e.error))?;
    debug!("trace written to {}", dest.display());
    Ok((written, dropped))
}
