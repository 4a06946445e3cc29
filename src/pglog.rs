//! PostgreSQL CSV 日志读取
//!
//! `log_destination = 'csvlog'` 产生的日志：逗号分隔，字段可以用双引号包裹，
//! 引号内 `""` 表示一个字面引号，并且可以包含换行（多行 SQL）。
//!
//! 这里只关心其中四列：日志时间、虚拟事务 id（VXID）、message 和 detail。

use std::io::BufRead;

use crate::error::{ReplayError, Result};
use crate::trace::TypedValue;

/// 日志时间列
pub const LOG_TIME_COLUMN: usize = 0;
/// 虚拟事务 id 列
pub const VXID_COLUMN: usize = 9;
/// message 列
pub const MESSAGE_COLUMN: usize = 13;
/// detail 列
pub const DETAIL_COLUMN: usize = 14;
/// 一行至少需要的列数
pub const MIN_COLUMNS: usize = DETAIL_COLUMN + 1;

const STATEMENT_TYPE: &str = "statement";
const EXECUTE_TYPE_PREFIX: &str = "execute";
const PARAMETERS_PREFIX: &str = "parameters: ";
const NULL_LITERAL: &str = "NULL";

/// 一行日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    /// 这一行在文件中的起始行号（从 1 开始）
    pub line: usize,
    pub fields: Vec<String>,
}

impl LogRow {
    pub fn log_time(&self) -> &str {
        &self.fields[LOG_TIME_COLUMN]
    }

    pub fn vxid(&self) -> &str {
        &self.fields[VXID_COLUMN]
    }

    pub fn message(&self) -> &str {
        &self.fields[MESSAGE_COLUMN]
    }

    pub fn detail(&self) -> &str {
        &self.fields[DETAIL_COLUMN]
    }
}

/// 按行读取 CSV 日志的迭代器
///
/// 引号内的换行不会结束一行。列数少于 [`MIN_COLUMNS`] 的行返回 `MalformedLogRow`。
pub struct PgLogReader<R: BufRead> {
    reader: R,
    raw: Vec<u8>,
    line: usize,
    bytes_read: u64,
    finished: bool,
}

impl<R: BufRead> PgLogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            raw: Vec::new(),
            line: 0,
            bytes_read: 0,
            finished: false,
        }
    }

    /// 已读取的字节数（用于进度显示）
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// 读取一条完整的 CSV 行（可能跨多个物理行）
    fn read_raw_row(&mut self) -> Result<Option<usize>> {
        self.raw.clear();
        let start_line = self.line + 1;
        let mut in_quotes = false;
        let mut scanned = 0;

        loop {
            let n = self.reader.read_until(b'\n', &mut self.raw)?;
            if n == 0 {
                if self.raw.is_empty() {
                    return Ok(None);
                }
                if in_quotes {
                    return Err(ReplayError::MalformedLogRow {
                        line: start_line,
                        reason: "unterminated quoted field at end of file".to_string(),
                    });
                }
                return Ok(Some(start_line));
            }
            self.bytes_read += n as u64;
            self.line += 1;

            for &b in &self.raw[scanned..] {
                if b == b'"' {
                    in_quotes = !in_quotes;
                }
            }
            scanned = self.raw.len();

            if !in_quotes {
                return Ok(Some(start_line));
            }
        }
    }
}

/// 拆分一行 CSV 字段
pub fn split_csv_fields(raw: &[u8]) -> Vec<String> {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    let raw = &raw[..end];

    let mut fields = Vec::new();
    let mut field = Vec::new();
    let mut pos = 0;
    let mut at_field_start = true;
    let mut in_quotes = false;

    while pos < raw.len() {
        let b = raw[pos];
        if in_quotes {
            if b == b'"' {
                if raw.get(pos + 1) == Some(&b'"') {
                    field.push(b'"');
                    pos += 1;
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(b);
            }
        } else if b == b',' {
            fields.push(String::from_utf8_lossy(&field).into_owned());
            field.clear();
            at_field_start = true;
            pos += 1;
            continue;
        } else if b == b'"' && at_field_start {
            in_quotes = true;
        } else {
            field.push(b);
        }
        at_field_start = false;
        pos += 1;
    }
    fields.push(String::from_utf8_lossy(&field).into_owned());
    fields
}

impl<R: BufRead> Iterator for PgLogReader<R> {
    type Item = Result<LogRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let line = match self.read_raw_row() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            // 空行直接跳过
            if self.raw.iter().all(|&b| b == b'\n' || b == b'\r') {
                continue;
            }

            let fields = split_csv_fields(&self.raw);
            if fields.len() < MIN_COLUMNS {
                self.finished = true;
                return Some(Err(ReplayError::MalformedLogRow {
                    line,
                    reason: format!(
                        "expected at least {MIN_COLUMNS} columns, found {}",
                        fields.len()
                    ),
                }));
            }
            return Some(Ok(LogRow { line, fields }));
        }
    }
}

/// 从 message 列提取 SQL
///
/// message 形如 `<type>: <content>`，只有 `statement` 和 `execute ...` 两种类型是 SQL，
/// 其他类型（`duration`、`connection authorized` ...）返回 `None`。
/// `$<数字>` 占位符统一替换为 `?`。
pub fn parse_sql_from_message(message: &str) -> Option<String> {
    let (kind, content) = message.split_once(": ")?;
    if kind == STATEMENT_TYPE || kind.starts_with(EXECUTE_TYPE_PREFIX) {
        Some(replace_placeholders(content))
    } else {
        None
    }
}

/// `$1`、`$23` -> `?`；后面不是数字的 `$` 原样保留（dollar quoting）
pub fn replace_placeholders(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut pos = 0;

    while let Some(offset) = memchr::memchr(b'$', &bytes[pos..]) {
        let dollar = pos + offset;
        let mut end = dollar + 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > dollar + 1 {
            out.push_str(&sql[copied..dollar]);
            out.push('?');
            copied = end;
        }
        pos = end;
    }
    out.push_str(&sql[copied..]);
    out
}

/// 解析 detail 列中的绑定参数
///
/// 格式：`parameters: $1 = '42', $2 = NULL, $3 = 'it''s'`。
/// detail 不以 `parameters: ` 开头时返回空列表。
pub fn parse_params_from_detail(detail: &str, line: usize) -> Result<Vec<TypedValue>> {
    let Some(list) = detail.strip_prefix(PARAMETERS_PREFIX) else {
        return Ok(Vec::new());
    };

    let malformed = |reason: &str| ReplayError::MalformedLogRow {
        line,
        reason: format!("{reason} in parameters detail"),
    };

    let bytes = list.as_bytes();
    let mut params = Vec::new();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b',') {
            pos += 1;
        }
        if pos == bytes.len() {
            break;
        }

        if bytes[pos] != b'$' {
            return Err(malformed("expected '$<n>'"));
        }
        pos += 1;
        let digits_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == digits_start {
            return Err(malformed("missing parameter number"));
        }
        let rest = &list[pos..];
        let Some(rest) = rest.strip_prefix(" = ") else {
            return Err(malformed("expected ' = '"));
        };
        pos = list.len() - rest.len();

        if rest.starts_with(NULL_LITERAL) {
            params.push(TypedValue::Null);
            pos += NULL_LITERAL.len();
            continue;
        }
        if bytes.get(pos) != Some(&b'\'') {
            return Err(malformed("expected quoted value or NULL"));
        }
        pos += 1;

        let mut value = String::new();
        let mut copied = pos;
        loop {
            let Some(offset) = memchr::memchr(b'\'', &bytes[pos..]) else {
                return Err(malformed("unterminated quoted value"));
            };
            let quote = pos + offset;
            if bytes.get(quote + 1) == Some(&b'\'') {
                value.push_str(&list[copied..=quote]);
                pos = quote + 2;
                copied = pos;
            } else {
                value.push_str(&list[copied..quote]);
                pos = quote + 1;
                break;
            }
        }
        params.push(TypedValue::infer_from_log(&value));
    }

    Ok(params)
}

/// SQL 的事务边界分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Begin,
    Commit,
    Rollback,
    Statement,
}

// 超过这个长度的 SQL 不可能是事务边界语句，跳过规范化
const MAX_BOUNDARY_LEN: usize = 64;

/// 判断一条 SQL 是否为事务边界
///
/// 大小写不敏感，允许结尾的 `;` 和多余空白。
/// `BEGIN ...`、`START TRANSACTION ...`（可带隔离级别等选项）开启事务；
/// `COMMIT`/`END` 提交；`ROLLBACK`/`ABORT` 回滚。
/// `ROLLBACK TO SAVEPOINT`、`COMMIT PREPARED` 等是普通语句。
pub fn classify(sql: &str) -> Boundary {
    let trimmed = sql.trim();
    if trimmed.len() > MAX_BOUNDARY_LEN {
        return Boundary::Statement;
    }
    let trimmed = trimmed.trim_end_matches(';').trim_end();
    let upper = trimmed.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();

    match words.as_slice() {
        ["BEGIN", ..] | ["START", "TRANSACTION", ..] => Boundary::Begin,
        ["COMMIT"] | ["END"] => Boundary::Commit,
        ["COMMIT" | "END", "TRANSACTION" | "WORK"] => Boundary::Commit,
        ["ROLLBACK"] | ["ABORT"] => Boundary::Rollback,
        ["ROLLBACK" | "ABORT", "TRANSACTION" | "WORK"] => Boundary::Rollback,
        _ => Boundary::Statement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_row(log_time: &str, vxid: &str, message: &str, detail: &str) -> String {
        format!(
            "{log_time},\"postgres\",\"bench\",4242,\"127.0.0.1:5432\",655e1f2a.1092,3,\"idle\",2023-11-12 13:06:50 EST,{vxid},0,LOG,00000,\"{}\",\"{}\",,,,,,,,,\"psql\"\n",
            message.replace('"', "\"\""),
            detail.replace('"', "\"\"")
        )
    }

    mod reader_tests {
        use super::*;

        #[test]
        fn reads_columns() {
            let data = csv_row("2023-11-12 13:06:58.721 EST", "4/7", "statement: BEGIN", "");
            let rows: Vec<_> = PgLogReader::new(data.as_bytes()).collect();
            assert_eq!(rows.len(), 1);
            let row = rows[0].as_ref().unwrap();
            assert_eq!(row.line, 1);
            assert_eq!(row.log_time(), "2023-11-12 13:06:58.721 EST");
            assert_eq!(row.vxid(), "4/7");
            assert_eq!(row.message(), "statement: BEGIN");
            assert_eq!(row.detail(), "");
        }

        #[test]
        fn multiline_quoted_field() {
            let mut data = csv_row(
                "2023-11-12 13:06:58.721 EST",
                "4/7",
                "statement: SELECT \"a\"\nFROM t\nWHERE x = 1",
                "",
            );
            data.push_str(&csv_row("2023-11-12 13:06:59.000 EST", "4/8", "statement: COMMIT", ""));
            let rows: Vec<_> = PgLogReader::new(data.as_bytes())
                .collect::<Result<_>>()
                .unwrap();
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].message(), "statement: SELECT \"a\"\nFROM t\nWHERE x = 1");
            assert_eq!(rows[1].line, 4);
        }

        #[test]
        fn too_few_columns() {
            let data = "2023-11-12 13:06:58.721 EST,a,b\n";
            let mut reader = PgLogReader::new(data.as_bytes());
            assert!(matches!(
                reader.next(),
                Some(Err(ReplayError::MalformedLogRow { line: 1, .. }))
            ));
            assert!(reader.next().is_none());
        }

        #[test]
        fn skips_blank_lines_and_tracks_bytes() {
            let row = csv_row("2023-11-12 13:06:58.721 EST", "4/7", "statement: SELECT 1", "");
            let data = format!("\n{row}\r\n");
            let mut reader = PgLogReader::new(data.as_bytes());
            assert!(reader.next().unwrap().is_ok());
            assert!(reader.next().is_none());
            assert_eq!(reader.bytes_read(), data.len() as u64);
        }

        #[test]
        fn split_handles_empty_and_quoted_fields() {
            let fields = split_csv_fields(b"a,,\"b,\"\"c\"\"\",d\r\n");
            assert_eq!(fields, vec!["a", "", "b,\"c\"", "d"]);
        }
    }

    mod message_tests {
        use super::*;

        #[test]
        fn statement_and_execute() {
            assert_eq!(
                parse_sql_from_message("statement: SELECT 1").as_deref(),
                Some("SELECT 1")
            );
            assert_eq!(
                parse_sql_from_message("execute <unnamed>: SELECT * FROM t WHERE a = $1 AND b = $12")
                    .as_deref(),
                Some("SELECT * FROM t WHERE a = ? AND b = ?")
            );
            assert_eq!(
                parse_sql_from_message("execute S_1: INSERT INTO t VALUES ($1)").as_deref(),
                Some("INSERT INTO t VALUES (?)")
            );
            assert_eq!(parse_sql_from_message("duration: 0.512 ms"), None);
            assert_eq!(parse_sql_from_message("connection authorized"), None);
        }

        #[test]
        fn dollar_quoting_survives() {
            assert_eq!(replace_placeholders("SELECT $$a$$, $1, $tag$x$tag$"), "SELECT $$a$$, ?, $tag$x$tag$");
            assert_eq!(replace_placeholders("$"), "$");
        }

        #[test]
        fn detail_parameters() {
            let params = parse_params_from_detail(
                "parameters: $1 = '42', $2 = NULL, $3 = 'it''s', $4 = '2023-11-12', $5 = 'a, $6 = b'",
                1,
            )
            .unwrap();
            assert_eq!(
                params,
                vec![
                    TypedValue::Integer(42),
                    TypedValue::Null,
                    TypedValue::Text("it's".to_string()),
                    TypedValue::Date(1_699_747_200_000),
                    TypedValue::Text("a, $6 = b".to_string()),
                ]
            );
        }

        #[test]
        fn detail_without_parameters() {
            assert!(parse_params_from_detail("", 1).unwrap().is_empty());
            assert!(parse_params_from_detail("Key (id)=(1) already exists.", 1)
                .unwrap()
                .is_empty());
        }

        #[test]
        fn malformed_detail() {
            assert!(parse_params_from_detail("parameters: $1 = 'open", 3).is_err());
            assert!(parse_params_from_detail("parameters: 1 = '1'", 3).is_err());
            assert!(parse_params_from_detail("parameters: $1 '1'", 3).is_err());
        }
    }

    mod classify_tests {
        use super::*;

        #[test]
        fn boundaries() {
            for sql in ["BEGIN", "begin;", "BEGIN TRANSACTION", "begin work", "START TRANSACTION", "BEGIN ISOLATION LEVEL SERIALIZABLE"] {
                assert_eq!(classify(sql), Boundary::Begin, "{sql}");
            }
            for sql in ["COMMIT", "commit ;", "END", "COMMIT WORK", "end transaction"] {
                assert_eq!(classify(sql), Boundary::Commit, "{sql}");
            }
            for sql in ["ROLLBACK", "abort", "ROLLBACK TRANSACTION;", " rollback  work "] {
                assert_eq!(classify(sql), Boundary::Rollback, "{sql}");
            }
        }

        #[test]
        fn statements() {
            for sql in [
                "ROLLBACK TO SAVEPOINT s1",
                "COMMIT PREPARED 'x'",
                "SELECT 1",
                "BEGINNING",
                "INSERT INTO begin VALUES (1)",
            ] {
                assert_eq!(classify(sql), Boundary::Statement, "{sql}");
            }
        }
    }
}
