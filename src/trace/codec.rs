//! 单条 trace 记录的编码与解码
//!
//! 解码直接在调用方的缓冲区上进行，区分两种失败：
//! - 缓冲区里还没有完整的一行：返回 `Ok(None)`，调用方需要继续读取
//! - 内容本身损坏：返回错误，调用方不应恢复

use memchr::memchr;

use super::constants::*;
use super::value::{TypedValue, decode_params, encode_params};
use crate::error::{ReplayError, Result};
use crate::tools::{MAX_HEX_DIGITS, hex_to_i64, push_hex};

/// u32 十进制最多 10 位
const MAX_ID_DIGITS: usize = 10;

/// 记录的 tag 字段
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatementTag {
    Begin,
    Commit,
    Rollback,
    /// 字符串表中的语句 id
    Id(u32),
    /// 未去重的内联 SQL 文本
    Inline(String),
}

impl StatementTag {
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            StatementTag::Begin | StatementTag::Commit | StatementTag::Rollback
        )
    }

    fn from_field(raw: Vec<u8>, offset: usize) -> Result<Self> {
        match raw.as_slice() {
            b"BEGIN" => return Ok(StatementTag::Begin),
            b"COMMIT" => return Ok(StatementTag::Commit),
            b"ROLLBACK" => return Ok(StatementTag::Rollback),
            _ => {}
        }
        if !raw.is_empty() && raw.iter().all(u8::is_ascii_digit) {
            return parse_id(&raw, offset).map(StatementTag::Id);
        }
        String::from_utf8(raw)
            .map(StatementTag::Inline)
            .map_err(|_| malformed(offset, "statement text is not valid UTF-8"))
    }
}

/// 解码得到的一条记录
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    /// 日志时间（纳秒）
    pub log_time: i64,
    pub tag: StatementTag,
    pub params: Vec<TypedValue>,
    /// 记录结束位置（`\n` 之后一个字节）
    pub end_offset: usize,
}

/// 字符串表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementEntry {
    pub id: u32,
    pub sql: String,
    /// 结束位置（`\n` 之后一个字节）
    pub end_offset: usize,
}

#[inline]
fn malformed(offset: usize, reason: &'static str) -> ReplayError {
    ReplayError::MalformedRecord { offset, reason }
}

fn parse_id(digits: &[u8], offset: usize) -> Result<u32> {
    if digits.len() > MAX_ID_DIGITS {
        return Err(malformed(offset, "statement id out of range"));
    }
    digits.iter().try_fold(0u32, |acc, &b| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u32))
            .ok_or_else(|| malformed(offset, "statement id out of range"))
    })
}

fn push_escaped_field(out: &mut Vec<u8>, raw: &[u8]) {
    out.push(FIELD_QUOTE);
    for &b in raw {
        if b == FIELD_QUOTE {
            out.push(FIELD_QUOTE);
        }
        out.push(b);
    }
    out.push(FIELD_QUOTE);
}

/// 把一条记录编码后追加到 `out`
///
/// 格式：`<hex_time>,"<tag>","<params>"\n`
pub fn encode_record(out: &mut Vec<u8>, log_time: i64, tag: &StatementTag, params: &[TypedValue]) {
    push_hex(out, log_time);
    out.push(FIELD_SEP);
    match tag {
        StatementTag::Begin => push_escaped_field(out, BEGIN_KEYWORD.as_bytes()),
        StatementTag::Commit => push_escaped_field(out, COMMIT_KEYWORD.as_bytes()),
        StatementTag::Rollback => push_escaped_field(out, ROLLBACK_KEYWORD.as_bytes()),
        StatementTag::Id(id) => push_escaped_field(out, id.to_string().as_bytes()),
        StatementTag::Inline(sql) => push_escaped_field(out, sql.as_bytes()),
    }
    out.push(FIELD_SEP);
    out.push(FIELD_QUOTE);
    encode_params(out, params);
    out.push(FIELD_QUOTE);
    out.push(LINE_END);
}

/// 把一行字符串表条目编码后追加到 `out`：`<id>,"<sql>"\n`
pub fn encode_statement_entry(out: &mut Vec<u8>, id: u32, sql: &str) {
    out.extend_from_slice(id.to_string().as_bytes());
    out.push(FIELD_SEP);
    push_escaped_field(out, sql.as_bytes());
    out.push(LINE_END);
}

/// 扫描从 `pos`（左引号之后）开始的双引号字段，`""` 表示一个字面引号
///
/// 返回 (反转义后的内容, 右引号之后的位置)；缓冲区不足时返回 `None`。
fn scan_quoted_field(buf: &[u8], mut pos: usize) -> Option<(Vec<u8>, usize)> {
    let mut field = Vec::new();
    loop {
        let q = pos + memchr(FIELD_QUOTE, &buf[pos..])?;
        field.extend_from_slice(&buf[pos..q]);
        if q + 1 >= buf.len() {
            // 看不到下一个字节，无法判断是否为转义引号
            return None;
        }
        if buf[q + 1] == FIELD_QUOTE {
            field.push(FIELD_QUOTE);
            pos = q + 2;
        } else {
            return Some((field, q + 1));
        }
    }
}

/// 找到参数字段的右引号位置
///
/// 单引号内的 `"` 是值的一部分，单引号外的 `"` 结束字段。
fn scan_params_field(buf: &[u8], mut pos: usize) -> Option<usize> {
    let mut in_value = false;
    while pos < buf.len() {
        let b = buf[pos];
        if in_value {
            if b == VALUE_QUOTE {
                if pos + 1 >= buf.len() {
                    return None;
                }
                if buf[pos + 1] == VALUE_QUOTE {
                    pos += 2;
                    continue;
                }
                in_value = false;
            }
        } else if b == FIELD_QUOTE {
            return Some(pos);
        } else if b == VALUE_QUOTE {
            in_value = true;
        }
        pos += 1;
    }
    None
}

/// 需要字节 `pos` 存在且等于 `expected`
///
/// 不存在返回 `Ok(false)`（数据不完整），不相等返回错误。
#[inline]
fn expect_byte(buf: &[u8], pos: usize, expected: u8, start: usize, reason: &'static str) -> Result<bool> {
    match buf.get(pos) {
        None => Ok(false),
        Some(&b) if b == expected => Ok(true),
        Some(_) => Err(malformed(start, reason)),
    }
}

/// 从 `buf[start..]` 解码一条记录
///
/// # 返回
///
/// - `Ok(Some(record))`：完整记录，`record.end_offset` 指向下一条记录
/// - `Ok(None)`：`start` 已到末尾、首字节是段分隔符，或这一行尚不完整
/// - `Err(..)`：记录损坏
pub fn decode_record(buf: &[u8], start: usize) -> Result<Option<TraceRecord>> {
    if start >= buf.len() || buf[start] == SECTION_DELIM {
        return Ok(None);
    }

    // 时间戳
    let mut pos = start;
    while pos < buf.len() && buf[pos].is_ascii_hexdigit() {
        pos += 1;
    }
    if pos - start > MAX_HEX_DIGITS {
        return Err(ReplayError::InvalidHex {
            raw: String::from_utf8_lossy(&buf[start..pos]).into_owned(),
        });
    }
    if pos == buf.len() {
        return Ok(None);
    }
    if buf[pos] != FIELD_SEP {
        return Err(malformed(start, "timestamp must be hex followed by ','"));
    }
    let log_time = hex_to_i64(&buf[start..pos])?;

    // tag
    if !expect_byte(buf, pos + 1, FIELD_QUOTE, start, "tag field must be quoted")? {
        return Ok(None);
    }
    let Some((tag_raw, after_tag)) = scan_quoted_field(buf, pos + 2) else {
        return Ok(None);
    };
    if !expect_byte(buf, after_tag, FIELD_SEP, start, "missing ',' after tag field")? {
        return Ok(None);
    }

    // 参数
    if !expect_byte(buf, after_tag + 1, FIELD_QUOTE, start, "params field must be quoted")? {
        return Ok(None);
    }
    let params_start = after_tag + 2;
    let Some(params_end) = scan_params_field(buf, params_start) else {
        return Ok(None);
    };
    if !expect_byte(buf, params_end + 1, LINE_END, start, "record must end after params field")? {
        return Ok(None);
    }

    let tag = StatementTag::from_field(tag_raw, start)?;
    let params = decode_params(&buf[params_start..params_end])?;

    Ok(Some(TraceRecord {
        log_time,
        tag,
        params,
        end_offset: params_end + 2,
    }))
}

/// 从 `buf[start..]` 解码一行字符串表条目，语义同 [`decode_record`]
pub fn decode_statement_entry(buf: &[u8], start: usize) -> Result<Option<StatementEntry>> {
    if start >= buf.len() {
        return Ok(None);
    }

    let mut pos = start;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == buf.len() {
        if pos - start > MAX_ID_DIGITS {
            return Err(malformed(start, "statement id out of range"));
        }
        return Ok(None);
    }
    if pos == start || buf[pos] != FIELD_SEP {
        return Err(malformed(start, "string table line must start with '<id>,'"));
    }
    let id = parse_id(&buf[start..pos], start)?;

    if !expect_byte(buf, pos + 1, FIELD_QUOTE, start, "statement text must be quoted")? {
        return Ok(None);
    }
    let Some((sql_raw, after_sql)) = scan_quoted_field(buf, pos + 2) else {
        return Ok(None);
    };
    if !expect_byte(buf, after_sql, LINE_END, start, "string table line must end after text")? {
        return Ok(None);
    }

    let sql = String::from_utf8(sql_raw)
        .map_err(|_| malformed(start, "statement text is not valid UTF-8"))?;
    Ok(Some(StatementEntry {
        id,
        sql,
        end_offset: after_sql + 1,
    }))
}
