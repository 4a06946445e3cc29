//! TraceReader - 从 Reader 流式读取并解码 trace 记录
//!
//! 自己持有一块工作缓冲区，只在当前记录不完整时才把未消费的尾部移到缓冲区开头
//! 并补充读取，因此每条记录摊还 O(1) 次拷贝，也不需要把整个文件读入内存。

use std::io::{ErrorKind, Read};

use super::codec::{StatementEntry, TraceRecord, decode_record, decode_statement_entry};
use super::constants::{LINE_END, SECTION_DELIM};
use crate::error::{ReplayError, Result};

/// 默认缓冲区大小
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// 缓冲区最小大小
pub const MIN_BUFFER_CAPACITY: usize = 64;

/// trace 文件的流式读取器
///
/// 先用 [`read_record`](Self::read_record)（或迭代器）读完记录段，
/// 再用 [`skip_section_delimiter`](Self::skip_section_delimiter) 跳过分隔行，
/// 最后用 [`read_statement_entry`](Self::read_statement_entry) 读取字符串表。
///
/// 单条记录超过缓冲区大小时缓冲区会成倍扩容。
pub struct TraceReader<R: Read> {
    source: R,
    buf: Vec<u8>,
    cursor: usize,
    filled: usize,
    eof: bool,
    /// 因压缩而丢弃的字节数
    discarded: u64,
    /// 迭代器遇到错误后不再继续
    failed: bool,
}

impl<R: Read> TraceReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(source, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(source: R, capacity: usize) -> Self {
        Self {
            source,
            buf: vec![0; capacity.max(MIN_BUFFER_CAPACITY)],
            cursor: 0,
            filled: 0,
            eof: false,
            discarded: 0,
            failed: false,
        }
    }

    /// 当前缓冲区大小
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// 已经解码消费掉的字节数
    pub fn bytes_consumed(&self) -> u64 {
        self.discarded + self.cursor as u64
    }

    /// 把未消费的尾部移到开头并补充读取
    ///
    /// 返回 `false` 表示源已经结束，没有读到新数据。
    fn refill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        if self.cursor > 0 {
            self.buf.copy_within(self.cursor..self.filled, 0);
            self.filled -= self.cursor;
            self.discarded += self.cursor as u64;
            self.cursor = 0;
        }
        if self.filled == self.buf.len() {
            let grown = self.buf.len() * 2;
            self.buf.resize(grown, 0);
        }

        loop {
            match self.source.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.filled += n;
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 保证游标处至少有一个字节，返回 `false` 表示输入已结束
    fn ensure_available(&mut self) -> Result<bool> {
        while self.cursor >= self.filled {
            if !self.refill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn truncated(&self) -> ReplayError {
        ReplayError::TruncatedRecord {
            remaining: self.filled - self.cursor,
        }
    }

    /// 读取下一条记录
    ///
    /// 到达输入末尾或段分隔符时返回 `Ok(None)`；
    /// 输入在记录中途结束返回 `TruncatedRecord`。
    pub fn read_record(&mut self) -> Result<Option<TraceRecord>> {
        if !self.ensure_available()? || self.buf[self.cursor] == SECTION_DELIM {
            return Ok(None);
        }
        loop {
            if let Some(record) = decode_record(&self.buf[..self.filled], self.cursor)? {
                self.cursor = record.end_offset;
                return Ok(Some(record));
            }
            if !self.refill()? {
                return Err(self.truncated());
            }
        }
    }

    /// 游标是否停在段分隔符上
    pub fn at_section_delimiter(&mut self) -> Result<bool> {
        Ok(self.ensure_available()? && self.buf[self.cursor] == SECTION_DELIM)
    }

    /// 跳过分隔行；游标不在分隔符上时返回 `false` 且不移动
    pub fn skip_section_delimiter(&mut self) -> Result<bool> {
        if !self.at_section_delimiter()? {
            return Ok(false);
        }
        self.cursor += 1;
        if self.ensure_available()? {
            if self.buf[self.cursor] != LINE_END {
                return Err(ReplayError::MalformedRecord {
                    offset: self.cursor,
                    reason: "section delimiter must be alone on its line",
                });
            }
            self.cursor += 1;
        }
        Ok(true)
    }

    /// 读取字符串表中的下一行，输入结束时返回 `Ok(None)`
    pub fn read_statement_entry(&mut self) -> Result<Option<StatementEntry>> {
        if !self.ensure_available()? {
            return Ok(None);
        }
        loop {
            if let Some(entry) = decode_statement_entry(&self.buf[..self.filled], self.cursor)? {
                self.cursor = entry.end_offset;
                return Ok(Some(entry));
            }
            if !self.refill()? {
                return Err(self.truncated());
            }
        }
    }
}

/// 逐条产出记录，遇到段分隔符或输入末尾时结束
impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<TraceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.read_record().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}
