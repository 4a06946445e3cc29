//! 热路径上的快速解析工具
//!
//! - trace 时间戳使用小写十六进制：乘 16 就是左移 4 位，比十进制解析快
//! - 日志时间戳按近似升序出现，缓存日期 / 小时 / 分钟，只重新计算秒以下部分
//! - 转换进度条

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::{self, Write};

use crate::error::{ReplayError, Result};

// 时间戳格式常量
const TIMESTAMP_LENGTH: usize = 23;
const TIMESTAMP_SEPARATOR_POSITIONS: [(usize, u8); 6] = [
    (4, b'-'),
    (7, b'-'),
    (10, b' '),
    (13, b':'),
    (16, b':'),
    (19, b'.'),
];
const TIMESTAMP_DIGIT_POSITIONS: [usize; 17] =
    [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18, 20, 21, 22];

/// i64 的十六进制表示最多 16 位
pub const MAX_HEX_DIGITS: usize = 16;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const PROGRESS_BAR_WIDTH: usize = 50;

// 时区缩写 -> UTC 偏移（秒）。Postgres 的 log_timezone 通常输出缩写。
static ZONE_OFFSETS: Lazy<HashMap<&'static str, i32>> = Lazy::new(|| {
    const H: i32 = 3600;
    HashMap::from([
        ("UTC", 0),
        ("GMT", 0),
        ("Z", 0),
        ("WET", 0),
        ("BST", H),
        ("CET", H),
        ("WEST", H),
        ("CEST", 2 * H),
        ("EET", 2 * H),
        ("EEST", 3 * H),
        ("MSK", 3 * H),
        ("IST", 5 * H + 1800),
        ("CST", -6 * H),
        ("CDT", -5 * H),
        ("EST", -5 * H),
        ("EDT", -4 * H),
        ("MST", -7 * H),
        ("MDT", -6 * H),
        ("PST", -8 * H),
        ("PDT", -7 * H),
        ("AKST", -9 * H),
        ("AKDT", -8 * H),
        ("HST", -10 * H),
        ("HKT", 8 * H),
        ("SGT", 8 * H),
        ("AWST", 8 * H),
        ("JST", 9 * H),
        ("KST", 9 * H),
        ("AEST", 10 * H),
        ("AEDT", 11 * H),
        ("NZST", 12 * H),
        ("NZDT", 13 * H),
    ])
});

/// 期望输入恰好为 23 字节：`YYYY-MM-DD HH:MM:SS.mmm`
#[inline(always)]
pub fn is_ts_millis_bytes(bytes: &[u8]) -> bool {
    if bytes.len() != TIMESTAMP_LENGTH {
        return false;
    }

    for &(pos, expected) in &TIMESTAMP_SEPARATOR_POSITIONS {
        if bytes[pos] != expected {
            return false;
        }
    }

    for &i in &TIMESTAMP_DIGIT_POSITIONS {
        if !bytes[i].is_ascii_digit() {
            return false;
        }
    }

    true
}

#[inline(always)]
fn hex_digit(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'f' => Some((b - b'a' + 10) as u64),
        b'A'..=b'F' => Some((b - b'A' + 10) as u64),
        _ => None,
    }
}

/// 十六进制字节串 -> i64
///
/// 最多 16 位，按 u64 累加后按位重解释，因此负数（补码）也能往返。
/// 空输入、非十六进制字符、超过 16 位均返回 `InvalidHex`。
#[inline]
pub fn hex_to_i64(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() || bytes.len() > MAX_HEX_DIGITS {
        return Err(invalid_hex(bytes));
    }

    let mut out: u64 = 0;
    for &b in bytes {
        let digit = hex_digit(b).ok_or_else(|| invalid_hex(bytes))?;
        out = (out << 4) | digit;
    }
    Ok(out as i64)
}

fn invalid_hex(bytes: &[u8]) -> ReplayError {
    ReplayError::InvalidHex {
        raw: String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// 把 `value` 的小写十六进制追加到 `out`，不带前导零
#[inline]
pub fn push_hex(out: &mut Vec<u8>, value: i64) {
    let mut v = value as u64;
    let mut buf = [0u8; MAX_HEX_DIGITS];
    let mut i = MAX_HEX_DIGITS;
    loop {
        i -= 1;
        buf[i] = HEX_DIGITS[(v & 0xf) as usize];
        v >>= 4;
        if v == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[i..]);
}

/// i64 -> 小写十六进制字符串
pub fn i64_to_hex(value: i64) -> String {
    let mut buf = Vec::with_capacity(MAX_HEX_DIGITS);
    push_hex(&mut buf, value);
    buf.into_iter().map(char::from).collect()
}

/// 时区文本 -> UTC 偏移秒数
///
/// 支持常见缩写（`EST`、`UTC` ...）以及数字形式 `+08`、`-0500`、`+05:30`。
pub fn zone_offset_seconds(zone: &str) -> Option<i32> {
    if let Some(&offset) = ZONE_OFFSETS.get(zone) {
        return Some(offset);
    }

    let bytes = zone.as_bytes();
    let sign = match bytes.first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: Vec<u8> = bytes[1..].iter().copied().filter(|&b| b != b':').collect();
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (two_digits(&digits[0..2]), 0),
        4 => (two_digits(&digits[0..2]), two_digits(&digits[2..4])),
        _ => return None,
    };
    if hours > 15 || minutes > 59 {
        return None;
    }
    Some(sign * (hours as i32 * 3600 + minutes as i32 * 60))
}

#[inline(always)]
fn two_digits(b: &[u8]) -> i64 {
    (b[0] - b'0') as i64 * 10 + (b[1] - b'0') as i64
}

#[inline(always)]
fn three_digits(b: &[u8]) -> i64 {
    (b[0] - b'0') as i64 * 100 + two_digits(&b[1..3])
}

fn midnight_nanos(date: &[u8], zone: &[u8]) -> Option<i64> {
    let year = two_digits(&date[0..2]) * 100 + two_digits(&date[2..4]);
    let month = two_digits(&date[5..7]);
    let day = two_digits(&date[8..10]);
    let secs = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .timestamp();
    let offset = zone_offset_seconds(std::str::from_utf8(zone).ok()?)?;
    Some((secs - offset as i64) * NANOS_PER_SEC)
}

/// Postgres 日志时间戳解析器（`yyyy-MM-dd HH:mm:ss.SSS <tz>` -> Unix 纳秒）
///
/// 缓存上一次的日期 + 时区、小时、分钟，只在它们变化时重新计算。
/// 日志中的时间戳近似升序，所以绝大多数调用只需要解析秒和毫秒。
///
/// 实例内部有可变缓存：每个线程使用自己的实例，不要共享。
/// 乱序输入同样正确，只是命中率下降。
#[derive(Debug, Default)]
pub struct LogTimestampParser {
    last_date_zone: Vec<u8>,
    last_midnight_nanos: i64,
    last_hour: Option<[u8; 2]>,
    last_hour_nanos: i64,
    last_minute: Option<[u8; 2]>,
    last_minute_nanos: i64,
}

impl LogTimestampParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析一个日志时间戳，返回 Unix 纳秒
    ///
    /// # 错误
    ///
    /// 格式、日期或时区非法时返回 `InvalidTimestamp`，缓存保持不变。
    pub fn parse(&mut self, raw: &str) -> Result<i64> {
        let bytes = raw.as_bytes();
        if bytes.len() < TIMESTAMP_LENGTH + 2
            || !is_ts_millis_bytes(&bytes[..TIMESTAMP_LENGTH])
            || bytes[TIMESTAMP_LENGTH] != b' '
        {
            return Err(invalid_ts(raw));
        }

        let date = &bytes[0..10];
        let zone = bytes[TIMESTAMP_LENGTH + 1..].trim_ascii();

        let date_hit = self.last_date_zone.len() > 10
            && &self.last_date_zone[..10] == date
            && &self.last_date_zone[10..] == zone;
        if !date_hit {
            let midnight = midnight_nanos(date, zone).ok_or_else(|| invalid_ts(raw))?;
            self.last_date_zone.clear();
            self.last_date_zone.extend_from_slice(date);
            self.last_date_zone.extend_from_slice(zone);
            self.last_midnight_nanos = midnight;
        }

        let hour = [bytes[11], bytes[12]];
        if self.last_hour != Some(hour) {
            let h = two_digits(&hour);
            if h > 23 {
                return Err(invalid_ts(raw));
            }
            self.last_hour = Some(hour);
            self.last_hour_nanos = h * 3600 * NANOS_PER_SEC;
        }

        let minute = [bytes[14], bytes[15]];
        if self.last_minute != Some(minute) {
            let m = two_digits(&minute);
            if m > 59 {
                return Err(invalid_ts(raw));
            }
            self.last_minute = Some(minute);
            self.last_minute_nanos = m * 60 * NANOS_PER_SEC;
        }

        let secs = two_digits(&bytes[17..19]);
        if secs > 59 {
            return Err(invalid_ts(raw));
        }
        let millis = three_digits(&bytes[20..23]);

        Ok(self.last_midnight_nanos
            + self.last_hour_nanos
            + self.last_minute_nanos
            + secs * NANOS_PER_SEC
            + millis * NANOS_PER_MILLI)
    }
}

fn invalid_ts(raw: &str) -> ReplayError {
    ReplayError::InvalidTimestamp {
        raw: raw.to_string(),
    }
}

/// 控制台进度条，只有整数百分比增加时才重绘
pub struct ProgressBar<W: Write> {
    out: W,
    last_percent: Option<u8>,
}

impl<W: Write> ProgressBar<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_percent: None,
        }
    }

    /// 按已消费字节数更新进度
    pub fn update(&mut self, current: u64, total: u64) -> io::Result<()> {
        let percent = progress_percent(current, total);
        if self.last_percent.is_some_and(|last| percent <= last) {
            return Ok(());
        }
        self.last_percent = Some(percent);
        write!(self.out, "\r{}", render_progress_bar(percent))?;
        self.out.flush()
    }

    /// 进度条本身不换行，结束时补一个换行
    pub fn finish(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        self.out.flush()
    }
}

/// 已消费字节占比（0-100），总量为 0 视为已完成
pub fn progress_percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((current.min(total) as f64 / total as f64) * 100.0) as u8
}

/// 渲染 `[=====>     ] 42%`
pub fn render_progress_bar(percent: u8) -> String {
    let filled = percent.min(100) as usize * PROGRESS_BAR_WIDTH / 100;
    let mut bar = String::with_capacity(PROGRESS_BAR_WIDTH + 8);
    bar.push('[');
    for i in 0..PROGRESS_BAR_WIDTH {
        if i + 1 < filled {
            bar.push('=');
        } else if i + 1 == filled {
            bar.push('>');
        } else {
            bar.push(' ');
        }
    }
    bar.push_str("] ");
    bar.push_str(&percent.to_string());
    bar.push('%');
    bar
}
