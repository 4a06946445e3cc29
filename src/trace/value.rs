//! 带类型标记的参数值
//!
//! 参数字段由若干 `<type_char>'<value>'` 紧密拼接而成，元组之间没有分隔符；
//! 值内部的单引号写成两个单引号。

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::constants::*;
use crate::error::{ReplayError, Result};

const MILLIS_PER_SEC: i64 = 1000;
const NANOS_PER_MILLI: u32 = 1_000_000;

/// 语句参数
///
/// 日期 / 时间 / 时间戳统一以毫秒整数保存：
/// `Date`、`Timestamp` 为 Unix 毫秒（UTC），`Time` 为当天零点起的毫秒数。
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TypedValue {
    Null,
    Integer(i64),
    Double(f64),
    Text(String),
    Boolean(bool),
    Date(i64),
    Time(i64),
    Timestamp(i64),
}

impl TypedValue {
    /// 磁盘上的单字符类型标记
    pub fn type_tag(&self) -> u8 {
        match self {
            TypedValue::Null => TAG_NULL,
            TypedValue::Integer(_) => TAG_INTEGER,
            TypedValue::Double(_) => TAG_DOUBLE,
            TypedValue::Text(_) => TAG_TEXT,
            TypedValue::Boolean(_) => TAG_BOOLEAN,
            TypedValue::Date(_) => TAG_DATE,
            TypedValue::Time(_) => TAG_TIME,
            TypedValue::Timestamp(_) => TAG_TIMESTAMP,
        }
    }

    /// 从日志中的原始参数文本推断类型
    ///
    /// 依次尝试：规范十进制整数、浮点数、`yyyy-MM-dd HH:mm:ss[.fff]`、
    /// `yyyy-MM-dd`、`HH:mm:ss[.fff]`，都不匹配时作为文本。
    /// 不推断布尔值（`t` / `f` 有歧义）。
    pub fn infer_from_log(raw: &str) -> TypedValue {
        if let Some(v) = canonical_i64(raw) {
            return TypedValue::Integer(v);
        }
        if looks_like_float(raw) {
            if let Ok(v) = raw.parse::<f64>() {
                if v.is_finite() {
                    return TypedValue::Double(v);
                }
            }
        }
        if raw.len() >= 19 && raw.as_bytes()[10] == b' ' {
            if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
                return TypedValue::Timestamp(ts.and_utc().timestamp_millis());
            }
        }
        if raw.len() == 10 {
            if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                    return TypedValue::Date(midnight.and_utc().timestamp_millis());
                }
            }
        }
        if raw.len() >= 8 && raw.as_bytes()[2] == b':' {
            if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S%.f") {
                return TypedValue::Time(
                    time.num_seconds_from_midnight() as i64 * MILLIS_PER_SEC
                        + (time.nanosecond() / NANOS_PER_MILLI) as i64,
                );
            }
        }
        TypedValue::Text(raw.to_string())
    }
}

/// 只接受规范写法（无前导零、无 `+`、无 `-0`），保证文本能原样还原
fn canonical_i64(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if raw == "-0" {
        return None;
    }
    raw.parse::<i64>().ok()
}

fn looks_like_float(raw: &str) -> bool {
    let body = raw.strip_prefix('-').unwrap_or(raw);
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut prev = 0u8;
    for b in body.bytes() {
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            b'+' | b'-' if prev == b'e' || prev == b'E' => {}
            _ => return false,
        }
        prev = b;
    }
    seen_digit && (seen_dot || seen_exp) && !matches!(prev, b'e' | b'E' | b'+' | b'-')
}

fn push_quoted(out: &mut Vec<u8>, value: &[u8]) {
    out.push(VALUE_QUOTE);
    for &b in value {
        if b == VALUE_QUOTE {
            out.push(VALUE_QUOTE);
        }
        out.push(b);
    }
    out.push(VALUE_QUOTE);
}

/// 把参数列表编码后追加到 `out`
pub fn encode_params(out: &mut Vec<u8>, params: &[TypedValue]) {
    for param in params {
        out.push(param.type_tag());
        match param {
            TypedValue::Null => push_quoted(out, b""),
            TypedValue::Integer(v)
            | TypedValue::Date(v)
            | TypedValue::Time(v)
            | TypedValue::Timestamp(v) => push_quoted(out, v.to_string().as_bytes()),
            TypedValue::Double(v) => push_quoted(out, v.to_string().as_bytes()),
            TypedValue::Text(s) => push_quoted(out, s.as_bytes()),
            TypedValue::Boolean(v) => push_quoted(out, if *v { b"true" } else { b"false" }),
        }
    }
}

/// 解码完整的参数字段（不含外层双引号）
///
/// 空字段得到空列表。未知类型标记、缺失引号、值无法解析均为错误。
pub fn decode_params(field: &[u8]) -> Result<Vec<TypedValue>> {
    let mut params = Vec::new();
    let mut pos = 0;
    let mut value = Vec::new();

    while pos < field.len() {
        let tag = field[pos];
        if !is_known_tag(tag) {
            return Err(ReplayError::UnknownTypeTag { tag: tag as char });
        }
        if field.get(pos + 1) != Some(&VALUE_QUOTE) {
            return Err(ReplayError::InvalidParamValue {
                tag: tag as char,
                raw: String::from_utf8_lossy(&field[pos + 1..]).into_owned(),
            });
        }
        pos += 2;

        value.clear();
        let mut closed = false;
        while pos < field.len() {
            let b = field[pos];
            if b == VALUE_QUOTE {
                if field.get(pos + 1) == Some(&VALUE_QUOTE) {
                    value.push(VALUE_QUOTE);
                    pos += 2;
                    continue;
                }
                pos += 1;
                closed = true;
                break;
            }
            value.push(b);
            pos += 1;
        }
        if !closed {
            return Err(ReplayError::InvalidParamValue {
                tag: tag as char,
                raw: String::from_utf8_lossy(&value).into_owned(),
            });
        }

        params.push(parse_value(tag, &value)?);
    }

    Ok(params)
}

fn is_known_tag(tag: u8) -> bool {
    matches!(
        tag,
        TAG_INTEGER
            | TAG_DOUBLE
            | TAG_TEXT
            | TAG_BOOLEAN
            | TAG_DATE
            | TAG_TIME
            | TAG_TIMESTAMP
            | TAG_NULL
    )
}

fn parse_value(tag: u8, raw: &[u8]) -> Result<TypedValue> {
    let invalid = || ReplayError::InvalidParamValue {
        tag: tag as char,
        raw: String::from_utf8_lossy(raw).into_owned(),
    };
    let text = std::str::from_utf8(raw).map_err(|_| invalid())?;
    let as_i64 = || text.parse::<i64>().map_err(|_| invalid());

    Ok(match tag {
        TAG_NULL if text.is_empty() => TypedValue::Null,
        TAG_NULL => return Err(invalid()),
        TAG_INTEGER => TypedValue::Integer(as_i64()?),
        TAG_DATE => TypedValue::Date(as_i64()?),
        TAG_TIME => TypedValue::Time(as_i64()?),
        TAG_TIMESTAMP => TypedValue::Timestamp(as_i64()?),
        TAG_DOUBLE => TypedValue::Double(text.parse::<f64>().map_err(|_| invalid())?),
        TAG_TEXT => TypedValue::Text(text.to_string()),
        TAG_BOOLEAN => match text {
            "true" => TypedValue::Boolean(true),
            "false" => TypedValue::Boolean(false),
            _ => return Err(invalid()),
        },
        _ => return Err(ReplayError::UnknownTypeTag { tag: tag as char }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(params: &[TypedValue]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_params(&mut out, params);
        out
    }

    #[test]
    fn every_variant_survives() {
        let params = vec![
            TypedValue::Null,
            TypedValue::Integer(-42),
            TypedValue::Double(3.25),
            TypedValue::Text("it's \"quoted\", ok".to_string()),
            TypedValue::Boolean(true),
            TypedValue::Boolean(false),
            TypedValue::Date(1_699_747_200_000),
            TypedValue::Time(47_218_721),
            TypedValue::Timestamp(1_699_794_418_721),
        ];
        assert_eq!(decode_params(&encode(&params)).unwrap(), params);
    }

    #[test]
    fn empty_field_is_empty_list() {
        assert_eq!(decode_params(b"").unwrap(), vec![]);
    }

    #[test]
    fn layout_has_no_separators() {
        let out = encode(&[TypedValue::Integer(1), TypedValue::Text("a'b".into())]);
        assert_eq!(out, b"i'1'v'a''b'");
    }

    #[test]
    fn rejects_corruption() {
        assert_eq!(
            decode_params(b"x'1'"),
            Err(ReplayError::UnknownTypeTag { tag: 'x' })
        );
        assert!(matches!(
            decode_params(b"i'12"),
            Err(ReplayError::InvalidParamValue { tag: 'i', .. })
        ));
        assert!(matches!(
            decode_params(b"i'abc'"),
            Err(ReplayError::InvalidParamValue { .. })
        ));
        assert!(decode_params(b"i1").is_err());
        assert!(decode_params(b"b'yes'").is_err());
    }

    #[test]
    fn infers_types_from_log_text() {
        assert_eq!(TypedValue::infer_from_log("42"), TypedValue::Integer(42));
        assert_eq!(TypedValue::infer_from_log("-7"), TypedValue::Integer(-7));
        assert_eq!(TypedValue::infer_from_log("1.5"), TypedValue::Double(1.5));
        assert_eq!(TypedValue::infer_from_log("2e3"), TypedValue::Double(2000.0));
        assert_eq!(
            TypedValue::infer_from_log("007"),
            TypedValue::Text("007".to_string())
        );
        assert_eq!(
            TypedValue::infer_from_log("2023-11-12"),
            TypedValue::Date(1_699_747_200_000)
        );
        assert_eq!(
            TypedValue::infer_from_log("2023-11-12 13:06:58.721"),
            TypedValue::Timestamp(1_699_794_418_721)
        );
        assert_eq!(
            TypedValue::infer_from_log("13:06:58.721"),
            TypedValue::Time(47_218_721)
        );
        assert_eq!(
            TypedValue::infer_from_log("t"),
            TypedValue::Text("t".to_string())
        );
        assert_eq!(
            TypedValue::infer_from_log("1.2.3"),
            TypedValue::Text("1.2.3".to_string())
        );
    }
}
