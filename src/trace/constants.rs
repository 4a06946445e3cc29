//! trace 文件格式使用的常量定义
//!
//! 记录段每行：`<hex_time>,"<tag>","<params>"\n`；
//! 分隔行 `#` 之后是字符串表：`<id>,"<sql>"\n`。

/// 记录段与字符串表之间的分隔字符，独占一行
///
/// 不是十六进制字符，因此不会被误认为时间戳的开头。
pub const SECTION_DELIM: u8 = b'#';

/// 分隔行（含换行）
pub const SECTION_DELIM_LINE: &[u8] = b"#\n";

/// 字段分隔符
pub const FIELD_SEP: u8 = b',';

/// tag 字段与参数字段的引号
pub const FIELD_QUOTE: u8 = b'"';

/// 参数值的引号
pub const VALUE_QUOTE: u8 = b'\'';

/// 记录结束符
pub const LINE_END: u8 = b'\n';

// 事务边界关键字

pub const BEGIN_KEYWORD: &str = "BEGIN";
pub const COMMIT_KEYWORD: &str = "COMMIT";
pub const ROLLBACK_KEYWORD: &str = "ROLLBACK";

// 参数类型标记

pub const TAG_INTEGER: u8 = b'i';
pub const TAG_DOUBLE: u8 = b'd';
pub const TAG_TEXT: u8 = b'v';
pub const TAG_BOOLEAN: u8 = b'b';
pub const TAG_DATE: u8 = b'D';
pub const TAG_TIME: u8 = b't';
pub const TAG_TIMESTAMP: u8 = b'T';
pub const TAG_NULL: u8 = b'n';
