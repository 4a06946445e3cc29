//! Trace 模块 - 紧凑回放 trace 文件的格式与读取
//!
//! 此模块提供了:
//! - 参数值的类型标记编码
//! - 单条记录 / 字符串表条目的编解码
//! - 跨读取边界的流式读取器

pub mod codec;
pub mod constants;
pub mod reader;
pub mod value;

pub use codec::{
    StatementEntry, StatementTag, TraceRecord, decode_record, decode_statement_entry,
    encode_record, encode_statement_entry,
};
pub use reader::TraceReader;
pub use value::TypedValue;
