//! 错误类型定义
//!
//! 定义了转换、加载和回放过程中可能出现的所有错误类型。

use thiserror::Error;

/// crate 内统一使用的 `Result` 别名
pub type Result<T> = std::result::Result<T, ReplayError>;

/// 转换 / 加载 / 回放错误
///
/// trace 文件损坏类错误一律是致命的，调用方不应尝试恢复。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    /// 底层 I/O 错误（保存为字符串以保持 `Clone + PartialEq`）
    #[error("I/O error: {0}")]
    IoError(String),

    /// 文件未找到或无法访问
    #[error("file not found or inaccessible: {path}")]
    FileNotFound {
        /// 文件路径
        path: String,
    },

    /// 日志文件与 trace 文件都不存在
    #[error("neither the log file ({log}) nor the trace file ({trace}) exists")]
    MissingInputs {
        /// 日志文件路径
        log: String,
        /// trace 文件路径
        trace: String,
    },

    /// 配置不合法
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// 非十六进制字符或长度溢出
    #[error("invalid hex timestamp: '{raw}'")]
    InvalidHex {
        /// 原始内容
        raw: String,
    },

    /// 日志时间戳格式错误
    #[error("invalid log timestamp: '{raw}'")]
    InvalidTimestamp {
        /// 原始内容
        raw: String,
    },

    /// trace 记录行结构错误
    #[error("malformed trace record at offset {offset}: {reason}")]
    MalformedRecord {
        /// 记录在缓冲区中的起始偏移
        offset: usize,
        /// 错误原因
        reason: &'static str,
    },

    /// 未知的参数类型标记
    #[error("unknown parameter type tag '{tag}'")]
    UnknownTypeTag {
        /// 类型字符
        tag: char,
    },

    /// 参数值无法按类型标记解析
    #[error("invalid value for parameter type '{tag}': '{raw}'")]
    InvalidParamValue {
        /// 类型字符
        tag: char,
        /// 原始值
        raw: String,
    },

    /// 输入在记录中途结束
    #[error("trace ends with a truncated record ({remaining} unconsumed bytes)")]
    TruncatedRecord {
        /// 未消费的字节数
        remaining: usize,
    },

    /// 语句 id 在字符串表中没有对应条目
    #[error("statement id {id} is referenced but missing from the string table")]
    UnresolvedStatement {
        /// 语句 id
        id: u32,
    },

    /// 字符串表中出现重复 id
    #[error("statement id {id} appears twice in the string table")]
    DuplicateStatementId {
        /// 语句 id
        id: u32,
    },

    /// 同一 VXID 上出现第二个 BEGIN
    #[error("BEGIN for already open transaction '{vxid}'")]
    DuplicateBegin {
        /// 虚拟事务 id
        vxid: String,
    },

    /// COMMIT / ROLLBACK 没有匹配的 BEGIN
    #[error("COMMIT or ROLLBACK without an open transaction '{vxid}'")]
    EndWithoutBegin {
        /// 虚拟事务 id
        vxid: String,
    },

    /// trace 的记录段以未结束的显式事务结尾
    #[error("trace records section ends inside an explicit transaction")]
    IncompleteTransaction,

    /// 源日志行格式错误
    #[error("malformed log row at line {line}: {reason}")]
    MalformedLogRow {
        /// 行号（从 1 开始）
        line: usize,
        /// 错误原因
        reason: String,
    },

    /// 在 COMMIT / ROLLBACK 之前读取 abort 标志
    #[error("abort flag read before COMMIT or ROLLBACK was seen")]
    AbortFlagUnset,

    /// abort 标志被重复设置
    #[error("abort flag set twice")]
    AbortFlagAlreadySet,

    /// 在 load() 成功之前访问队列
    #[error("replay queue accessed before a successful load()")]
    NotLoaded,

    /// load() 被调用了不止一次
    #[error("load() called more than once")]
    AlreadyLoaded,

    /// 外部执行器返回错误
    #[error("statement #{index} failed: {source}")]
    Execution {
        /// 语句在事务中的序号
        index: usize,
        /// 执行器返回的错误
        source: ExecutionError,
    },
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        ReplayError::IoError(e.to_string())
    }
}

/// 外部执行器（数据库驱动层）返回的错误
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    /// 驱动给出的错误信息
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
