//! 回放配置
//!
//! 源日志路径、派生的 trace 路径、加速倍数、worker 数等运行参数。

use std::path::{Path, PathBuf};

use crate::error::{ReplayError, Result};
use crate::trace::reader::{DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};

/// trace 文件扩展名
pub const TRACE_EXTENSION: &str = "rply";

/// 回放配置
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplayConfig {
    /// PostgreSQL CSV 日志路径
    pub log_path: PathBuf,

    /// 加速倍数，1.0 为原速，大于 1 压缩间隔
    pub speedup: f64,

    /// 为 false 时不做节奏控制，语句连续执行
    pub speedup_limited: bool,

    /// worker 线程数
    pub workers: usize,

    /// trace 读取缓冲区大小（字节）
    pub read_buffer_capacity: usize,

    /// 转换时是否在 stderr 显示进度条
    pub show_progress: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::new(),
            speedup: 1.0,
            speedup_limited: true,
            workers: 1,
            read_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            show_progress: false,
        }
    }
}

impl ReplayConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            ..Self::default()
        }
    }

    pub fn with_speedup(mut self, speedup: f64) -> Self {
        self.speedup = speedup;
        self
    }

    pub fn with_speedup_limited(mut self, limited: bool) -> Self {
        self.speedup_limited = limited;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }

    pub fn with_show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// 派生的 trace 路径：把日志路径的扩展名换成 `rply`
    pub fn trace_path(&self) -> Result<PathBuf> {
        trace_path_for(&self.log_path)
    }

    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        if self.log_path.as_os_str().is_empty() {
            return Err(ReplayError::InvalidConfig("log_path is empty".to_string()));
        }
        if !self.speedup.is_finite() || self.speedup <= 0.0 {
            return Err(ReplayError::InvalidConfig(format!(
                "speedup must be a positive finite number, got {}",
                self.speedup
            )));
        }
        if self.workers == 0 {
            return Err(ReplayError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(ReplayError::InvalidConfig(format!(
                "read_buffer_capacity must be at least {MIN_BUFFER_CAPACITY} bytes"
            )));
        }
        self.trace_path().map(|_| ())
    }
}

/// 日志路径 -> trace 路径
///
/// 日志本身已经是 `.rply` 时返回错误，避免转换覆盖源文件。
pub fn trace_path_for(log_path: &Path) -> Result<PathBuf> {
    if log_path.extension().is_some_and(|ext| ext == TRACE_EXTENSION) {
        return Err(ReplayError::InvalidConfig(format!(
            "log path {} already has the .{TRACE_EXTENSION} extension",
            log_path.display()
        )));
    }
    Ok(log_path.with_extension(TRACE_EXTENSION))
}
