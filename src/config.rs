//! 配置常量模块
//!
//! 线程子系统的可调参数都在这里定义，只在启动时读取

use std::time::Duration;

/// 计时器线程时间片：100ms
///
/// 10ms 对于近期 Linux 上的用户级线程调度来说太小
pub const TIME_QUANTUM: Duration = Duration::from_millis(100);

/// 线程缓存的空闲等待时间：60s
pub const THREAD_CACHE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 默认的原生线程栈大小：1MB
pub const DEFAULT_THREAD_STACK_SIZE: usize = 1024 * 1024;

/// 栈保留空间上限：1MB
pub const STACK_SPACE_LIMIT: usize = 1024 * 1024;

/// 栈保留空间比例（栈大小的 1/5）
pub const STACK_SPACE_RATIO: usize = 5;

/// 栈溢出检测水位线：1MB
pub const STACK_WATER_MARK: usize = 1024 * 1024;

/// 相对超时上限（秒）
///
/// 某些平台的定时等待拒绝超过 now + 100,000,000 秒的参数
pub const MAX_RELATIVE_TIMEOUT_SECS: u64 = 100_000_000;

/// 计时器线程栈大小（只做轮询，不执行字节码）
pub const TIMER_THREAD_STACK_SIZE: usize = 64 * 1024;

/// 计时器线程名称
pub const TIMER_THREAD_NAME: &str = "vm-timer";

/// 覆盖默认线程栈大小的环境变量
pub const STACK_SIZE_ENV: &str = "VM_THREAD_MACHINE_STACK_SIZE";

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 新建原生线程的栈大小（字节）
    pub thread_stack_size: usize,
    /// 是否复用结束工作的 OS 线程
    pub use_thread_cache: bool,
    /// 缓存线程等待新任务的时长
    pub thread_cache_idle_timeout: Duration,
    /// 计时器线程轮询间隔
    pub timer_quantum: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            use_thread_cache: true,
            thread_cache_idle_timeout: THREAD_CACHE_IDLE_TIMEOUT,
            timer_quantum: TIME_QUANTUM,
        }
    }
}

impl RuntimeConfig {
    /// 从环境变量读取配置，其余使用默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(STACK_SIZE_ENV) {
            match parse_stack_size(&raw) {
                Some(size) => config.thread_stack_size = size,
                None => tracing::warn!(
                    "ignoring {}={:?}: expected a positive byte count",
                    STACK_SIZE_ENV,
                    raw
                ),
            }
        }
        config
    }

    /// 设置线程栈大小
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// 启用或禁用线程缓存
    pub fn with_thread_cache(mut self, enabled: bool) -> Self {
        self.use_thread_cache = enabled;
        self
    }
}

fn parse_stack_size(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(size) => Some(size),
    }
}
