//! 错误类型
//!
//! 可恢复的错误通过 `ThreadError` 返回给调用者；
//! 内核原语的意外失败说明锁状态已不可信，直接终止进程

use thiserror::Error;

/// 线程子系统的可恢复错误
#[derive(Debug, Error)]
pub enum ThreadError {
    /// join 失败（线程句柄无效或线程 panic）
    #[error("native thread join failed: {0}")]
    Join(String),

    /// 无法创建新的 OS 线程
    #[error("can't create native thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// 无法获取当前线程的栈范围
    #[error("stack bounds of this thread cannot be determined; the engine can initialize only in the main thread")]
    StackUnavailable,

    /// 当前线程没有关联的原生线程记录
    #[error("current thread is not attached to the runtime")]
    NotAttached,
}

/// 线程子系统结果类型
pub type ThreadResult<T> = Result<T, ThreadError>;

/// 不可恢复的内部错误：记录日志并中止进程
#[cold]
pub(crate) fn bug(msg: &str) -> ! {
    tracing::error!("[BUG] {}", msg);
    eprintln!("[BUG] {}", msg);
    std::process::abort()
}

/// 带 errno 的不可恢复错误
#[cold]
pub(crate) fn bug_errno(msg: &str, errno: i32) -> ! {
    let err = std::io::Error::from_raw_os_error(errno);
    tracing::error!("[BUG] {}: {} (errno {})", msg, err, errno);
    eprintln!("[BUG] {}: {} (errno {})", msg, err, errno);
    std::process::abort()
}
