//! 字节码虚拟机的原生线程层
//!
//! 提供：
//! - VM 全局锁：同一时刻只有一个原生线程执行字节码
//! - 原生线程的创建、栈范围检测和 OS 线程缓存
//! - 阻塞调用登记表与唤醒信号
//! - 计时器线程：周期性设置中断标记，按需在无限期休眠和轮询之间切换
//! - 定时等待：截止时间计算与时钟源选择

pub mod config;
pub mod error;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{ThreadError, ThreadResult};
pub use runtime::{
    NativeThread, Runtime, RuntimeHandle, SleepOutcome, ThreadRef, UnblockFn, VmLock, VmLockGuard,
};
