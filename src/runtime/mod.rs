//! 线程运行时模块
//!
//! 核心组件：
//! - VmLock: VM 全局锁，带两阶段让出交接
//! - NativeThread: 原生线程记录（栈范围、解除阻塞回调、睡眠条件变量）
//! - UnblockRegistry: 阻塞调用登记表，计时器通过唤醒信号打断阻塞调用
//! - TimerThread: 计时器线程
//! - ThreadCache: 结束工作的 OS 线程在这里等待复用

pub mod machine;
pub mod preempt;
pub mod runtime;
pub mod stack;
pub mod thread_cache;
pub mod timeout;
pub mod timer;
pub mod unblock;
pub mod vm_lock;

pub use machine::{NativeThread, OsThread, SleepOutcome, ThreadRef};
pub use preempt::InterruptState;
pub use runtime::{InterruptHook, Runtime, RuntimeHandle};
pub use stack::{MainStack, StackBounds, StackGrowth};
pub use thread_cache::ThreadCache;
pub use timeout::{wait_until, ClockSource, Deadline, Timespec, WaitOutcome};
pub use timer::{SleepMode, TimerTarget, TimerThread, TimerWaker};
pub use unblock::{BlockingCall, UnblockFn, UnblockRegistry};
pub use vm_lock::{Handoff, Owner, VmLock, VmLockGuard};
