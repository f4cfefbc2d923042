//! 抢占标记
//!
//! 计时器线程设置中断标记，字节码引擎在安全点轮询

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// 运行时级中断状态
pub struct InterruptState {
    /// 计时器中断（时间片用完）
    timer: CachePadded<AtomicBool>,
    /// 计时器触发次数
    ticks: AtomicU64,
}

impl InterruptState {
    pub const fn new() -> Self {
        Self {
            timer: CachePadded::new(AtomicBool::new(false)),
            ticks: AtomicU64::new(0),
        }
    }

    /// 计时器线程调用：标记当前持锁线程应检查待处理事件
    pub fn set_timer_interrupt(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.timer.store(true, Ordering::Release);
    }

    /// 是否有未处理的计时器中断
    #[inline]
    pub fn is_timer_interrupted(&self) -> bool {
        self.timer.load(Ordering::Relaxed)
    }

    /// 取走计时器中断
    #[inline]
    pub fn take_timer_interrupt(&self) -> bool {
        self.timer.load(Ordering::Relaxed) && self.timer.swap(false, Ordering::AcqRel)
    }

    /// 计时器触发次数
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        self.timer.store(false, Ordering::Release);
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

/// 安全点宏
///
/// 在字节码引擎的安全点插入中断检查，需要时让出 VM 锁
#[macro_export]
macro_rules! safepoint {
    ($runtime:expr) => {
        $runtime.check_interrupts()
    };
    ($runtime:expr, $on_interrupt:expr) => {
        if $runtime.check_interrupts() {
            $on_interrupt;
        }
    };
}
