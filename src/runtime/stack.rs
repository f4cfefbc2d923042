//! 机器栈管理
//!
//! 探测原生线程的栈范围，并判断一个地址是否落在栈溢出保留区内

use std::thread::{self, ThreadId};

use crate::config::{STACK_SPACE_LIMIT, STACK_SPACE_RATIO, STACK_WATER_MARK};
use crate::error::{ThreadError, ThreadResult};

/// 栈增长方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowth {
    /// 向低地址增长
    Down,
    /// 向高地址增长
    Up,
}

impl StackGrowth {
    /// 本平台的增长方向（所有支持的目标都是向下增长）
    pub const NATIVE: StackGrowth = StackGrowth::Down;
}

/// 线程栈需要保留的安全空间：栈大小的 1/5，最多 1MB
#[inline]
pub fn space_size(stack_size: usize) -> usize {
    (stack_size / STACK_SPACE_RATIO).min(STACK_SPACE_LIMIT)
}

/// 溢出检测的保留区大小
#[inline]
pub fn overflow_margin(stack_size: usize) -> usize {
    (stack_size / STACK_SPACE_RATIO).min(STACK_WATER_MARK)
}

/// 一段连续的栈内存
///
/// `base` 是最低地址，`size` 是字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    /// 地址是否落在栈逻辑末端的保留区内
    ///
    /// 向下增长的栈末端在 `base`，保留区为 `[base, base + margin)`；
    /// 向上增长的栈末端在 `end`，保留区为 `[end - margin, end)`
    pub fn in_overflow_margin(&self, addr: usize, margin: usize, growth: StackGrowth) -> bool {
        let margin = margin.min(self.size);
        match growth {
            StackGrowth::Down => addr >= self.base && addr < self.base.saturating_add(margin),
            StackGrowth::Up => {
                let end = self.end();
                addr >= end - margin && addr < end
            }
        }
    }
}

/// 线程栈的起点和可用大小
///
/// `start` 是栈开始增长的位置（向下增长时是高地址）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackBounds {
    pub start: usize,
    pub max_size: usize,
}

impl StackBounds {
    pub const fn new(start: usize, max_size: usize) -> Self {
        Self { start, max_size }
    }

    /// 大小未知
    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.start == 0 || self.max_size == 0
    }

    /// 按增长方向换算成内存区域
    pub fn region(&self, growth: StackGrowth) -> StackRegion {
        match growth {
            StackGrowth::Down => {
                let base = self.start.saturating_sub(self.max_size);
                StackRegion::new(base, self.start - base)
            }
            StackGrowth::Up => {
                let size = self.max_size.min(usize::MAX - self.start);
                StackRegion::new(self.start, size)
            }
        }
    }

    /// 地址是否在栈范围内
    pub fn contains(&self, addr: usize, growth: StackGrowth) -> bool {
        let region = self.region(growth);
        addr >= region.base && addr <= region.end()
    }

    /// 地址是否表示栈耗尽（而不是普通的非法访问）
    pub fn stack_overflowed(&self, addr: usize, growth: StackGrowth) -> bool {
        if self.is_unknown() {
            return false;
        }
        let margin = overflow_margin(self.max_size);
        self.region(growth).in_overflow_margin(addr, margin, growth)
    }
}

/// 当前栈指针的近似值
#[inline(never)]
pub fn current_stack_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// 探测当前线程的栈范围（已扣除保护页）
pub fn probe_current() -> ThreadResult<StackBounds> {
    platform::get_stack().map_err(|errno| {
        tracing::debug!("stack probe failed (errno {})", errno);
        ThreadError::StackUnavailable
    })
}

/// 主线程栈描述
///
/// 进程启动时采集一次，用来区分主线程和新建线程
#[derive(Debug, Clone)]
pub struct MainStack {
    /// 采集栈信息的线程
    pub id: ThreadId,
    /// 栈范围；大小未知时 `max_size` 为 0
    pub bounds: StackBounds,
}

impl MainStack {
    /// 从调用线程采集
    #[inline(never)]
    pub fn capture() -> Self {
        let addr = current_stack_address();
        let id = thread::current().id();

        let max_size = match platform::get_stack() {
            Ok(probed) => {
                let space = match StackGrowth::NATIVE {
                    StackGrowth::Down => probed.start.saturating_sub(addr),
                    StackGrowth::Up => addr.saturating_sub(probed.start),
                };
                probed.max_size.saturating_sub(space)
            }
            Err(_) => platform::rlimit_space(addr).unwrap_or(0),
        };

        let mut bounds = StackBounds::new(addr, max_size);
        if !bounds.contains(addr, StackGrowth::NATIVE) {
            // 在备用栈上初始化
            bounds = StackBounds::new(addr, 0);
        }
        tracing::debug!("main stack: start={:#x} max_size={}", bounds.start, bounds.max_size);

        Self { id, bounds }
    }

    /// 调用线程是否是采集线程
    #[inline]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    use super::StackBounds;

    pub fn get_stack() -> Result<StackBounds, i32> {
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            let err = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            if err != 0 {
                return Err(err);
            }
            let mut addr: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let mut guard: libc::size_t = 0;
            let mut err = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            if err == 0 {
                err = libc::pthread_attr_getguardsize(&attr, &mut guard);
            }
            libc::pthread_attr_destroy(&mut attr);
            if err != 0 {
                return Err(err);
            }
            let start = addr as usize + size;
            Ok(StackBounds::new(start, size.saturating_sub(guard)))
        }
    }

    pub use super::unix_rlimit::rlimit_space;
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod platform {
    use super::StackBounds;

    pub fn get_stack() -> Result<StackBounds, i32> {
        unsafe {
            let th = libc::pthread_self();
            let start = libc::pthread_get_stackaddr_np(th) as usize;
            let size = libc::pthread_get_stacksize_np(th);
            Ok(StackBounds::new(start, size))
        }
    }

    pub use super::unix_rlimit::rlimit_space;
}

#[cfg(windows)]
mod platform {
    use super::StackBounds;
    use winapi::um::processthreadsapi::GetCurrentThreadStackLimits;

    pub fn get_stack() -> Result<StackBounds, i32> {
        let mut low = 0;
        let mut high = 0;
        unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
        if high <= low {
            return Err(0);
        }
        Ok(StackBounds::new(high, high - low))
    }

    pub fn rlimit_space(_addr: usize) -> Option<usize> {
        None
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    windows
)))]
mod platform {
    use super::StackBounds;

    pub fn get_stack() -> Result<StackBounds, i32> {
        Err(0)
    }

    #[cfg(unix)]
    pub use super::unix_rlimit::rlimit_space;

    #[cfg(not(unix))]
    pub fn rlimit_space(_addr: usize) -> Option<usize> {
        None
    }
}

#[cfg(unix)]
mod unix_rlimit {
    /// 由 RLIMIT_STACK 估算 `addr` 以下可用的栈空间（按页对齐）
    pub fn rlimit_space(addr: usize) -> Option<usize> {
        unsafe {
            let mut rlim: libc::rlimit = std::mem::zeroed();
            if libc::getrlimit(libc::RLIMIT_STACK, &mut rlim) != 0 {
                return None;
            }
            let pagesize = libc::sysconf(libc::_SC_PAGESIZE);
            if pagesize <= 0 {
                return None;
            }
            let pagesize = pagesize as usize;
            let size = usize::try_from(rlim.rlim_cur).unwrap_or(usize::MAX);
            let low = addr.checked_sub(size)?;
            let aligned = (low / pagesize + 1) * pagesize;
            Some(addr.saturating_sub(aligned))
        }
    }
}
