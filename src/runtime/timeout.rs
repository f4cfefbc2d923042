//! 定时等待
//!
//! 计算条件变量等待的绝对截止时间，优先使用单调时钟

use std::time::Duration;
use parking_lot::{Condvar, MutexGuard};

use crate::config::MAX_RELATIVE_TIMEOUT_SECS;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// 时钟源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// 单调时钟，不受系统时间调整影响
    Monotonic,
    /// 墙上时钟
    Realtime,
}

/// 秒 + 纳秒表示的时间点
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    /// 可表示的最大时间点
    pub const MAX: Timespec = Timespec { sec: i64::MAX, nsec: NSEC_PER_SEC - 1 };

    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// 加上相对时长，纳秒进位到秒；溢出时钳制到 `MAX`
    pub fn saturating_add(self, rel: Duration) -> Timespec {
        let secs = match i64::try_from(rel.as_secs()) {
            Ok(s) => s,
            Err(_) => return Timespec::MAX,
        };
        let mut sec = match self.sec.checked_add(secs) {
            Some(s) => s,
            None => return Timespec::MAX,
        };
        let mut nsec = self.nsec + i64::from(rel.subsec_nanos());
        if nsec >= NSEC_PER_SEC {
            sec = match sec.checked_add(1) {
                Some(s) => s,
                None => return Timespec::MAX,
            };
            nsec -= NSEC_PER_SEC;
        }
        Timespec { sec, nsec }
    }

    /// `self - earlier`，若 `earlier` 不早于 `self` 则返回 None
    pub fn checked_duration_since(self, earlier: Timespec) -> Option<Duration> {
        if self <= earlier {
            return None;
        }
        let mut sec = self.sec - earlier.sec;
        let mut nsec = self.nsec - earlier.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Some(Duration::new(sec as u64, nsec as u32))
    }
}

impl ClockSource {
    /// 平台支持时使用单调时钟，否则退回墙上时钟
    pub fn preferred() -> Self {
        if platform::monotonic_available() {
            ClockSource::Monotonic
        } else {
            ClockSource::Realtime
        }
    }

    /// 读取当前时间
    pub fn now(self) -> Timespec {
        platform::now(self)
    }
}

/// 把相对超时钳制到平台可接受的范围内
///
/// 被钳制的等待会提前返回，调用者必须把它当作伪唤醒处理
pub fn clamp_relative(rel: Duration) -> Duration {
    if rel.as_secs() > MAX_RELATIVE_TIMEOUT_SECS {
        Duration::from_secs(MAX_RELATIVE_TIMEOUT_SECS)
    } else {
        rel
    }
}

/// 绝对截止时间
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    clock: ClockSource,
    at: Timespec,
}

impl Deadline {
    /// 从现在起经过 `rel` 的截止时间
    pub fn after(rel: Duration) -> Self {
        Self::after_on(ClockSource::preferred(), rel)
    }

    /// 使用指定时钟计算截止时间
    pub fn after_on(clock: ClockSource, rel: Duration) -> Self {
        let at = clock.now().saturating_add(clamp_relative(rel));
        Self { clock, at }
    }

    #[inline]
    pub fn clock(&self) -> ClockSource {
        self.clock
    }

    #[inline]
    pub fn at(&self) -> Timespec {
        self.at
    }

    /// 剩余时间，已过期返回 None
    pub fn remaining(&self) -> Option<Duration> {
        self.at.checked_duration_since(self.clock.now())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

/// 定时等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 被通知（也可能是伪唤醒）
    Woken,
    /// 截止时间已到
    TimedOut,
}

/// 在条件变量上等待直到被通知或截止时间到达
///
/// 只有在时钟确认截止时间已过时才报告 `TimedOut`
pub fn wait_until<T: ?Sized>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: &Deadline,
) -> WaitOutcome {
    loop {
        let remaining = match deadline.remaining() {
            Some(d) => d,
            None => return WaitOutcome::TimedOut,
        };
        if !cond.wait_for(guard, remaining).timed_out() {
            return WaitOutcome::Woken;
        }
    }
}

#[cfg(unix)]
mod platform {
    use super::{ClockSource, Timespec};
    use crate::error::bug_errno;

    fn clock_id(clock: ClockSource) -> libc::clockid_t {
        match clock {
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
            ClockSource::Realtime => libc::CLOCK_REALTIME,
        }
    }

    fn read(id: libc::clockid_t) -> Result<Timespec, i32> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        let r = unsafe { libc::clock_gettime(id, &mut ts) };
        if r != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        Ok(Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64))
    }

    pub fn monotonic_available() -> bool {
        read(libc::CLOCK_MONOTONIC).is_ok()
    }

    pub fn now(clock: ClockSource) -> Timespec {
        match read(clock_id(clock)) {
            Ok(ts) => ts,
            Err(errno) => bug_errno("clock_gettime", errno),
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::sync::OnceLock;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    use super::{ClockSource, Timespec};

    static ANCHOR: OnceLock<Instant> = OnceLock::new();

    pub fn monotonic_available() -> bool {
        true
    }

    pub fn now(clock: ClockSource) -> Timespec {
        let d = match clock {
            ClockSource::Monotonic => ANCHOR.get_or_init(Instant::now).elapsed(),
            ClockSource::Realtime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        };
        Timespec::new(d.as_secs() as i64, i64::from(d.subsec_nanos()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_nanosecond_carry() {
        let t = Timespec::new(10, 900_000_000);
        let d = t.saturating_add(Duration::new(1, 200_000_000));
        assert_eq!(d, Timespec::new(12, 100_000_000));
    }

    #[test]
    fn test_overflow_clamps_to_max() {
        let t = Timespec::new(i64::MAX - 1, 500_000_000);
        assert_eq!(t.saturating_add(Duration::new(1, 600_000_000)), Timespec::MAX);
        assert_eq!(t.saturating_add(Duration::from_secs(u64::MAX)), Timespec::MAX);
    }

    #[test]
    fn test_clamp_relative() {
        let huge = Duration::from_secs(MAX_RELATIVE_TIMEOUT_SECS + 5);
        assert_eq!(clamp_relative(huge), Duration::from_secs(MAX_RELATIVE_TIMEOUT_SECS));
        let small = Duration::from_millis(1500);
        assert_eq!(clamp_relative(small), small);
    }

    #[test]
    fn test_clamp_applied_before_deadline() {
        let clock = ClockSource::preferred();
        let before = clock.now();
        let deadline = Deadline::after_on(clock, Duration::from_secs(u64::MAX));
        let after = clock.now();
        let lo = before.saturating_add(Duration::from_secs(MAX_RELATIVE_TIMEOUT_SECS));
        let hi = after.saturating_add(Duration::from_secs(MAX_RELATIVE_TIMEOUT_SECS));
        assert!(deadline.at() >= lo && deadline.at() <= hi);
    }

    #[test]
    fn test_duration_since() {
        let a = Timespec::new(5, 100);
        let b = Timespec::new(3, 200);
        assert_eq!(a.checked_duration_since(b), Some(Duration::new(1, 999_999_900)));
        assert_eq!(b.checked_duration_since(a), None);
        assert_eq!(a.checked_duration_since(a), None);
    }

    #[test]
    fn test_wait_times_out_no_earlier_than_deadline() {
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let rel = Duration::from_millis(50);
        let start = Instant::now();
        let deadline = Deadline::after(rel);
        let mut guard = lock.lock();
        while wait_until(&cond, &mut guard, &deadline) == WaitOutcome::Woken {}
        assert!(start.elapsed() >= rel);
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_wait_woken_by_notify() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let other = Arc::clone(&pair);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            *other.0.lock() = true;
            other.1.notify_one();
        });

        let deadline = Deadline::after(Duration::from_secs(10));
        let mut done = pair.0.lock();
        while !*done {
            assert_eq!(wait_until(&pair.1, &mut done, &deadline), WaitOutcome::Woken);
        }
        drop(done);
        t.join().unwrap();
    }
}
