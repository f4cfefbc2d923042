//! 计时器线程
//!
//! 后台线程周期性地设置中断标记并唤醒阻塞中的线程。
//! 只有一个线程在运行时无限期休眠，有线程等待 VM 锁或处于阻塞调用时
//! 切换为按时间片轮询

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::{TIMER_THREAD_NAME, TIMER_THREAD_STACK_SIZE};
use crate::error::bug;

thread_local! {
    static ON_TIMER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// 调用线程是否是计时器线程
pub fn on_timer_thread() -> bool {
    ON_TIMER_THREAD.with(|f| f.get())
}

/// 计时器线程驱动的对象
pub trait TimerTarget: Send + Sync + 'static {
    /// 每次唤醒后执行一次
    fn tick(&self);

    /// 是否需要按时间片轮询
    fn needs_polling(&self) -> bool;
}

/// 计时器线程的休眠模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    /// 无限期休眠，直到被显式唤醒
    Infinite,
    /// 休眠一个时间片
    Polling,
}

/// 唤醒计时器线程的句柄
///
/// 通道容量为 1，已有未消费的唤醒时再次唤醒直接忽略
#[derive(Clone)]
pub struct TimerWaker {
    tx: Sender<()>,
}

impl TimerWaker {
    /// 唤醒计时器线程（不阻塞）
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("timer wake ignored: channel closed");
            }
        }
    }
}

struct TimerState {
    /// 运行中的线程句柄
    handle: Option<JoinHandle<()>>,
    /// 引用计数，减到 0 时真正停止
    working: usize,
    /// 当前线程的运行标记
    running: Arc<AtomicBool>,
    /// 创建线程的进程
    owner_pid: u32,
}

/// 计时器线程
pub struct TimerThread {
    state: Mutex<TimerState>,
    tx: Sender<()>,
    rx: Receiver<()>,
    quantum: Duration,
}

impl TimerThread {
    /// 创建（未启动）
    pub fn new(quantum: Duration) -> Self {
        let (tx, rx) = bounded(1);
        Self {
            state: Mutex::new(TimerState {
                handle: None,
                working: 0,
                running: Arc::new(AtomicBool::new(false)),
                owner_pid: std::process::id(),
            }),
            tx,
            rx,
            quantum,
        }
    }

    /// 获取唤醒句柄
    pub fn waker(&self) -> TimerWaker {
        TimerWaker { tx: self.tx.clone() }
    }

    /// 唤醒计时器线程
    #[inline]
    pub fn wake(&self) {
        self.waker().wake();
    }

    /// 线程是否在运行
    pub fn is_running(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// 启动计时器线程
    ///
    /// 已经在运行时只增加引用计数，返回 false
    pub fn start(&self, target: Arc<dyn TimerTarget>) -> bool {
        let mut state = self.state.lock();
        state.working += 1;
        if state.handle.is_some() {
            return false;
        }

        let running = Arc::new(AtomicBool::new(true));
        state.running = Arc::clone(&running);
        state.owner_pid = std::process::id();

        let rx = self.rx.clone();
        let quantum = self.quantum;
        let spawned = thread::Builder::new()
            .name(TIMER_THREAD_NAME.to_string())
            .stack_size(TIMER_THREAD_STACK_SIZE)
            .spawn(move || timer_loop(target, rx, running, quantum));

        match spawned {
            Ok(handle) => {
                tracing::debug!("timer thread started");
                state.handle = Some(handle);
                true
            }
            Err(e) => bug(&format!("failed to create timer thread: {}", e)),
        }
    }

    /// 停止计时器线程
    ///
    /// 引用计数减到 0 时唤醒并 join 线程，返回 true 表示这是最后一次停止。
    /// `force_close` 时同时丢弃尚未消费的唤醒
    pub fn stop(&self, force_close: bool) -> bool {
        let handle = {
            let mut state = self.state.lock();
            state.working = state.working.saturating_sub(1);
            if state.working > 0 {
                return false;
            }
            state.running.store(false, Ordering::Release);
            state.handle.take()
        };

        if let Some(handle) = handle {
            self.wake();
            if handle.join().is_err() {
                tracing::warn!("timer thread terminated abnormally");
            }
            tracing::debug!("timer thread joined");
        }

        if force_close {
            self.drain();
        }
        true
    }

    /// fork 之后清空计时器记录
    ///
    /// 子进程中旧线程已不存在，只丢弃句柄；仍在创建它的进程中时
    /// 旧线程还在读同一个唤醒通道，必须先停止并 join
    pub(crate) fn reset_after_fork(&self) {
        let (handle, owner_pid) = {
            let mut state = self.state.lock();
            state.running.store(false, Ordering::Release);
            state.working = 0;
            (state.handle.take(), state.owner_pid)
        };

        if let Some(handle) = handle {
            if owner_pid == std::process::id() {
                self.wake();
                if handle.join().is_err() {
                    tracing::warn!("timer thread terminated abnormally");
                }
                tracing::debug!("timer thread joined on reset");
            } else {
                // 不能 join 也不能 detach 不存在的线程
                std::mem::forget(handle);
                tracing::debug!("timer thread of parent process {} discarded", owner_pid);
            }
        }
        self.drain();
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// 取走一个未消费的唤醒
    #[cfg(test)]
    pub(crate) fn take_pending_wake(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// 计时器线程主循环
fn timer_loop(
    target: Arc<dyn TimerTarget>,
    rx: Receiver<()>,
    running: Arc<AtomicBool>,
    quantum: Duration,
) {
    ON_TIMER_THREAD.with(|f| f.set(true));
    while running.load(Ordering::Acquire) {
        target.tick();
        tracing::trace!("timer tick");

        let mode = if target.needs_polling() {
            SleepMode::Polling
        } else {
            SleepMode::Infinite
        };
        if !timer_sleep(&rx, mode, quantum) {
            tracing::debug!("timer wake channel closed");
            break;
        }
    }
    tracing::debug!("timer thread finished");
}

/// 按模式休眠；提前唤醒时消费掉所有积压的唤醒
///
/// 所有唤醒端都已释放时返回 false
fn timer_sleep(rx: &Receiver<()>, mode: SleepMode, quantum: Duration) -> bool {
    let woken = match mode {
        SleepMode::Polling => match rx.recv_timeout(quantum) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => return false,
        },
        SleepMode::Infinite => match rx.recv() {
            Ok(()) => true,
            Err(_) => return false,
        },
    };
    if woken {
        while rx.try_recv().is_ok() {}
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counter {
        ticks: AtomicUsize,
        polling: AtomicBool,
    }

    impl TimerTarget for Counter {
        fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn needs_polling(&self) -> bool {
            self.polling.load(Ordering::SeqCst)
        }
    }

    fn counter(polling: bool) -> Arc<Counter> {
        Arc::new(Counter {
            ticks: AtomicUsize::new(0),
            polling: AtomicBool::new(polling),
        })
    }

    fn wait_for(mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_infinite_sleep_until_woken() {
        let timer = TimerThread::new(Duration::from_millis(10));
        let target = counter(false);
        assert!(timer.start(target.clone()));
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) == 1));
        assert!(!on_timer_thread());

        // 无限期休眠：不会自行 tick
        thread::sleep(Duration::from_millis(60));
        assert_eq!(target.ticks.load(Ordering::SeqCst), 1);

        timer.wake();
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) == 2));
        assert!(timer.stop(false));
    }

    #[test]
    fn test_polling_mode_ticks() {
        let timer = TimerThread::new(Duration::from_millis(10));
        let target = counter(true);
        timer.start(target.clone());
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) >= 5));

        // 切回无限期休眠
        target.polling.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        let settled = target.ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(target.ticks.load(Ordering::SeqCst), settled);

        assert!(timer.stop(true));
        assert!(!timer.is_running());
    }

    #[test]
    fn test_start_is_idempotent() {
        let timer = TimerThread::new(Duration::from_millis(10));
        let target = counter(false);
        assert!(timer.start(target.clone()));
        assert!(!timer.start(target.clone()));
        assert!(timer.is_running());

        // 两次 start 需要两次 stop
        assert!(!timer.stop(false));
        assert!(timer.is_running());
        assert!(timer.stop(false));
        assert!(!timer.is_running());

        // 停止后可以重新启动
        assert!(timer.start(target.clone()));
        assert!(timer.stop(true));
    }

    #[test]
    fn test_reset_in_same_process_joins_old_thread() {
        let timer = TimerThread::new(Duration::from_millis(10));
        let target = counter(false);
        assert!(timer.start(target.clone()));
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) == 1));

        timer.reset_after_fork();
        assert!(!timer.is_running());
        // 旧线程已退出，只剩一个线程读唤醒通道
        assert_eq!(Arc::strong_count(&target), 1);

        assert!(timer.start(target.clone()));
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) == 2));
        timer.wake();
        assert!(wait_for(|| target.ticks.load(Ordering::SeqCst) == 3));
        assert!(timer.stop(true));
        assert!(!timer.is_running());
        assert_eq!(Arc::strong_count(&target), 1);
    }

    #[test]
    fn test_wake_never_blocks() {
        let timer = TimerThread::new(Duration::from_millis(10));
        let waker = timer.waker();
        for _ in 0..100 {
            waker.wake();
        }
        assert!(timer.take_pending_wake());
        assert!(!timer.take_pending_wake());
    }
}
