//! VM 全局锁
//!
//! 同一时刻只有一个原生线程执行字节码。字节码引擎在每个调度时间片前后
//! 获取/释放，或在安全点调用 `yield_now` 把锁交给等待者。
//!
//! `yield_now` 的两阶段交接：让出者释放锁后标记 `Handoff::Pending` 并在
//! `switch` 上等待，直到某个等待者在 `acquire` 中拿到锁并确认
//! （`Pending -> Acked`）。保证调用时已有的等待者中至少一个先于让出者重新
//! 获得锁，但不保证等待者之间的 FIFO 顺序。

use std::thread::{self, ThreadId};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::timer::TimerWaker;
use crate::error::bug;

/// 持有者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free,
    Held(ThreadId),
}

/// 让出交接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// 没有进行中的让出
    Idle,
    /// 让出者在等待某个等待者接手
    Pending,
    /// 等待者已接手，让出者尚未恢复
    Acked,
}

#[derive(Debug)]
struct LockState {
    owner: Owner,
    /// 阻塞在 acquire 中的线程数
    waiting: usize,
    handoff: Handoff,
}

impl LockState {
    const fn new() -> Self {
        Self {
            owner: Owner::Free,
            waiting: 0,
            handoff: Handoff::Idle,
        }
    }
}

/// VM 全局锁
pub struct VmLock {
    state: Mutex<LockState>,
    /// 锁被释放
    free: Condvar,
    /// 等待者接手了让出的锁
    switch: Condvar,
    /// 进行中的让出结束
    switch_ack: Condvar,
    /// 第一个等待者出现时唤醒计时器线程进入轮询模式
    waker: Option<TimerWaker>,
}

impl VmLock {
    /// 创建不关联计时器线程的锁
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::new()),
            free: Condvar::new(),
            switch: Condvar::new(),
            switch_ack: Condvar::new(),
            waker: None,
        }
    }

    /// 创建锁，等待者从 0 变为 1 时通过 `waker` 通知计时器线程
    pub fn with_waker(waker: TimerWaker) -> Self {
        Self {
            waker: Some(waker),
            ..Self::new()
        }
    }

    /// 阻塞直到成为唯一持有者
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        self.acquire_locked(&mut state);
    }

    /// 不阻塞地尝试获取；被占用时返回 false
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.owner != Owner::Free {
            return false;
        }
        state.owner = Owner::Held(thread::current().id());
        true
    }

    /// 释放锁，有等待者时唤醒其中一个
    pub fn release(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
    }

    /// 让出锁
    ///
    /// 有等待者时至少一个等待者先拿到锁；没有等待者时只做一次系统级让出
    pub fn yield_now(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);

        if state.handoff != Handoff::Idle {
            // 另一个线程的让出尚未结束
            while state.handoff != Handoff::Idle {
                self.switch_ack.wait(&mut state);
            }
        } else {
            if state.waiting > 0 {
                state.handoff = Handoff::Pending;
                while state.handoff == Handoff::Pending {
                    self.switch.wait(&mut state);
                }
                state.handoff = Handoff::Idle;
            } else {
                MutexGuard::unlocked(&mut state, platform::yield_thread);
            }
            self.switch_ack.notify_all();
        }

        self.acquire_locked(&mut state);
    }

    /// 获取锁并返回 RAII 守卫
    pub fn lock(&self) -> VmLockGuard<'_> {
        self.acquire();
        VmLockGuard { lock: self }
    }

    /// 当前线程持有锁时，释放锁执行 `f` 后重新获取（`f` panic 时同样重新获取）；
    /// 否则直接执行 `f`
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.is_held_by_current() {
            return f();
        }
        self.release();
        let _reacquire = Reacquire { lock: self };
        f()
    }

    /// 锁是否被持有
    pub fn is_held(&self) -> bool {
        self.state.lock().owner != Owner::Free
    }

    /// 当前线程是否持有锁
    pub fn is_held_by_current(&self) -> bool {
        self.state.lock().owner == Owner::Held(thread::current().id())
    }

    /// 当前持有者
    pub fn owner(&self) -> Owner {
        self.state.lock().owner
    }

    /// 阻塞在 acquire 中的线程数
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    /// 让出交接状态
    pub fn handoff(&self) -> Handoff {
        self.state.lock().handoff
    }

    /// fork 之后在子进程中重置锁，并由调用线程持有
    ///
    /// 子进程只保留 fork 线程，fork 时其他线程的 acquire 无法恢复，
    /// 因此只能在没有其他线程竞争锁的状态下 fork
    pub fn fork_reset(&self) {
        match self.state.try_lock() {
            Some(mut state) => {
                *state = LockState::new();
                state.owner = Owner::Held(thread::current().id());
            }
            None => bug("VM lock mutex was held across fork; fork only from a quiescent state"),
        }
    }

    fn acquire_locked(&self, state: &mut MutexGuard<'_, LockState>) {
        let me = thread::current().id();
        if state.owner == Owner::Held(me) {
            bug("VM lock acquired recursively");
        }

        if state.owner != Owner::Free {
            state.waiting += 1;
            if state.waiting == 1 {
                // 转入轮询模式
                if let Some(waker) = &self.waker {
                    waker.wake();
                }
            }

            while state.owner != Owner::Free {
                self.free.wait(state);
            }

            state.waiting -= 1;

            if state.handoff == Handoff::Pending {
                state.handoff = Handoff::Acked;
                self.switch.notify_one();
            }
        }

        state.owner = Owner::Held(me);
    }

    fn release_locked(&self, state: &mut MutexGuard<'_, LockState>) {
        match state.owner {
            Owner::Held(id) if id == thread::current().id() => {}
            Owner::Held(_) => bug("VM lock released by a thread that does not hold it"),
            Owner::Free => bug("VM lock released while not held"),
        }
        state.owner = Owner::Free;
        if state.waiting > 0 {
            self.free.notify_one();
        }
    }
}

impl Default for VmLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VmLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VmLock")
            .field("owner", &state.owner)
            .field("waiting", &state.waiting)
            .field("handoff", &state.handoff)
            .finish()
    }
}

/// VM 锁守卫，析构时释放
pub struct VmLockGuard<'a> {
    lock: &'a VmLock,
}

impl VmLockGuard<'_> {
    /// 让出锁，返回时重新持有
    pub fn yield_now(&self) {
        self.lock.yield_now();
    }

    /// 暂时释放锁执行 `f`
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.unlocked(f)
    }
}

impl Drop for VmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

struct Reacquire<'a> {
    lock: &'a VmLock,
}

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        self.lock.acquire();
    }
}

#[cfg(unix)]
mod platform {
    pub fn yield_thread() {
        unsafe {
            libc::sched_yield();
        }
    }
}

#[cfg(windows)]
mod platform {
    pub fn yield_thread() {
        unsafe {
            winapi::um::processthreadsapi::SwitchToThread();
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub fn yield_thread() {
        std::thread::yield_now();
    }
}
