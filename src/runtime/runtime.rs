//! 运行时入口
//!
//! `Runtime` 持有一个解释器实例的全部线程状态：VM 锁、阻塞调用登记表、
//! 线程缓存、主线程栈描述、计时器线程、中断标记和线程表。
//! 同一进程中可以同时存在多个运行时，彼此独立。

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error::{ThreadError, ThreadResult};
use super::machine::{self, Job, NativeThread, SleepOutcome, ThreadRef};
use super::preempt::InterruptState;
use super::stack::{probe_current, MainStack};
use super::thread_cache::ThreadCache;
use super::timeout::Deadline;
use super::timer::{on_timer_thread, TimerTarget, TimerThread};
use super::unblock::{signal, UnblockFn, UnblockRegistry};
use super::vm_lock::{VmLock, VmLockGuard};

/// 计时器每次触发时调用的钩子
pub type InterruptHook = Arc<dyn Fn() + Send + Sync>;

/// 运行时共享状态
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) vm_lock: VmLock,
    pub(crate) registry: UnblockRegistry,
    pub(crate) cache: ThreadCache<Job>,
    pub(crate) main_stack: MainStack,
    pub(crate) timer: TimerThread,
    pub(crate) interrupts: InterruptState,
    /// OS 线程 -> 线程记录
    pub(crate) threads: DashMap<ThreadId, Arc<NativeThread>>,
    hook: RwLock<Option<InterruptHook>>,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl TimerTarget for Shared {
    fn tick(&self) {
        self.interrupts.set_timer_interrupt();
        self.registry.wake_all_blocked();
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn needs_polling(&self) -> bool {
        self.vm_lock.waiting() > 0 || !self.registry.is_empty()
    }
}

/// 运行时句柄
///
/// 可以克隆并移动到工作线程中，用于在其中访问运行时功能
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl RuntimeHandle {
    // ========== 线程 ==========

    /// 创建原生线程，使用配置的栈大小
    pub fn spawn<F>(&self, f: F) -> ThreadResult<ThreadRef>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with_stack_size(self.shared.config.thread_stack_size, f)
    }

    /// 创建指定栈大小的原生线程
    pub fn spawn_with_stack_size<F>(&self, stack_size: usize, f: F) -> ThreadResult<ThreadRef>
    where
        F: FnOnce() + Send + 'static,
    {
        machine::spawn(&self.shared, stack_size, Box::new(f))
    }

    /// 等待线程结束；调用线程持有 VM 锁时等待期间释放
    pub fn join(&self, th: &ThreadRef) -> ThreadResult<()> {
        self.shared.vm_lock.unlocked(|| th.join())
    }

    /// 调用线程在本运行时中的记录
    pub fn current_thread(&self) -> Option<Arc<NativeThread>> {
        self.shared
            .threads
            .get(&thread::current().id())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 按 OS 线程查找记录
    pub fn thread_for(&self, id: ThreadId) -> Option<Arc<NativeThread>> {
        self.shared.threads.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// 已登记的线程数
    pub fn thread_count(&self) -> usize {
        self.shared.threads.len()
    }

    /// 登记一个不是由运行时创建的线程
    ///
    /// 无法探测栈范围时返回 `StackUnavailable`
    pub fn attach_current_thread(&self) -> ThreadResult<Arc<NativeThread>> {
        if let Some(th) = self.current_thread() {
            return Ok(th);
        }
        let th = Arc::new(NativeThread::new(self.shared.next_thread_id()));
        th.init_stack(&self.shared.main_stack)?;
        th.bind_os_thread();
        self.shared.threads.insert(thread::current().id(), Arc::clone(&th));
        NativeThread::set_current(Some(Arc::clone(&th)));
        tracing::debug!("thread {} attached", th.id);
        Ok(th)
    }

    /// 注销调用线程
    pub fn detach_current_thread(&self) -> Option<Arc<NativeThread>> {
        let (_, th) = self.shared.threads.remove(&thread::current().id())?;
        if NativeThread::current().map_or(false, |cur| Arc::ptr_eq(&cur, &th)) {
            NativeThread::set_current(None);
        }
        tracing::debug!("thread {} detached", th.id);
        Some(th)
    }

    /// 线程缓存中空闲的 OS 线程数
    pub fn cached_thread_count(&self) -> usize {
        self.shared.cache.idle_count()
    }

    // ========== VM 锁 ==========

    #[inline]
    pub fn vm_lock(&self) -> &VmLock {
        &self.shared.vm_lock
    }

    pub fn acquire(&self) {
        self.shared.vm_lock.acquire();
    }

    pub fn release(&self) {
        self.shared.vm_lock.release();
    }

    pub fn yield_now(&self) {
        self.shared.vm_lock.yield_now();
    }

    pub fn lock(&self) -> VmLockGuard<'_> {
        self.shared.vm_lock.lock()
    }

    /// 安全点检查：取走计时器中断，持有 VM 锁时让出
    ///
    /// 有中断时返回 true
    pub fn check_interrupts(&self) -> bool {
        if !self.shared.interrupts.take_timer_interrupt() {
            return false;
        }
        if self.shared.vm_lock.is_held_by_current() {
            self.shared.vm_lock.yield_now();
        }
        true
    }

    #[inline]
    pub fn interrupts(&self) -> &InterruptState {
        &self.shared.interrupts
    }

    /// 设置计时器钩子
    pub fn set_interrupt_hook(&self, hook: Option<InterruptHook>) {
        *self.shared.hook.write() = hook;
    }

    // ========== 睡眠与阻塞调用 ==========

    /// 释放 VM 锁睡眠，`None` 表示直到被中断
    pub fn sleep(&self, timeout: Option<Duration>) -> ThreadResult<SleepOutcome> {
        let th = self.current_thread().ok_or(ThreadError::NotAttached)?;
        let deadline = timeout.map(Deadline::after);
        Ok(self.shared.vm_lock.unlocked(|| th.sleep(deadline.as_ref())))
    }

    /// 释放 VM 锁执行阻塞调用，期间可以被计时器唤醒
    pub fn blocking_region<R>(&self, f: impl FnOnce() -> R) -> ThreadResult<R> {
        let unblock = self.default_unblock();
        self.blocking_region_with(unblock, f)
    }

    /// 使用自定义解除阻塞回调执行阻塞调用
    pub fn blocking_region_with<R>(&self, unblock: UnblockFn, f: impl FnOnce() -> R) -> ThreadResult<R> {
        let th = self.current_thread().ok_or(ThreadError::NotAttached)?;
        Ok(self.shared.vm_lock.unlocked(|| {
            let _call = self.shared.registry.enter(&th, unblock);
            // 登记表非空，计时器切换到轮询
            self.shared.timer.wake();
            f()
        }))
    }

    /// 默认的解除阻塞回调：唤醒计时器线程并向阻塞线程发送唤醒信号
    pub fn default_unblock(&self) -> UnblockFn {
        let waker = self.shared.timer.waker();
        Arc::new(move |th: &NativeThread| {
            if !on_timer_thread() {
                waker.wake();
            }
            if let Some(os) = th.os_thread() {
                signal::deliver(&os);
            }
        })
    }

    #[inline]
    pub fn registry(&self) -> &UnblockRegistry {
        &self.shared.registry
    }

    // ========== 计时器线程 ==========

    /// 启动计时器线程，已在运行时只增加引用计数
    pub fn start_timer_thread(&self) -> bool {
        let target: Arc<dyn TimerTarget> = self.shared.clone();
        self.shared.timer.start(target)
    }

    /// 停止计时器线程，返回是否是最后一次停止
    pub fn stop_timer_thread(&self, force_close: bool) -> bool {
        self.shared.timer.stop(force_close)
    }

    pub fn is_timer_running(&self) -> bool {
        self.shared.timer.is_running()
    }

    // ========== 其他 ==========

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    #[inline]
    pub fn main_stack(&self) -> &MainStack {
        &self.shared.main_stack
    }
}

/// 线程运行时
pub struct Runtime {
    handle: RuntimeHandle,
    main: Arc<NativeThread>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// 创建运行时
    ///
    /// 调用线程成为主线程：采集主线程栈，登记线程记录，获取 VM 锁，
    /// 然后启动计时器线程
    pub fn new(config: RuntimeConfig) -> ThreadResult<Self> {
        let main_stack = MainStack::capture();
        if main_stack.bounds.is_unknown() {
            probe_current()?;
        }
        signal::install_wake_handler();

        let timer = TimerThread::new(config.timer_quantum);
        let shared = Arc::new(Shared {
            vm_lock: VmLock::with_waker(timer.waker()),
            registry: UnblockRegistry::new(),
            cache: ThreadCache::new(),
            main_stack,
            timer,
            interrupts: InterruptState::new(),
            threads: DashMap::new(),
            hook: RwLock::new(None),
            next_id: AtomicU64::new(0),
            config,
        });

        let main = Arc::new(NativeThread::new(shared.next_thread_id()));
        main.bind_os_thread();
        main.init_stack(&shared.main_stack)?;
        shared.threads.insert(thread::current().id(), Arc::clone(&main));
        NativeThread::set_current(Some(Arc::clone(&main)));

        let handle = RuntimeHandle { shared };
        handle.acquire();
        handle.start_timer_thread();
        tracing::debug!("runtime initialized (main thread {})", main.id);

        Ok(Self {
            handle,
            main,
            shut_down: AtomicBool::new(false),
        })
    }

    /// 使用环境变量和默认值创建运行时
    pub fn with_defaults() -> ThreadResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// 获取可以移动到其他线程的句柄
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// 主线程记录
    #[inline]
    pub fn main_thread(&self) -> &Arc<NativeThread> {
        &self.main
    }

    /// fork 之后在子进程中重置线程状态
    ///
    /// 子进程只剩调用线程：重置 VM 锁并由调用线程持有，清空线程缓存、
    /// 阻塞调用登记表和其他线程的记录，重新启动计时器线程
    pub fn fork_reset(&self) {
        let shared = &self.handle.shared;
        shared.vm_lock.fork_reset();
        shared.timer.reset_after_fork();
        shared.cache.reset();
        shared.registry.retain_current();

        let me = thread::current().id();
        shared.threads.retain(|id, _| *id == me);
        shared.interrupts.clear();

        self.handle.start_timer_thread();
        tracing::debug!("runtime reset after fork");
    }

    /// 关闭运行时：停止计时器线程，释放缓存中的空闲线程，
    /// 调用线程持有 VM 锁时释放
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.handle.shared;
        while !shared.timer.stop(true) {}
        shared.cache.close();
        if shared.vm_lock.is_held_by_current() {
            shared.vm_lock.release();
        }
        if self.main.is_current() {
            shared.threads.remove(&thread::current().id());
            NativeThread::set_current(None);
        }
        tracing::debug!("runtime shut down");
    }
}

impl Deref for Runtime {
    type Target = RuntimeHandle;

    fn deref(&self) -> &RuntimeHandle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
