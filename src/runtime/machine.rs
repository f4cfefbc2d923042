//! 原生线程 (Machine)
//!
//! 每个执行字节码的 OS 线程对应一个 `NativeThread` 记录：
//! - 线程身份（进入线程后绑定一次）
//! - 栈范围，用于栈溢出检测
//! - 解除阻塞回调槽位，由中断锁保护，其他线程可以读写
//! - 私有的睡眠条件变量
//!
//! 新线程优先交给线程缓存中的空闲 OS 线程，没有空闲线程时才创建

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use parking_lot::{Condvar, Mutex};

use super::runtime::Shared;
use super::stack::{probe_current, space_size, MainStack, StackBounds, StackGrowth};
use super::timeout::{wait_until, Deadline, WaitOutcome};
use super::unblock::UnblockFn;
use crate::error::{ThreadError, ThreadResult};

thread_local! {
    static CURRENT: RefCell<Option<Arc<NativeThread>>> = const { RefCell::new(None) };
}

/// OS 线程身份
#[derive(Debug, Clone, Copy)]
pub struct OsThread {
    id: ThreadId,
    #[cfg(unix)]
    raw: libc::pthread_t,
}

// pthread_t 在部分平台上是指针，但只作为不透明句柄传给 pthread_kill
unsafe impl Send for OsThread {}
unsafe impl Sync for OsThread {}

impl OsThread {
    /// 调用线程的身份
    pub fn current() -> Self {
        Self {
            id: thread::current().id(),
            #[cfg(unix)]
            raw: unsafe { libc::pthread_self() },
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[cfg(unix)]
    #[inline]
    pub fn raw(&self) -> libc::pthread_t {
        self.raw
    }
}

/// `sleep` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// 被解除阻塞回调唤醒（也可能是伪唤醒）
    Woken,
    /// 超时
    TimedOut,
    /// 有待处理的中断
    Interrupted,
}

/// 原生线程记录
pub struct NativeThread {
    /// 线程 ID
    pub id: u64,
    /// OS 线程身份
    os: OnceLock<OsThread>,
    /// 栈范围
    stack: Mutex<StackBounds>,
    /// 解除阻塞回调（中断锁）
    interrupt_lock: Mutex<Option<UnblockFn>>,
    /// 睡眠条件变量，配合中断锁使用
    sleep_cond: Condvar,
    /// 待处理的中断
    interrupt_pending: AtomicBool,
    /// 是否在阻塞调用登记表中
    blocking: AtomicBool,
    /// 执行结果，None 表示尚未结束
    done: Mutex<Option<Result<(), String>>>,
    done_cond: Condvar,
}

impl NativeThread {
    /// 创建未绑定 OS 线程的记录
    pub fn new(id: u64) -> Self {
        Self {
            id,
            os: OnceLock::new(),
            stack: Mutex::new(StackBounds::new(0, 0)),
            interrupt_lock: Mutex::new(None),
            sleep_cond: Condvar::new(),
            interrupt_pending: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            done: Mutex::new(None),
            done_cond: Condvar::new(),
        }
    }

    /// 调用线程的记录
    pub fn current() -> Option<Arc<NativeThread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// 设置调用线程的记录，返回之前的记录
    pub(crate) fn set_current(th: Option<Arc<NativeThread>>) -> Option<Arc<NativeThread>> {
        CURRENT.with(|c| c.replace(th))
    }

    /// 绑定到调用线程
    pub fn bind_os_thread(&self) {
        if self.os.set(OsThread::current()).is_err() {
            tracing::warn!("thread {} is already bound to an OS thread", self.id);
        }
    }

    /// 绑定的 OS 线程
    pub fn os_thread(&self) -> Option<OsThread> {
        self.os.get().copied()
    }

    /// 调用线程是否就是该记录描述的线程
    pub fn is_current(&self) -> bool {
        self.os
            .get()
            .map_or(false, |os| os.id == thread::current().id())
    }

    // ========== 栈 ==========

    /// 栈范围
    pub fn stack_bounds(&self) -> StackBounds {
        *self.stack.lock()
    }

    pub(crate) fn set_stack_bounds(&self, bounds: StackBounds) {
        *self.stack.lock() = bounds;
    }

    /// 预先设置栈可用大小上限（创建线程时计算）
    pub(crate) fn set_stack_max(&self, max_size: usize) {
        self.stack.lock().max_size = max_size;
    }

    /// 在线程入口处确定栈范围
    ///
    /// 主线程直接使用启动时采集的结果；其他线程探测自己的栈，
    /// 可用大小不超过创建时预先计算的上限
    pub fn init_stack(&self, main: &MainStack) -> ThreadResult<()> {
        if main.is_current() {
            self.set_stack_bounds(main.bounds);
            return Ok(());
        }

        let probed = probe_current()?;
        let mut stack = self.stack.lock();
        let max_size = match stack.max_size {
            0 => probed.max_size,
            limit => limit.min(probed.max_size),
        };
        *stack = StackBounds::new(probed.start, max_size);
        tracing::trace!(
            "thread {} stack: start={:#x} max_size={}",
            self.id,
            stack.start,
            stack.max_size
        );
        Ok(())
    }

    /// 地址是否落在栈末端的保留区域内
    ///
    /// 栈范围未知时改为探测调用线程的栈
    pub fn stack_overflowed(&self, addr: usize) -> bool {
        let bounds = self.stack_bounds();
        if !bounds.is_unknown() {
            return bounds.stack_overflowed(addr, StackGrowth::NATIVE);
        }
        match probe_current() {
            Ok(probed) => probed.stack_overflowed(addr, StackGrowth::NATIVE),
            Err(_) => false,
        }
    }

    // ========== 中断与解除阻塞 ==========

    /// 设置或清除解除阻塞回调
    pub fn set_unblock(&self, unblock: Option<UnblockFn>) {
        *self.interrupt_lock.lock() = unblock;
    }

    /// 是否设置了解除阻塞回调
    pub fn has_unblock(&self) -> bool {
        self.interrupt_lock.lock().is_some()
    }

    /// 在中断锁内调用解除阻塞回调
    ///
    /// 回调中不能再访问本记录的中断锁
    pub fn run_unblock(&self) {
        let slot = self.interrupt_lock.lock();
        if let Some(unblock) = slot.as_ref() {
            unblock(self);
        }
    }

    /// 请求中断：设置标记并唤醒阻塞中的线程
    pub fn interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
        self.run_unblock();
    }

    /// 是否有待处理的中断
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_pending.load(Ordering::Acquire)
    }

    /// 取走待处理的中断
    pub fn take_interrupt(&self) -> bool {
        self.interrupt_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Release);
    }

    /// 是否正处于登记过的阻塞调用中
    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// 在私有条件变量上睡眠
    ///
    /// 只能由记录描述的线程调用，调用者负责释放 VM 锁。
    /// 已有待处理的中断时立即返回；睡眠期间 `interrupt` 会唤醒它
    pub fn sleep(&self, deadline: Option<&Deadline>) -> SleepOutcome {
        let mut slot = self.interrupt_lock.lock();
        if self.is_interrupted() {
            return SleepOutcome::Interrupted;
        }

        *slot = Some(Arc::new(|th: &NativeThread| {
            th.sleep_cond.notify_all();
        }));
        let outcome = match deadline {
            None => {
                tracing::trace!("thread {} sleeping", self.id);
                self.sleep_cond.wait(&mut slot);
                SleepOutcome::Woken
            }
            Some(deadline) => match wait_until(&self.sleep_cond, &mut slot, deadline) {
                WaitOutcome::Woken => SleepOutcome::Woken,
                WaitOutcome::TimedOut => SleepOutcome::TimedOut,
            },
        };
        *slot = None;

        if self.is_interrupted() {
            SleepOutcome::Interrupted
        } else {
            outcome
        }
    }

    // ========== 完成状态 ==========

    fn finish(&self, result: Result<(), String>) {
        let mut done = self.done.lock();
        *done = Some(result);
        self.done_cond.notify_all();
    }

    /// 工作是否已结束
    pub fn is_finished(&self) -> bool {
        self.done.lock().is_some()
    }

    fn wait_done(&self) -> Result<(), String> {
        let mut done = self.done.lock();
        loop {
            if let Some(result) = done.as_ref() {
                return result.clone();
            }
            self.done_cond.wait(&mut done);
        }
    }
}

impl std::fmt::Debug for NativeThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeThread")
            .field("id", &self.id)
            .field("os", &self.os_thread().map(|os| os.id))
            .field("interrupted", &self.is_interrupted())
            .field("blocking", &self.is_blocking())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// 新建线程的句柄
///
/// 线程本身是分离的；join 等待的是这次创建提交的工作结束，
/// 执行它的 OS 线程之后可能留在缓存中继续服务
#[derive(Debug, Clone)]
pub struct ThreadRef {
    record: Arc<NativeThread>,
}

impl ThreadRef {
    pub(crate) fn new(record: Arc<NativeThread>) -> Self {
        Self { record }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// 线程记录
    #[inline]
    pub fn record(&self) -> &Arc<NativeThread> {
        &self.record
    }

    pub fn is_finished(&self) -> bool {
        self.record.is_finished()
    }

    /// 等待工作结束
    ///
    /// 工作 panic 或等待的是调用线程自己时返回 `ThreadError::Join`
    pub fn join(&self) -> ThreadResult<()> {
        if self.record.is_current() && !self.record.is_finished() {
            return Err(ThreadError::Join(format!(
                "thread {} cannot join itself",
                self.record.id
            )));
        }
        self.record.wait_done().map_err(ThreadError::Join)
    }
}

/// 交给工作线程的任务
pub(crate) struct Job {
    record: Arc<NativeThread>,
    work: Box<dyn FnOnce() + Send + 'static>,
}

/// 创建原生线程执行 `work`
pub(crate) fn spawn(
    shared: &Arc<Shared>,
    stack_size: usize,
    work: Box<dyn FnOnce() + Send + 'static>,
) -> ThreadResult<ThreadRef> {
    let record = Arc::new(NativeThread::new(shared.next_thread_id()));
    let mut job = Job {
        record: Arc::clone(&record),
        work,
    };

    if shared.config.use_thread_cache {
        match shared.cache.hand_off(job) {
            Ok(()) => {
                tracing::debug!("thread {} handed to a cached OS thread", record.id);
                return Ok(ThreadRef::new(record));
            }
            Err(returned) => job = returned,
        }
    }

    record.set_stack_max(stack_size.saturating_sub(space_size(stack_size)));

    let worker = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("vm-thread-{}", record.id))
        .stack_size(stack_size)
        .spawn(move || thread_main(worker, job))?;

    tracing::debug!("thread {} created (stack {} bytes)", record.id, stack_size);
    Ok(ThreadRef::new(record))
}

/// 工作线程入口
fn thread_main(shared: Arc<Shared>, first: Job) {
    if let Err(e) = first.record.init_stack(&shared.main_stack) {
        tracing::warn!("thread {}: {}", first.record.id, e);
    }
    let bounds = first.record.stack_bounds();

    let mut job = first;
    loop {
        run_job(&shared, job);

        if !shared.config.use_thread_cache {
            break;
        }
        match shared.cache.register_and_wait(shared.config.thread_cache_idle_timeout) {
            Some(next) => {
                // 复用时沿用这个 OS 线程的栈范围
                next.record.set_stack_bounds(bounds);
                tracing::trace!("cached OS thread picked up thread {}", next.record.id);
                job = next;
            }
            None => break,
        }
    }
    tracing::trace!("OS thread {:?} exiting", thread::current().id());
}

/// 在 VM 锁内执行一个任务
fn run_job(shared: &Shared, job: Job) {
    let Job { record, work } = job;
    record.bind_os_thread();

    let os_id = thread::current().id();
    shared.threads.insert(os_id, Arc::clone(&record));
    let previous = NativeThread::set_current(Some(Arc::clone(&record)));

    let result = {
        let _vm = shared.vm_lock.lock();
        panic::catch_unwind(AssertUnwindSafe(work))
    };

    NativeThread::set_current(previous);
    shared.threads.remove(&os_id);

    let result = result.map_err(|payload| {
        let msg = panic_message(payload.as_ref());
        tracing::warn!("thread {} panicked: {}", record.id, msg);
        msg
    });
    record.finish(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "thread panicked".to_string()
    }
}
