//! 阻塞调用登记表
//!
//! 记录正在执行阻塞外部调用（I/O 等待、睡眠）的原生线程。
//! 这些线程不持有 VM 锁，只能通过向该线程发送唤醒信号让系统调用以
//! EINTR 提前返回，再由线程自己的解除阻塞回调把它转成逻辑上的唤醒

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;

use super::machine::{NativeThread, OsThread};

/// 解除阻塞回调，在目标线程的中断锁内以该线程记录为参数调用
pub type UnblockFn = Arc<dyn Fn(&NativeThread) + Send + Sync>;

/// 阻塞调用登记表
pub struct UnblockRegistry {
    entries: Mutex<HashMap<u64, Arc<NativeThread>>>,
}

impl UnblockRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 进入阻塞调用前：设置回调并登记
    pub fn begin_blocking_call(&self, th: &Arc<NativeThread>, unblock: UnblockFn) {
        th.set_unblock(Some(unblock));
        let mut entries = self.entries.lock();
        if entries.insert(th.id, Arc::clone(th)).is_none() {
            th.set_blocking(true);
        }
    }

    /// 阻塞调用返回后：清除回调并移出登记表
    pub fn end_blocking_call(&self, th: &NativeThread) {
        th.set_unblock(None);
        let mut entries = self.entries.lock();
        if entries.remove(&th.id).is_some() {
            th.set_blocking(false);
        }
    }

    /// 登记并返回守卫，守卫析构（包括 panic 展开）时自动注销
    pub fn enter<'a>(&'a self, th: &'a Arc<NativeThread>, unblock: UnblockFn) -> BlockingCall<'a> {
        self.begin_blocking_call(th, unblock);
        BlockingCall { registry: self, th }
    }

    /// 唤醒登记表中所有线程
    ///
    /// 向每个线程发送唤醒信号打断其系统调用，再调用它的解除阻塞回调。
    /// 在登记表锁内进行，保证目标线程在此期间不会退出
    pub fn wake_all_blocked(&self) {
        let entries = self.entries.lock();
        for th in entries.values() {
            if let Some(os) = th.os_thread() {
                signal::deliver(&os);
            }
            th.run_unblock();
        }
    }

    /// 线程是否在登记表中
    pub fn contains(&self, th: &NativeThread) -> bool {
        self.entries.lock().contains_key(&th.id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// fork 之后只保留调用线程
    pub(crate) fn retain_current(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, th| th.is_current());
    }
}

impl Default for UnblockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 阻塞调用守卫
pub struct BlockingCall<'a> {
    registry: &'a UnblockRegistry,
    th: &'a Arc<NativeThread>,
}

impl Drop for BlockingCall<'_> {
    fn drop(&mut self) {
        self.registry.end_blocking_call(self.th);
    }
}

/// 唤醒信号
#[cfg(unix)]
pub mod signal {
    use std::sync::Once;

    use super::OsThread;
    use crate::error::bug_errno;

    /// 用于打断阻塞系统调用的信号
    pub const WAKE_SIGNAL: libc::c_int = libc::SIGVTALRM;

    static INSTALL: Once = Once::new();

    extern "C" fn null_handler(_signo: libc::c_int) {}

    /// 安装空信号处理函数（进程内只安装一次）
    ///
    /// 不设置 SA_RESTART，被打断的系统调用以 EINTR 返回
    pub fn install_wake_handler() {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = null_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(WAKE_SIGNAL, &action, std::ptr::null_mut()) != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                bug_errno("sigaction(SIGVTALRM)", errno);
            }
        });
    }

    /// 向指定线程发送唤醒信号
    pub fn deliver(target: &OsThread) {
        loop {
            let r = unsafe { libc::pthread_kill(target.raw(), WAKE_SIGNAL) };
            match r {
                0 => return,
                libc::EINTR => continue,
                libc::ESRCH => {
                    tracing::trace!("wake signal target already exited");
                    return;
                }
                err => {
                    tracing::warn!("pthread_kill failed (errno {})", err);
                    return;
                }
            }
        }
    }
}

/// 没有线程定向信号的平台只依赖解除阻塞回调
#[cfg(not(unix))]
pub mod signal {
    use super::OsThread;

    pub fn install_wake_handler() {}

    pub fn deliver(_target: &OsThread) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_unblock(count: &Arc<AtomicUsize>) -> UnblockFn {
        let count = Arc::clone(count);
        Arc::new(move |_th: &NativeThread| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_registry_visibility() {
        let registry = UnblockRegistry::new();
        let th = Arc::new(NativeThread::new(1));
        let count = Arc::new(AtomicUsize::new(0));

        registry.begin_blocking_call(&th, counting_unblock(&count));
        assert!(registry.contains(&th));
        assert!(th.is_blocking());
        registry.wake_all_blocked();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        registry.end_blocking_call(&th);
        assert!(!registry.contains(&th));
        assert!(registry.is_empty());
        assert!(!th.has_unblock());
        registry.wake_all_blocked();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_ends_call_on_panic() {
        let registry = UnblockRegistry::new();
        let th = Arc::new(NativeThread::new(2));
        let count = Arc::new(AtomicUsize::new(0));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _call = registry.enter(&th, counting_unblock(&count));
            assert_eq!(registry.len(), 1);
            panic!("blocking call failed");
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(!th.is_blocking());
    }

    #[test]
    fn test_every_entry_is_woken() {
        let registry = UnblockRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (10..15).map(|id| Arc::new(NativeThread::new(id))).collect();
        for th in &threads {
            registry.begin_blocking_call(th, counting_unblock(&count));
        }
        assert_eq!(registry.len(), 5);
        registry.wake_all_blocked();
        assert_eq!(count.load(Ordering::SeqCst), 5);

        registry.end_blocking_call(&threads[0]);
        registry.wake_all_blocked();
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_interrupts_blocking_read() {
        use std::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::{Duration, Instant};

        signal::install_wake_handler();
        let registry = Arc::new(UnblockRegistry::new());
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            let read_fd = fds[0];
            thread::spawn(move || {
                let th = Arc::new(NativeThread::new(20));
                th.bind_os_thread();
                let noop: UnblockFn = Arc::new(|_th: &NativeThread| {});
                let errno = {
                    let _call = registry.enter(&th, noop);
                    let mut buf = [0u8; 1];
                    let r = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
                    if r < 0 {
                        std::io::Error::last_os_error().raw_os_error()
                    } else {
                        None
                    }
                };
                done.store(true, Ordering::SeqCst);
                errno
            })
        };

        let start = Instant::now();
        while !done.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(10));
            registry.wake_all_blocked();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reader.join().unwrap(), Some(libc::EINTR));
        assert!(registry.is_empty());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
