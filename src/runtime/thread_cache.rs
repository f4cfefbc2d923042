//! 线程缓存
//!
//! 结束工作的 OS 线程在这里登记一个空闲槽位并等待一段时间，
//! 期间创建的新线程直接交给它执行，省去一次 OS 线程创建

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Condvar, Mutex};

use super::timeout::{wait_until, Deadline, WaitOutcome};

/// 空闲槽位
struct IdleSlot {
    id: u64,
    cond: Arc<Condvar>,
}

struct CacheState<T> {
    /// 空闲槽位栈（后进先出）
    idle: Vec<IdleSlot>,
    /// 已交付但尚未被取走的任务
    delivered: HashMap<u64, T>,
    next_slot: u64,
    closed: bool,
}

/// 线程缓存
pub struct ThreadCache<T> {
    state: Mutex<CacheState<T>>,
}

impl<T> ThreadCache<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                idle: Vec::new(),
                delivered: HashMap::new(),
                next_slot: 0,
                closed: false,
            }),
        }
    }

    /// 登记空闲槽位并等待新任务
    ///
    /// 超时或缓存关闭时返回 None，调用线程应当退出
    pub fn register_and_wait(&self, idle_timeout: Duration) -> Option<T> {
        let cond = Arc::new(Condvar::new());
        let deadline = Deadline::after(idle_timeout);

        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let id = state.next_slot;
        state.next_slot += 1;
        state.idle.push(IdleSlot { id, cond: Arc::clone(&cond) });

        loop {
            if let Some(item) = state.delivered.remove(&id) {
                return Some(item);
            }
            if state.closed {
                break;
            }
            if wait_until(&cond, &mut state, &deadline) == WaitOutcome::TimedOut {
                if let Some(item) = state.delivered.remove(&id) {
                    return Some(item);
                }
                tracing::trace!("cached thread slot {} expired", id);
                break;
            }
        }

        state.idle.retain(|slot| slot.id != id);
        None
    }

    /// 把任务交给最近登记的空闲线程；没有空闲线程时原样返回
    pub fn hand_off(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        let slot = match state.idle.pop() {
            Some(slot) => slot,
            None => return Err(item),
        };
        state.delivered.insert(slot.id, item);
        slot.cond.notify_one();
        Ok(())
    }

    /// 空闲线程数
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// 关闭缓存，唤醒所有空闲线程让它们退出
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for slot in state.idle.drain(..) {
            slot.cond.notify_one();
        }
    }

    /// fork 之后子进程中没有空闲线程，丢弃所有槽位
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.idle.clear();
        state.delivered.clear();
    }
}

impl<T> Default for ThreadCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
