//! 信号（Signal）
//!
//! 推送式、重放最新值的观察源，`Command` 通过它对外发布 `can_execute` / `is_executing`：
//! - `observe`：回调订阅，订阅时立即收到当前值，随后按序收到每一次变化；
//! - `watch`：基于 `tokio::sync::watch` 的异步流，只保证看到最新值（中间值可能被合并）；
//! - `close`：释放全部订阅者并结束所有流，之后的 `set` 被忽略。
//!
//! 分发是串行化的：在回调内部再次 `set` 会进入队列，待当前一轮分发结束后再投递，
//! 因此任何订阅者都不会在新值之后再看到旧值。
//!
use futures_core::stream::BoxStream;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// 重放最新值的推送信号
///
/// 克隆得到的是同一信号的另一个句柄。相等的值不会重复发布。
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    state: Mutex<SignalState<T>>,
}

struct SignalState<T> {
    value: T,
    // 最近一次带版本发布的版本号，仅 `set_at` 使用
    epoch: u64,
    // 每次值变化自增，用于过滤晚于变化才注册的订阅者
    seq: u64,
    next_id: u64,
    observers: Vec<ObserverSlot<T>>,
    pending: VecDeque<Pending<T>>,
    dispatching: bool,
    // None 表示信号已关闭
    sender: Option<watch::Sender<T>>,
}

struct ObserverSlot<T> {
    id: u64,
    since: u64,
    // 解绑或关闭时清除；分发在锁外回调前检查，已取出的回调也不会再被调用
    alive: Arc<AtomicBool>,
    callback: Observer<T>,
}

impl<T> ObserverSlot<T> {
    fn target(&self) -> (Arc<AtomicBool>, Observer<T>) {
        (Arc::clone(&self.alive), Arc::clone(&self.callback))
    }
}

enum Pending<T> {
    /// 广播给注册早于该变化的全部订阅者
    Emit { seq: u64, value: T },
    /// 新订阅者的首个值
    Prime { id: u64, value: T },
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SignalInner<T> {
    fn lock(&self) -> MutexGuard<'_, SignalState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// 以初始值创建信号
    pub fn new(initial: T) -> Self {
        let (sender, _rx) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    value: initial,
                    epoch: 0,
                    seq: 0,
                    next_id: 0,
                    observers: Vec::new(),
                    pending: VecDeque::new(),
                    dispatching: false,
                    sender: Some(sender),
                }),
            }),
        }
    }

    /// 同步读取当前值
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// 写入新值并通知订阅者，返回是否发生了发布
    pub fn set(&self, value: T) -> bool {
        self.publish(None, |_| value)
    }

    /// 基于当前值原子地计算并写入新值
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        self.publish(None, f)
    }

    /// 带版本号写入：版本号不大于上次已应用的版本时丢弃
    pub(crate) fn set_at(&self, value: T, epoch: u64) -> bool {
        self.publish(Some(epoch), |_| value)
    }

    /// 回调订阅：立即收到当前值，随后收到每一次变化
    ///
    /// 返回的 [`Subscription`] 被 drop 时自动解绑。已关闭的信号不会再回调。
    pub fn observe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let id = {
            let mut state = self.inner.lock();
            if state.sender.is_none() {
                return Subscription::detached();
            }

            let id = state.next_id;
            state.next_id += 1;
            let since = state.seq;
            state.observers.push(ObserverSlot {
                id,
                since,
                alive: Arc::clone(&alive),
                callback: Arc::new(f),
            });
            let value = state.value.clone();
            state.pending.push_back(Pending::Prime { id, value });

            if !state.dispatching {
                state.dispatching = true;
                drop(state);
                self.drain();
            }

            id
        };

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            alive.store(false, Ordering::SeqCst);
            if let Some(inner) = weak.upgrade() {
                inner.lock().observers.retain(|o| o.id != id);
            }
        })
    }

    /// 异步订阅：先产出当前值，之后产出每次变化后的最新值；信号关闭时流结束
    pub fn watch(&self) -> BoxStream<'static, T> {
        let state = self.inner.lock();
        match &state.sender {
            Some(sender) => Box::pin(WatchStream::new(sender.subscribe())),
            None => Box::pin(futures_util::stream::empty()),
        }
    }

    /// 关闭信号：释放全部订阅者，结束全部 `watch` 流（幂等）
    pub fn close(&self) {
        let (sender, observers) = {
            let mut state = self.inner.lock();
            state.pending.clear();
            for observer in &state.observers {
                observer.alive.store(false, Ordering::SeqCst);
            }
            (state.sender.take(), std::mem::take(&mut state.observers))
        };
        // 在锁外释放，避免订阅者的析构逻辑回到本信号
        drop(sender);
        drop(observers);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().sender.is_none()
    }

    /// 当前回调订阅者数量
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    fn publish<F>(&self, epoch: Option<u64>, next: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let mut state = self.inner.lock();
        if state.sender.is_none() {
            return false;
        }
        if let Some(epoch) = epoch {
            if epoch <= state.epoch {
                return false;
            }
            state.epoch = epoch;
        }

        let value = next(&state.value);
        if state.value == value {
            return false;
        }

        state.value = value.clone();
        state.seq += 1;
        let seq = state.seq;
        if let Some(sender) = &state.sender {
            sender.send_replace(value.clone());
        }
        state.pending.push_back(Pending::Emit { seq, value });

        if !state.dispatching {
            state.dispatching = true;
            drop(state);
            self.drain();
        }

        true
    }

    /// 由当前分发者执行：逐条取出待投递项，在锁外回调
    fn drain(&self) {
        let _reset = DispatchReset(self.inner.as_ref());

        loop {
            let (value, targets) = {
                let mut state = self.inner.lock();
                let Some(item) = state.pending.pop_front() else {
                    state.dispatching = false;
                    return;
                };

                match item {
                    Pending::Emit { seq, value } => {
                        let targets: Vec<_> = state
                            .observers
                            .iter()
                            .filter(|o| o.since < seq)
                            .map(ObserverSlot::target)
                            .collect();
                        (value, targets)
                    }
                    Pending::Prime { id, value } => {
                        let targets: Vec<_> = state
                            .observers
                            .iter()
                            .filter(|o| o.id == id)
                            .map(ObserverSlot::target)
                            .collect();
                        (value, targets)
                    }
                }
            };

            for (alive, callback) in targets {
                if alive.load(Ordering::SeqCst) {
                    callback(&value);
                }
            }
        }
    }
}

impl<T> fmt::Debug for Signal<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Signal")
            .field("value", &state.value)
            .field("observers", &state.observers.len())
            .field("closed", &state.sender.is_none())
            .finish()
    }
}

// 订阅者回调 panic 时释放分发权，否则信号将永久停止投递
struct DispatchReset<'a, T>(&'a SignalInner<T>);

impl<T> Drop for DispatchReset<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.0.lock();
            state.pending.clear();
            state.dispatching = false;
        }
    }
}

/// 回调订阅句柄
///
/// 调用 [`Subscription::unsubscribe`] 或 drop 时解绑，重复调用无副作用。
#[must_use = "dropping a Subscription detaches the observer"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    fn detached() -> Self {
        Self { detach: None }
    }

    /// 是否仍处于订阅状态
    pub fn is_active(&self) -> bool {
        self.detach.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
