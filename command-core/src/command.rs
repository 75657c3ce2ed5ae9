//! 命令（Command）
//!
//! 封装一个动作及其执行状态：
//! - `can_execute`：闸门值 AND（允许并发 OR 未在执行），任一输入变化即同步重算；
//! - `is_executing`：异步动作从开始到落定（成功/失败/panic）期间为 true，同步动作始终为 false；
//! - `execute`：即发即忘，返回可选的 [`Execution`] 句柄供调用方观察结果。
//!
//! 生命周期：`Created --subscribe--> Active --unsubscribe--> Disposed`。
//! 仅 `Active` 状态下 `execute` 才会调用动作；`Disposed` 之后两个信号不再发布任何值。
//!
//! 动作是构建器的必填项：
//!
//! ```
//! use command_core::{Action, Command};
//!
//! let command: Command<u32, u32> = Command::builder()
//!     .action(Action::sync(|n: u32| anyhow::Ok(n + 1)))
//!     .name("increment")
//!     .build();
//! assert_eq!(command.name(), "increment");
//! ```
//!
//! 缺少动作时无法通过编译：
//!
//! ```compile_fail
//! use command_core::Command;
//!
//! let command: Command<u32, u32> = Command::builder().name("increment").build();
//! ```
//!
use crate::action::{Action, AsyncFn};
use crate::error::{CommandError, CommandResult};
use crate::gate::Executability;
use crate::signal::{Signal, Subscription};
use bon::bon;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 注入的失败处理器：每次执行失败调用一次
pub type ErrorHandler = Arc<dyn Fn(&CommandError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Active,
    Disposed,
}

/// 命令：动作 + 可执行闸门 + 执行状态
///
/// 克隆得到的是同一命令的另一个句柄。
pub struct Command<A, T = ()> {
    inner: Arc<CommandInner<A, T>>,
}

struct CommandInner<A, T> {
    name: String,
    action: Action<A, T>,
    executability: Executability,
    allow_concurrent_execution: bool,
    on_error: Option<ErrorHandler>,
    state: Mutex<CommandState>,
    can_execute: Signal<bool>,
    is_executing: Signal<bool>,
    token: CancellationToken,
}

struct CommandState {
    lifecycle: Lifecycle,
    gate: bool,
    in_flight: usize,
    epoch: u64,
    gate_subscription: Option<Subscription>,
}

#[derive(Clone, Copy, Debug)]
struct Snapshot {
    epoch: u64,
    is_executing: bool,
    can_execute: bool,
}

impl CommandState {
    fn snapshot(&mut self, allow_concurrent_execution: bool) -> Snapshot {
        self.epoch += 1;
        let is_executing = self.in_flight > 0;
        Snapshot {
            epoch: self.epoch,
            is_executing,
            can_execute: self.gate && (allow_concurrent_execution || !is_executing),
        }
    }
}

impl<A, T> Clone for Command<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[bon]
impl<A, T> Command<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// 构建命令
    ///
    /// - `action`：必填，缺失时无法通过编译；
    /// - `executability`：默认 `Always`；
    /// - `allow_concurrent_execution`：默认 `false`，仅对异步动作有意义；
    /// - `on_error`：可选的失败处理器，与 [`Execution`] 的结果并行通知。
    #[builder]
    pub fn new(
        action: Action<A, T>,
        #[builder(default, into)] executability: Executability,
        #[builder(default)] allow_concurrent_execution: bool,
        #[builder(default = String::from("command"), into)] name: String,
        on_error: Option<ErrorHandler>,
    ) -> Self {
        let gate = executability.initial();
        Self {
            inner: Arc::new(CommandInner {
                name,
                action,
                executability,
                allow_concurrent_execution,
                on_error,
                state: Mutex::new(CommandState {
                    lifecycle: Lifecycle::Created,
                    gate,
                    in_flight: 0,
                    epoch: 0,
                    gate_subscription: None,
                }),
                can_execute: Signal::new(gate),
                is_executing: Signal::new(false),
                token: CancellationToken::new(),
            }),
        }
    }
}

impl<A, T> Command<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// 以同步动作构建，其余选项取默认值
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::builder().action(Action::sync(f)).build()
    }

    /// 以异步动作构建，其余选项取默认值
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::builder().action(Action::future(f)).build()
    }

    /// 激活命令：将闸门与执行状态组合到 `can_execute`
    ///
    /// 重复调用无副作用；已取消订阅的命令不会被重新激活。
    pub fn subscribe(&self) {
        {
            let mut state = self.inner.lock();
            match state.lifecycle {
                Lifecycle::Active => {
                    debug!(command = %self.inner.name, "already subscribed");
                    return;
                }
                Lifecycle::Disposed => {
                    debug!(command = %self.inner.name, "subscribe after unsubscribe ignored");
                    return;
                }
                Lifecycle::Created => state.lifecycle = Lifecycle::Active,
            }
        }
        debug!(command = %self.inner.name, "subscribed");

        let weak = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .executability
            .connect(&self.inner.token, move |open| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_gate(open);
                }
            });

        // 期间若已被并发取消订阅，闸门订阅在锁外丢弃
        let stale = {
            let mut state = self.inner.lock();
            if state.lifecycle == Lifecycle::Active {
                state.gate_subscription = subscription;
                None
            } else {
                subscription
            }
        };
        drop(stale);
    }

    /// 执行动作
    ///
    /// 返回 `None` 表示本次调用被忽略：命令未激活/已销毁，或异步动作执行中且不允许并发。
    /// 返回的 [`Execution`] 可以直接丢弃，动作仍会运行到落定。
    pub fn execute(&self, args: A) -> Option<Execution<T>> {
        match &self.inner.action {
            Action::Sync(f) => {
                if !self.inner.is_active() {
                    debug!(command = %self.inner.name, "execute ignored, command not active");
                    return None;
                }

                let result = match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(CommandError::ActionFailed { error }),
                    Err(payload) => Err(CommandError::ActionPanicked {
                        reason: panic_reason(payload.as_ref()),
                    }),
                };
                if let Err(err) = &result {
                    self.inner.report(err);
                }
                Some(Execution::ready(result))
            }
            Action::Async(f) => self.execute_async(f, args),
        }
    }

    fn execute_async(&self, f: &AsyncFn<A, T>, args: A) -> Option<Execution<T>> {
        let Ok(runtime) = Handle::try_current() else {
            if !self.inner.is_active() {
                return None;
            }
            let err = CommandError::NoRuntime;
            self.inner.report(&err);
            return Some(Execution::ready(Err(err)));
        };

        let snapshot = {
            let mut state = self.inner.lock();
            if state.lifecycle != Lifecycle::Active {
                debug!(command = %self.inner.name, "execute ignored, command not active");
                return None;
            }
            if state.in_flight > 0 && !self.inner.allow_concurrent_execution {
                debug!(command = %self.inner.name, "execute ignored, already executing");
                return None;
            }
            state.in_flight += 1;
            state.snapshot(self.inner.allow_concurrent_execution)
        };
        self.inner.publish(snapshot);

        // 先登记再调用动作，动作同步 panic 时同样会释放执行标记
        let in_flight = InFlight::new(Arc::clone(&self.inner));
        let future = match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
            Ok(future) => future,
            Err(payload) => {
                let err = CommandError::ActionPanicked {
                    reason: panic_reason(payload.as_ref()),
                };
                return Some(Execution::ready(in_flight.settle(Err(err))));
            }
        };

        let handle = runtime.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(CommandError::ActionFailed { error }),
                Err(payload) => Err(CommandError::ActionPanicked {
                    reason: panic_reason(payload.as_ref()),
                }),
            };
            in_flight.settle(result)
        });

        Some(Execution::spawned(handle))
    }
}

impl<A, T> Command<A, T> {
    /// 销毁命令：释放闸门订阅，停止流闸门，关闭两个信号（幂等，未激活时同样安全）
    ///
    /// 进行中的异步动作不会被中止，但其落定不再产生任何信号。
    pub fn unsubscribe(&self) {
        let subscription = {
            let mut state = self.inner.lock();
            if state.lifecycle == Lifecycle::Disposed {
                return;
            }
            state.lifecycle = Lifecycle::Disposed;
            state.gate_subscription.take()
        };
        drop(subscription);

        self.inner.token.cancel();
        self.inner.can_execute.close();
        self.inner.is_executing.close();
        debug!(command = %self.inner.name, "unsubscribed");
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_async(&self) -> bool {
        self.inner.action.is_async()
    }

    pub fn allows_concurrent_execution(&self) -> bool {
        self.inner.allow_concurrent_execution
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().lifecycle
    }

    /// 尚未落定的异步执行数量
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// 当前是否可执行（同步读取）
    pub fn can_execute(&self) -> bool {
        self.inner.can_execute.get()
    }

    /// 当前是否执行中（同步读取）
    pub fn is_executing(&self) -> bool {
        self.inner.is_executing.get()
    }

    /// `can_execute` 信号
    pub fn can_execute_signal(&self) -> Signal<bool> {
        self.inner.can_execute.clone()
    }

    /// `is_executing` 信号，仅对异步动作有意义
    pub fn is_executing_signal(&self) -> Signal<bool> {
        self.inner.is_executing.clone()
    }
}

impl<A, T> fmt::Debug for Command<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Command")
            .field("name", &self.inner.name)
            .field("action", &self.inner.action)
            .field("lifecycle", &state.lifecycle)
            .field("in_flight", &state.in_flight)
            .field("gate", &state.gate)
            .finish()
    }
}

impl<A, T> CommandInner<A, T> {
    fn lock(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Active
    }

    fn on_gate(&self, open: bool) {
        let snapshot = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.gate = open;
            state.snapshot(self.allow_concurrent_execution)
        };
        self.publish(snapshot);
    }

    fn finish_one(&self) {
        let snapshot = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.snapshot(self.allow_concurrent_execution)
        };
        self.publish(snapshot);
    }

    // 在命令锁之外发布，订阅者可以在回调中再次调用命令
    fn publish(&self, snapshot: Snapshot) {
        self.is_executing
            .set_at(snapshot.is_executing, snapshot.epoch);
        self.can_execute
            .set_at(snapshot.can_execute, snapshot.epoch);
    }

    fn report(&self, err: &CommandError) {
        warn!(command = %self.name, error = %err, "command execution failed");
        if let Some(handler) = &self.on_error {
            handler(err);
        }
    }
}

impl<A, T> Drop for CommandInner<A, T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 一次异步执行的登记；drop 时（含 panic、任务被丢弃）释放执行标记
///
/// 未经 `settle` 即被丢弃（运行时关闭、任务被中止）按 `Cancelled` 上报。
struct InFlight<A, T> {
    inner: Arc<CommandInner<A, T>>,
    settled: bool,
}

impl<A, T> InFlight<A, T> {
    fn new(inner: Arc<CommandInner<A, T>>) -> Self {
        Self {
            inner,
            settled: false,
        }
    }

    fn settle(mut self, result: CommandResult<T>) -> CommandResult<T> {
        self.settled = true;
        let inner = Arc::clone(&self.inner);
        drop(self);
        if let Err(err) = &result {
            inner.report(err);
        }
        result
    }
}

impl<A, T> Drop for InFlight<A, T> {
    fn drop(&mut self) {
        self.inner.finish_one();
        if !self.settled {
            self.inner.report(&CommandError::Cancelled);
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 一次执行的结果句柄
///
/// 等待它得到动作的结果；直接丢弃不会取消动作。
pub struct Execution<T> {
    state: ExecutionState<T>,
}

enum ExecutionState<T> {
    Ready(Option<CommandResult<T>>),
    Spawned(JoinHandle<CommandResult<T>>),
}

impl<T> Execution<T> {
    fn ready(result: CommandResult<T>) -> Self {
        Self {
            state: ExecutionState::Ready(Some(result)),
        }
    }

    fn spawned(handle: JoinHandle<CommandResult<T>>) -> Self {
        Self {
            state: ExecutionState::Spawned(handle),
        }
    }

    /// 动作是否已经落定
    pub fn is_finished(&self) -> bool {
        match &self.state {
            ExecutionState::Ready(_) => true,
            ExecutionState::Spawned(handle) => handle.is_finished(),
        }
    }
}

impl<T> Unpin for Execution<T> {}

impl<T> Future for Execution<T> {
    type Output = CommandResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ExecutionState::Ready(result) => {
                Poll::Ready(result.take().expect("`Execution` polled after completion"))
            }
            ExecutionState::Spawned(handle) => Pin::new(handle).poll(cx).map(|joined| {
                joined.unwrap_or_else(|err| {
                    if err.is_cancelled() {
                        Err(CommandError::Cancelled)
                    } else {
                        Err(CommandError::ActionPanicked {
                            reason: err.to_string(),
                        })
                    }
                })
            }),
        }
    }
}

impl<T> fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("finished", &self.is_finished())
            .finish()
    }
}
