//! 命令绑定（CommandBinding）
//!
//! 命令公开契约的无界面消费者，把两个信号折叠为一个展示状态：
//! - `attach`：激活命令并跟随 `can_execute` / `is_executing`；
//! - `trigger`：仅在已挂载且可执行时调用 `execute`；
//! - `detach`：停止跟随；独占的命令会被一并取消订阅。
//!
use command_core::{Command, Execution, Lifecycle, Signal, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// 展示状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindingState {
    /// 不可交互（`!can_execute`）
    pub disabled: bool,
    /// 异步动作执行中
    pub executing: bool,
}

impl BindingState {
    const DETACHED: Self = Self {
        disabled: true,
        executing: false,
    };
}

/// 绑定是否独占命令
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingOwnership {
    /// 解绑时一并取消订阅命令
    Owned,
    /// 命令由多方共享，解绑时保持其运行
    Shared,
}

pub struct CommandBinding<A, T = ()> {
    command: Command<A, T>,
    ownership: BindingOwnership,
    state: Signal<BindingState>,
    // None 表示未挂载
    attachment: Mutex<Option<Attachment>>,
}

struct Attachment {
    // 解绑时先于 `DETACHED` 写入清除，迟到的信号回调不再改写展示状态
    live: Arc<AtomicBool>,
    links: Vec<Subscription>,
}

impl Attachment {
    fn release(self) {
        self.live.store(false, Ordering::SeqCst);
        drop(self.links);
    }
}

impl<A, T> CommandBinding<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    pub fn new(command: Command<A, T>, ownership: BindingOwnership) -> Self {
        Self {
            command,
            ownership,
            state: Signal::new(BindingState::DETACHED),
            attachment: Mutex::new(None),
        }
    }

    /// 独占命令的绑定
    pub fn owned(command: Command<A, T>) -> Self {
        Self::new(command, BindingOwnership::Owned)
    }

    /// 共享命令的绑定
    pub fn shared(command: Command<A, T>) -> Self {
        Self::new(command, BindingOwnership::Shared)
    }

    /// 挂载：激活命令并开始跟随其信号（幂等）
    ///
    /// 订阅在锁外建立：首个值的回调可能触达 `state_signal()` 的观察者。
    pub fn attach(&self) {
        if self.is_attached() {
            return;
        }

        self.command.subscribe();
        let live = Arc::new(AtomicBool::new(true));
        let links = if self.command.lifecycle() == Lifecycle::Disposed {
            debug!(command = self.command.name(), "attach to disposed command");
            Vec::new()
        } else {
            vec![
                self.follow_can_execute(live.clone()),
                self.follow_is_executing(live.clone()),
            ]
        };
        let attachment = Attachment { live, links };

        let stale = {
            let mut slot = self.lock();
            if slot.is_some() {
                Some(attachment)
            } else {
                *slot = Some(attachment);
                None
            }
        };
        // 并发挂载时保留先到者
        match stale {
            Some(stale) => stale.release(),
            None => debug!(command = self.command.name(), "binding attached"),
        }
    }

    fn follow_can_execute(&self, live: Arc<AtomicBool>) -> Subscription {
        let state = self.state.clone();
        self.command.can_execute_signal().observe(move |can| {
            state.update(|s| {
                if !live.load(Ordering::SeqCst) {
                    return *s;
                }
                BindingState {
                    disabled: !*can,
                    ..*s
                }
            });
        })
    }

    fn follow_is_executing(&self, live: Arc<AtomicBool>) -> Subscription {
        let state = self.state.clone();
        self.command.is_executing_signal().observe(move |busy| {
            state.update(|s| {
                if !live.load(Ordering::SeqCst) {
                    return *s;
                }
                BindingState {
                    executing: *busy,
                    ..*s
                }
            });
        })
    }

    /// 用户交互：仅在已挂载且可执行时执行
    pub fn trigger(&self, args: A) -> Option<Execution<T>> {
        if !self.is_attached() {
            debug!(command = self.command.name(), "trigger ignored, binding detached");
            return None;
        }
        if !self.command.can_execute() {
            debug!(command = self.command.name(), "trigger ignored, command disabled");
            return None;
        }
        self.command.execute(args)
    }

    /// 解绑（幂等）
    pub fn detach(&self) {
        let Some(attachment) = self.lock().take() else {
            return;
        };
        attachment.release();

        if self.ownership == BindingOwnership::Owned {
            self.command.unsubscribe();
        }
        self.state.set(BindingState::DETACHED);
        debug!(command = self.command.name(), "binding detached");
    }
}

impl<A, T> CommandBinding<A, T> {
    fn lock(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    pub fn ownership(&self) -> BindingOwnership {
        self.ownership
    }

    pub fn command(&self) -> &Command<A, T> {
        &self.command
    }

    /// 当前展示状态
    pub fn state(&self) -> BindingState {
        self.state.get()
    }

    /// 展示状态信号
    pub fn state_signal(&self) -> Signal<BindingState> {
        self.state.clone()
    }
}

impl<A, T> Drop for CommandBinding<A, T> {
    fn drop(&mut self) {
        let Some(attachment) = self.lock().take() else {
            return;
        };
        attachment.release();
        if self.ownership == BindingOwnership::Owned {
            self.command.unsubscribe();
        }
    }
}

impl<A, T> fmt::Debug for CommandBinding<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBinding")
            .field("command", &self.command)
            .field("ownership", &self.ownership)
            .field("attached", &self.is_attached())
            .field("state", &self.state.get())
            .finish()
    }
}
