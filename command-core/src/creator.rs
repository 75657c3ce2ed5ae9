//! 命令工厂（CommandCreator）
//!
//! 从“宿主对象 + 绑定函数 + 绑定时柯里化的参数”动态生成普通的 [`Command`]，
//! 使用方拿到的命令与直接构建的命令没有任何区别：
//! - `context`：共享的宿主对象，作为绑定函数的接收者；
//! - `params`：绑定时固定的参数，每次执行都会传给绑定函数；
//! - 其余选项（闸门、并发、名称、失败处理器）与 `Command::builder()` 一致。
//!
use crate::action::Action;
use crate::command::{Command, ErrorHandler};
use crate::gate::Executability;
use std::future::Future;
use std::sync::Arc;

/// 命令工厂
pub struct CommandCreator<C, P = ()> {
    context: Arc<C>,
    params: P,
    executability: Executability,
    allow_concurrent_execution: bool,
    name: Option<String>,
    on_error: Option<ErrorHandler>,
}

impl<C> CommandCreator<C, ()>
where
    C: Send + Sync + 'static,
{
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            params: (),
            executability: Executability::Always,
            allow_concurrent_execution: false,
            name: None,
            on_error: None,
        }
    }
}

impl<C, P> CommandCreator<C, P>
where
    C: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    /// 设置绑定时柯里化的参数
    pub fn with_params<Q>(self, params: Q) -> CommandCreator<C, Q> {
        CommandCreator {
            context: self.context,
            params,
            executability: self.executability,
            allow_concurrent_execution: self.allow_concurrent_execution,
            name: self.name,
            on_error: self.on_error,
        }
    }

    pub fn executability(mut self, executability: impl Into<Executability>) -> Self {
        self.executability = executability.into();
        self
    }

    pub fn allow_concurrent_execution(mut self, allow: bool) -> Self {
        self.allow_concurrent_execution = allow;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// 绑定同步函数：`f(&context, &params, args)`
    pub fn create_sync<A, T, F>(self, f: F) -> Command<A, T>
    where
        A: Send + 'static,
        T: Send + 'static,
        F: Fn(&C, &P, A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let context = Arc::clone(&self.context);
        let (params, rest) = self.split();
        rest.finish(Action::sync(move |args| f(&context, &params, args)))
    }

    /// 绑定异步函数：`f(context, params, args)`，每次执行克隆一份参数
    pub fn create_async<A, T, F, Fut>(self, f: F) -> Command<A, T>
    where
        A: Send + 'static,
        T: Send + 'static,
        P: Clone,
        F: Fn(Arc<C>, P, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let context = Arc::clone(&self.context);
        let (params, rest) = self.split();
        rest.finish(Action::future(move |args| {
            f(Arc::clone(&context), params.clone(), args)
        }))
    }

    fn split(self) -> (P, CommandCreator<C, ()>) {
        let rest = CommandCreator {
            context: self.context,
            params: (),
            executability: self.executability,
            allow_concurrent_execution: self.allow_concurrent_execution,
            name: self.name,
            on_error: self.on_error,
        };
        (self.params, rest)
    }
}

impl<C> CommandCreator<C, ()>
where
    C: Send + Sync + 'static,
{
    fn finish<A, T>(self, action: Action<A, T>) -> Command<A, T>
    where
        A: Send + 'static,
        T: Send + 'static,
    {
        Command::builder()
            .action(action)
            .executability(self.executability)
            .allow_concurrent_execution(self.allow_concurrent_execution)
            .maybe_name(self.name)
            .maybe_on_error(self.on_error)
            .build()
    }
}
