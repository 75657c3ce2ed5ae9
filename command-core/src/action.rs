//! 动作（Action）
//!
//! `Command` 所封装的实际操作。动作的种类即是否需要等待其完成：
//! - `Sync`：立即执行并返回，执行瞬间完成，不会改变 `is_executing`；
//! - `Async`：返回 future，`Command` 在其落定（成功/失败）之前视为执行中。
//!
//! 参数 `A` 原样透传给动作，不做任何校验。
//!
use futures_core::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub(crate) type SyncFn<A, T> = Arc<dyn Fn(A) -> anyhow::Result<T> + Send + Sync>;

pub(crate) type AsyncFn<A, T> =
    Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// 被命令封装的动作
pub enum Action<A, T> {
    Sync(SyncFn<A, T>),
    Async(AsyncFn<A, T>),
}

impl<A, T> Action<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// 同步动作
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// 异步动作：每次执行产生一个新的 future
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::Async(Arc::new(
            move |args| -> BoxFuture<'static, anyhow::Result<T>> { Box::pin(f(args)) },
        ))
    }
}

impl<A, T> Action<A, T> {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl<A, T> Clone for Action<A, T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<A, T> fmt::Debug for Action<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Action::Sync"),
            Self::Async(_) => f.write_str("Action::Async"),
        }
    }
}
